#![doc = include_str!("../readme.md")]

pub mod aircraft;
pub mod bincraft;
pub mod config;
pub mod db;
pub mod directory;
pub mod geo;
pub mod message;
pub mod output;
pub mod receiver;
pub mod trace;
pub mod track;
pub mod validity;

pub mod prelude {
    pub use crate::aircraft::Aircraft;
    pub use crate::bincraft::{to_bin_craft, BinCraft};
    pub use crate::config::Config;
    pub use crate::db::AircraftDb;
    pub use crate::directory::AircraftTable;
    pub use crate::message::{
        AddrType, AirGround, CprFragment, CprKind, DataSource, ModesMessage,
    };
    pub use crate::receiver::{Receiver, ReceiverTable};
    pub use crate::track::{CprDecoder, NullDecoder, Stats, Tracker};
    pub use crate::validity::DataValidity;
}
