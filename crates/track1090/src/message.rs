/**
 * The decoded downlink message contract.
 *
 * The demodulator and the network readers live upstream of this crate; they
 * agree to deliver one [`ModesMessage`] per accepted frame, with every
 * observable the frame carried filled in as `Some`. The tracker never looks
 * at raw bits.
 */
use serde::{Deserialize, Serialize};

/// Flag bit marking a hex address outside the ICAO allocation (TIS-B track
/// files, anonymized addresses, ...).
pub const NON_ICAO_ADDRESS: u32 = 1 << 24;

/// RF timestamp sentinel used by UAT→1090 translators, which cannot provide
/// a usable 12 MHz clock value.
pub const MAGIC_UAT_TIMESTAMP: u64 = u64::MAX;

/**
 * Where a piece of data came from, ordered from least to most trustworthy.
 *
 * The derived `Ord` carries the acceptance semantics: on a fresh field only
 * an equal or better source may overwrite (see
 * [`crate::validity::DataValidity`]).
 */
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    #[default]
    Invalid,
    /// Position deduced relative to a rough receiver location.
    Indirect,
    ModeAc,
    Mlat,
    ModeS,
    AdsR,
    TisB,
    Jaero,
    Adsb,
}

impl DataSource {
    pub fn is_valid(self) -> bool {
        self != DataSource::Invalid
    }
}

/// The addressing scheme the hex identifier of a message belongs to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AddrType {
    #[default]
    Unknown,
    /// ADS-B with an ICAO address
    Adsb,
    /// ADS-B with a self-assigned address
    AdsbOther,
    /// TIS-B with a track file address
    Tisb,
    /// TIS-B relaying an ICAO address
    TisbIcao,
    /// ADS-R relaying an ICAO address
    AdsrIcao,
    /// Mode S only
    ModeS,
    /// Reserved ADS-B address space
    AdsbReserved,
}

/// Air/ground status as decoded from capability and flight status fields.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AirGround {
    #[default]
    Invalid,
    Ground,
    Airborne,
    Uncertain,
}

/// Which altitude the automation is flying (BDS 6,2).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NavAltitudeSource {
    #[default]
    Invalid,
    Unknown,
    Aircraft,
    Mcp,
    Fms,
}

/// SIL probability basis (per sample / per flight hour).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SilType {
    #[default]
    Invalid,
    Unknown,
    PerSample,
    PerHour,
}

/// The three CPR encodings found in the wild. Surface and airborne frames
/// are never paired for a global decode.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CprKind {
    #[default]
    Airborne,
    Surface,
    Coarse,
}

/// One undecoded CPR half, as carried by a position message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CprFragment {
    pub lat: u32,
    pub lon: u32,
    pub odd: bool,
    pub kind: CprKind,
    pub nic: u8,
    pub rc: u32,
}

/**
 * One decoded downlink message. Every observable is optional; the tracker
 * applies each `Some` field through the per-field validity gates.
 */
#[derive(Debug, Clone, Default)]
pub struct ModesMessage {
    pub addr: u32,
    pub addrtype: AddrType,
    pub source: DataSource,
    pub receiver_id: u64,
    /// Wall clock at reception, milliseconds since the epoch
    pub timestamp: i64,
    /// RF clock of the frame (12 MHz), [`MAGIC_UAT_TIMESTAMP`] for UAT relays
    pub timestamp_msg: u64,
    /// Downlink format
    pub msgtype: u8,
    /// Signal amplitude, squared and normalized to [0, 1]
    pub signal_level: f64,

    pub cpr: Option<CprFragment>,
    /// A position decoded upstream (MLAT results, JAERO feeds); never set
    /// together with a CPR fragment
    pub decoded_position: Option<(f64, f64)>,

    pub callsign: Option<[u8; 8]>,
    /// Four octal digits, hex encoded (0x7700 for squawk 7700)
    pub squawk: Option<u16>,
    pub emergency: Option<u8>,
    pub category: Option<u8>,
    pub airground: Option<AirGround>,
    pub alert: Option<bool>,
    pub spi: Option<bool>,

    pub baro_alt: Option<i32>,
    pub geom_alt: Option<i32>,
    pub baro_rate: Option<i32>,
    pub geom_rate: Option<i32>,
    pub gs: Option<f32>,
    pub ias: Option<u32>,
    pub tas: Option<u32>,
    pub mach: Option<f64>,
    pub track: Option<f32>,
    pub track_rate: Option<f32>,
    pub roll: Option<f32>,
    pub mag_heading: Option<f32>,
    pub true_heading: Option<f32>,

    pub nav_qnh: Option<f32>,
    pub nav_heading: Option<f32>,
    pub nav_altitude_mcp: Option<u32>,
    pub nav_altitude_fms: Option<u32>,
    pub nav_altitude_src: Option<NavAltitudeSource>,
    /// Enabled autopilot modes, bitset
    pub nav_modes: Option<u8>,

    pub nic_a: Option<u8>,
    pub nic_c: Option<u8>,
    pub nic_baro: Option<u8>,
    pub nac_p: Option<u8>,
    pub nac_v: Option<u8>,
    pub sil: Option<u8>,
    pub sil_type: Option<SilType>,
    pub gva: Option<u8>,
    pub sda: Option<u8>,
    /// ADS-B version from operational status; stored per address type
    pub version: Option<i32>,
    /// Number of receivers involved in an MLAT solution
    pub mlat_receiver_count: Option<u16>,
}

impl ModesMessage {
    pub fn non_icao(&self) -> bool {
        self.addr & NON_ICAO_ADDRESS != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_order() {
        use DataSource::*;
        let order =
            [Invalid, Indirect, ModeAc, Mlat, ModeS, AdsR, TisB, Jaero, Adsb];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1], "{:?} < {:?}", pair[0], pair[1]);
        }
        assert!(Adsb > Mlat);
        assert!(!Invalid.is_valid());
        assert!(Indirect.is_valid());
    }
}
