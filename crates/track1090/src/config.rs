use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/**
 * Runtime tunables for the tracker.
 *
 * The daemon builds one `Config` at startup (typically deserialized from its
 * configuration file) and hands it to [`crate::track::Tracker::new`]; there
 * is no process-wide mutable state, so tests can construct as many
 * independent trackers as they need.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cap on the per-parity position reliability counters, and the basis
    /// for the reliability required before a position feeds receiver
    /// coverage estimation.
    pub position_persistence: u32,

    /// Both parity counters must reach this threshold before a position is
    /// considered reliable.
    pub json_reliable: u32,

    /// Validity timeout for JAERO positions, much longer than the usual
    /// expiration because satellite relays deliver updates minutes apart.
    pub track_expire_jaero: i64,

    /// An aircraft is deleted once nothing has been heard from it for this
    /// long and every tracked field has expired.
    pub aircraft_timeout: i64,

    /// Focus mode (viewadsb): lowers the sample counts required before a
    /// receiver qualifies as a reference location.
    pub receiver_focus: bool,

    /// Emit per-aircraft receiver counts in the binary snapshot.
    pub json_globe_index: bool,

    /// Estimate positions relative to the receiver location and track them
    /// as indirect data with a short expiration.
    pub debug_rough_receiver_location: bool,

    /// Diagnostic logging for receiver coverage and reference lookups.
    pub debug_receiver: bool,

    /// Diagnostic logging for receiver quarantines.
    pub debug_garbage: bool,

    /// Write db.json when the aircraft database is swapped in.
    pub debug_db_json: bool,

    /// Path to the gzipped aircraft metadata CSV; `None` disables the
    /// database.
    pub db_file: Option<PathBuf>,

    /// Output directory for the JSON artifacts (receivers.json, db.json).
    pub json_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            position_persistence: 4,
            json_reliable: 1,
            track_expire_jaero: 33 * 60 * 1000,
            aircraft_timeout: 10 * 60 * 1000,
            receiver_focus: false,
            json_globe_index: false,
            debug_rough_receiver_location: false,
            debug_receiver: false,
            debug_garbage: false,
            debug_db_json: false,
            db_file: None,
            json_dir: None,
        }
    }
}

impl Config {
    /// Reliability required on both parities before a position is used to
    /// grow a receiver coverage box.
    pub fn reliability_required(&self) -> u32 {
        if self.receiver_focus {
            std::cmp::min(2, self.position_persistence)
        } else {
            self.position_persistence * 3 / 4
        }
    }
}
