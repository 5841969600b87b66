/**
 * The per-aircraft record.
 *
 * Every observable carries its own [`DataValidity`]: a value is defined if
 * and only if its validity source is valid. The record itself never decides
 * whether an update is acceptable, that is the update pipeline's job
 * ([`crate::track`]); it only stores state and answers reliability
 * questions.
 */
use crate::config::Config;
use crate::message::{
    AddrType, AirGround, CprKind, DataSource, NavAltitudeSource, SilType,
};
use crate::trace::Trace;
use crate::validity::{DataValidity, TRACK_EXPIRE, TRACK_EXPIRE_LONG};

/// Baro altitude reliability counter cap.
pub const ALTITUDE_BARO_RELIABLE_MAX: i32 = 20;

/// Slots in the contributing-receiver ring.
pub const RECEIVER_ID_BUFFER: usize = 12;

/// Slots in the discarded-position ring.
pub const DISCARD_CACHE: usize = 4;

/// A reliable position keeps serving as fallback for this long.
pub const POS_RELIABLE_RETENTION: i64 = 14 * 24 * 3600 * 1000;

pub const NOGPS_DWELL: i64 = 15 * 60 * 1000;
pub const NOGPS_MAX: u16 = 20;
pub const NOGPS_SHOW: u16 = 18;

/// One CPR half stored for pairing; the reception timestamp lives in the
/// matching validity record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CprCell {
    pub lat: u32,
    pub lon: u32,
    pub nic: u8,
    pub rc: u32,
    pub kind: CprKind,
    pub receiver_id: u64,
}

impl CprCell {
    pub fn fragment(&self, odd: bool) -> crate::message::CprFragment {
        crate::message::CprFragment {
            lat: self.lat,
            lon: self.lon,
            odd,
            kind: self.kind,
            nic: self.nic,
            rc: self.rc,
        }
    }
}

/// A position that failed the plausibility checks, kept around so repeat
/// offenders can be told apart from one-off garbage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Discarded {
    pub cpr_lat: u32,
    pub cpr_lon: u32,
    pub ts: i64,
    pub receiver_id: u64,
}

#[derive(Debug, Default)]
pub struct Aircraft {
    /// ICAO address, immutable for the life of the record
    pub addr: u32,
    /// Directory chain link, owned by [`crate::directory::AircraftTable`]
    pub(crate) next: u32,

    pub addrtype: AddrType,
    pub addrtype_updated: i64,

    /// Last message of any kind, milliseconds since the epoch
    pub seen: i64,
    /// Last position
    pub seen_pos: i64,
    pub messages: u32,

    // Last 8 signal amplitudes
    pub signal_level: [f64; 8],
    pub signal_next: u32,

    // identity
    pub callsign: [u8; 8],
    pub squawk: u16,
    /// A squawk needs two identical observations before it is accepted
    pub squawk_tentative: u16,
    pub category: u8,
    pub category_updated: i64,
    pub emergency: u8,
    pub airground: AirGround,
    pub alert: bool,
    pub spi: bool,

    // static database fields
    pub registration: String,
    pub type_code: String,
    pub type_long: String,
    pub own_op: String,
    pub year: String,
    pub db_flags: u8,

    // position
    pub lat: f64,
    pub lon: f64,
    pub pos_nic: u8,
    pub pos_rc: u32,
    pub pos_surface: bool,
    pub last_cpr_kind: CprKind,
    /// Most recent position that ever passed the reliability gate; never
    /// cleared, only overwritten
    pub lat_reliable: f64,
    pub lon_reliable: f64,
    pub pos_nic_reliable: u8,
    pub pos_rc_reliable: u32,
    /// Previous position for the speed check
    pub prev_lat: f64,
    pub prev_lon: f64,
    pub prev_pos_time: i64,

    // altitude
    pub baro_alt: i32,
    pub alt_reliable: i32,
    pub geom_alt: i32,
    pub geom_delta: i32,
    pub baro_rate: i32,
    pub geom_rate: i32,

    // speeds and angles
    pub gs: f32,
    pub gs_last_pos: f32,
    pub ias: u32,
    pub tas: u32,
    pub mach: f64,
    pub track: f32,
    pub track_rate: f32,
    pub roll: f32,
    pub calc_track: f32,
    pub mag_heading: f32,
    pub true_heading: f32,

    // CPR working state
    pub cpr_odd: CprCell,
    pub cpr_even: CprCell,

    // intent
    pub nav_qnh: f32,
    pub nav_heading: f32,
    pub nav_altitude_mcp: u32,
    pub nav_altitude_fms: u32,
    pub nav_altitude_src: NavAltitudeSource,
    pub nav_modes: u8,

    // quality
    pub nic_a: u8,
    pub nic_c: u8,
    pub nic_baro: u8,
    pub nac_p: u8,
    pub nac_v: u8,
    pub sil: u8,
    pub sil_type: SilType,
    pub gva: u8,
    pub sda: u8,
    /// ADS-B version; -1 until an operational status message is seen
    pub adsb_version: i32,
    pub adsr_version: i32,
    pub tisb_version: i32,

    // reliability
    pub pos_reliable_odd: f32,
    pub pos_reliable_even: f32,
    pub track_unreliable: i32,
    pub speed_unreliable: i32,
    pub disc_cache: [Discarded; DISCARD_CACHE],
    pub disc_cache_index: u32,

    // contributing receivers
    pub receiver_ids: [u16; RECEIVER_ID_BUFFER],
    pub receiver_ids_next: u16,
    pub receiver_count_mlat: u16,
    pub receiver_id: u64,
    pub last_pos_receiver_id: u64,

    // housekeeping
    pub seen_pos_reliable: i64,
    pub seen_adsb_reliable: i64,
    pub seen_pos_global: i64,
    pub nogps_counter: u16,
    pub rr_lat: f32,
    pub rr_lon: f32,
    pub rr_seen: i64,
    pub magnetic_declination: f64,
    pub updated_declination: i64,
    pub local_cpr_allow_ac_rel: bool,
    pub surface_cpr_allow_ac_rel: bool,

    // trace
    pub trace: Trace,
    pub trace_next_mw: i64,
    pub trace_next_perm: i64,

    // validities
    pub callsign_valid: DataValidity,
    pub baro_alt_valid: DataValidity,
    pub geom_alt_valid: DataValidity,
    pub geom_delta_valid: DataValidity,
    pub gs_valid: DataValidity,
    pub ias_valid: DataValidity,
    pub tas_valid: DataValidity,
    pub mach_valid: DataValidity,
    pub track_valid: DataValidity,
    pub track_rate_valid: DataValidity,
    pub roll_valid: DataValidity,
    pub mag_heading_valid: DataValidity,
    pub true_heading_valid: DataValidity,
    pub baro_rate_valid: DataValidity,
    pub geom_rate_valid: DataValidity,
    pub nic_a_valid: DataValidity,
    pub nic_c_valid: DataValidity,
    pub nic_baro_valid: DataValidity,
    pub nac_p_valid: DataValidity,
    pub nac_v_valid: DataValidity,
    pub sil_valid: DataValidity,
    pub gva_valid: DataValidity,
    pub sda_valid: DataValidity,
    pub squawk_valid: DataValidity,
    pub emergency_valid: DataValidity,
    pub airground_valid: DataValidity,
    pub nav_qnh_valid: DataValidity,
    pub nav_altitude_mcp_valid: DataValidity,
    pub nav_altitude_fms_valid: DataValidity,
    pub nav_altitude_src_valid: DataValidity,
    pub nav_heading_valid: DataValidity,
    pub nav_modes_valid: DataValidity,
    pub cpr_odd_valid: DataValidity,
    pub cpr_even_valid: DataValidity,
    pub position_valid: DataValidity,
    pub alert_valid: DataValidity,
    pub spi_valid: DataValidity,
}

impl Aircraft {
    pub fn new(addr: u32) -> Self {
        Aircraft {
            addr,
            next: u32::MAX,
            addrtype: AddrType::Unknown,
            adsb_version: -1,
            adsr_version: -1,
            tisb_version: -1,
            local_cpr_allow_ac_rel: true,
            surface_cpr_allow_ac_rel: true,
            ..Default::default()
        }
    }

    /**
     * A position is reliable once both parity counters reach the
     * `json_reliable` threshold. MLAT, JAERO and indirect positions never
     * pair CPR halves, so they bypass the counter gate and count as
     * reliable while valid.
     */
    pub fn pos_reliable(&self, config: &Config) -> bool {
        if !self.position_valid.is_valid() {
            return false;
        }
        if matches!(
            self.position_valid.source,
            DataSource::Jaero | DataSource::Mlat | DataSource::Indirect
        ) {
            return true;
        }
        let reliable = config.json_reliable as f32;
        self.pos_reliable_odd >= reliable && self.pos_reliable_even >= reliable
    }

    pub fn alt_baro_reliable(&self, config: &Config) -> bool {
        if !self.baro_alt_valid.is_valid() {
            return false;
        }
        if self.position_valid.source == DataSource::Jaero {
            return true;
        }
        self.alt_reliable >= config.json_reliable as i32 + 1
    }

    pub fn push_signal(&mut self, level: f64) {
        self.signal_next = (self.signal_next + 1) % 8;
        self.signal_level[self.signal_next as usize] = level;
    }

    /// Average the signal ring into one byte of dynamic range.
    pub fn signal_8bit(&self) -> u8 {
        let mean = self.signal_level.iter().sum::<f64>() / 8.0;
        let mut signal = libm::sqrt(mean) * 255.0;
        if signal > 255.0 {
            signal = 255.0;
        }
        if signal < 1.0 && signal > 0.0 {
            signal = 1.0;
        }
        libm::rint(signal) as u8
    }

    /// Note a contributing receiver (16 bit compressed id).
    pub fn note_receiver(&mut self, id16: u16) {
        self.receiver_ids_next =
            (self.receiver_ids_next + 1) % RECEIVER_ID_BUFFER as u16;
        self.receiver_ids[self.receiver_ids_next as usize] = id16;
    }

    /// Number of distinct non-zero receiver ids in the ring.
    pub fn distinct_receivers(&self) -> u16 {
        let mut seen = [0u16; RECEIVER_ID_BUFFER];
        let mut count = 0usize;
        for &id in &self.receiver_ids {
            if id != 0 && !seen[..count].contains(&id) {
                seen[count] = id;
                count += 1;
            }
        }
        count as u16
    }

    pub fn push_discarded(&mut self, disc: Discarded) {
        self.disc_cache_index =
            (self.disc_cache_index + 1) % DISCARD_CACHE as u32;
        self.disc_cache[self.disc_cache_index as usize] = disc;
    }

    /**
     * Drive the validity state machine for every field. Slowly refreshed
     * fields (intent and quality codes, callsign, squawk) live on the long
     * timeout, the kinematics on the regular one.
     */
    pub fn update_validities(&mut self, now: i64, config: &Config) {
        macro_rules! refresh {
            ($($field:ident => $timeout:expr),* $(,)?) => {
                $( self.$field.refresh(now, $timeout, config); )*
            };
        }
        refresh!(
            callsign_valid => TRACK_EXPIRE_LONG,
            baro_alt_valid => TRACK_EXPIRE,
            geom_alt_valid => TRACK_EXPIRE,
            geom_delta_valid => TRACK_EXPIRE,
            gs_valid => TRACK_EXPIRE,
            ias_valid => TRACK_EXPIRE,
            tas_valid => TRACK_EXPIRE,
            mach_valid => TRACK_EXPIRE,
            track_valid => TRACK_EXPIRE,
            track_rate_valid => TRACK_EXPIRE,
            roll_valid => TRACK_EXPIRE,
            mag_heading_valid => TRACK_EXPIRE,
            true_heading_valid => TRACK_EXPIRE,
            baro_rate_valid => TRACK_EXPIRE,
            geom_rate_valid => TRACK_EXPIRE,
            nic_a_valid => TRACK_EXPIRE_LONG,
            nic_c_valid => TRACK_EXPIRE_LONG,
            nic_baro_valid => TRACK_EXPIRE_LONG,
            nac_p_valid => TRACK_EXPIRE_LONG,
            nac_v_valid => TRACK_EXPIRE_LONG,
            sil_valid => TRACK_EXPIRE_LONG,
            gva_valid => TRACK_EXPIRE_LONG,
            sda_valid => TRACK_EXPIRE_LONG,
            squawk_valid => TRACK_EXPIRE_LONG,
            emergency_valid => TRACK_EXPIRE_LONG,
            airground_valid => TRACK_EXPIRE,
            nav_qnh_valid => TRACK_EXPIRE_LONG,
            nav_altitude_mcp_valid => TRACK_EXPIRE_LONG,
            nav_altitude_fms_valid => TRACK_EXPIRE_LONG,
            nav_altitude_src_valid => TRACK_EXPIRE_LONG,
            nav_heading_valid => TRACK_EXPIRE_LONG,
            nav_modes_valid => TRACK_EXPIRE_LONG,
            cpr_odd_valid => TRACK_EXPIRE,
            cpr_even_valid => TRACK_EXPIRE,
            position_valid => TRACK_EXPIRE,
            alert_valid => TRACK_EXPIRE,
            spi_valid => TRACK_EXPIRE,
        );
    }

    /// All validities expired: nothing left worth keeping.
    pub fn all_invalid(&self) -> bool {
        !(self.callsign_valid.is_valid()
            || self.baro_alt_valid.is_valid()
            || self.geom_alt_valid.is_valid()
            || self.geom_delta_valid.is_valid()
            || self.gs_valid.is_valid()
            || self.ias_valid.is_valid()
            || self.tas_valid.is_valid()
            || self.mach_valid.is_valid()
            || self.track_valid.is_valid()
            || self.track_rate_valid.is_valid()
            || self.roll_valid.is_valid()
            || self.mag_heading_valid.is_valid()
            || self.true_heading_valid.is_valid()
            || self.baro_rate_valid.is_valid()
            || self.geom_rate_valid.is_valid()
            || self.nic_a_valid.is_valid()
            || self.nic_c_valid.is_valid()
            || self.nic_baro_valid.is_valid()
            || self.nac_p_valid.is_valid()
            || self.nac_v_valid.is_valid()
            || self.sil_valid.is_valid()
            || self.gva_valid.is_valid()
            || self.sda_valid.is_valid()
            || self.squawk_valid.is_valid()
            || self.emergency_valid.is_valid()
            || self.airground_valid.is_valid()
            || self.nav_qnh_valid.is_valid()
            || self.nav_altitude_mcp_valid.is_valid()
            || self.nav_altitude_fms_valid.is_valid()
            || self.nav_altitude_src_valid.is_valid()
            || self.nav_heading_valid.is_valid()
            || self.nav_modes_valid.is_valid()
            || self.cpr_odd_valid.is_valid()
            || self.cpr_even_valid.is_valid()
            || self.position_valid.is_valid()
            || self.alert_valid.is_valid()
            || self.spi_valid.is_valid())
    }
}
