/**
 * The binary snapshot record, one fixed-layout 112 byte struct per
 * aircraft, read by consumers as a packed little-endian C structure.
 *
 * Layout (offsets in bytes):
 *
 * |   0 | hex u32           |  16 | seen u16 ×100ms       |
 * |   4 | lat i32 ×1e6      |  18 | seen_pos u16 ×100ms   |
 * |   8 | lon i32 ×1e6      |  20 | baro_alt i16 ÷25      |
 * |  12 | valid u32         |  22 | geom_alt i16 ÷25      |
 * |  24 | baro_rate i16 ÷8  |  26 | geom_rate i16 ÷8      |
 * |  28 | gs i16 ×10        |  30 | ias u16               |
 * |  32 | tas u16           |  34 | mach i16 ×1000        |
 * |  36 | track i16 ×90     |  38 | track_rate i16 ×100   |
 * |  40 | roll i16 ×100     |  42 | mag_heading i16 ×90   |
 * |  44 | true_heading ×90  |  46 | nav_heading i16 ×90   |
 * |  48 | nav_qnh i16 ×10   |  50 | nav_altitude_mcp u16 ÷4 |
 * |  52 | nav_alt_fms ÷4    |  54 | squawk u16            |
 * |  56 | messages u16      |  58 | pos_rc u16            |
 * |  60 | receiver_count    |  62 | nav_modes u8          |
 * |  63 | pos_nic u8        |  64 | callsign [u8;8]       |
 * |  72 | registration [12] |  84 | type_code [u8;4]      |
 * |  88 | category .. extra_flags, one byte each          |
 * | 108 | padding [u8;4]    | 112 | total                 |
 *
 * The `valid` word carries one bit per maskable field (see the `VALID_*`
 * constants); masked fields are emitted as zero.
 */
use crate::aircraft::{Aircraft, NOGPS_SHOW, POS_RELIABLE_RETENTION};
use crate::config::Config;
use crate::message::DataSource;
use deku::prelude::*;

pub const VALID_CALLSIGN: u32 = 1 << 0;
pub const VALID_POSITION: u32 = 1 << 1;
pub const VALID_BARO_ALT: u32 = 1 << 2;
pub const VALID_GEOM_ALT: u32 = 1 << 3;
pub const VALID_GS: u32 = 1 << 4;
pub const VALID_IAS: u32 = 1 << 5;
pub const VALID_TAS: u32 = 1 << 6;
pub const VALID_MACH: u32 = 1 << 7;
pub const VALID_TRACK: u32 = 1 << 8;
pub const VALID_TRACK_RATE: u32 = 1 << 9;
pub const VALID_ROLL: u32 = 1 << 10;
pub const VALID_MAG_HEADING: u32 = 1 << 11;
pub const VALID_TRUE_HEADING: u32 = 1 << 12;
pub const VALID_BARO_RATE: u32 = 1 << 13;
pub const VALID_GEOM_RATE: u32 = 1 << 14;
pub const VALID_SQUAWK: u32 = 1 << 15;
pub const VALID_EMERGENCY: u32 = 1 << 16;
pub const VALID_CATEGORY: u32 = 1 << 17;
pub const VALID_NAV_QNH: u32 = 1 << 18;
pub const VALID_NAV_ALTITUDE_MCP: u32 = 1 << 19;
pub const VALID_NAV_ALTITUDE_FMS: u32 = 1 << 20;
pub const VALID_NAV_ALTITUDE_SRC: u32 = 1 << 21;
pub const VALID_NAV_HEADING: u32 = 1 << 22;
pub const VALID_NAV_MODES: u32 = 1 << 23;
pub const VALID_NIC_A: u32 = 1 << 24;
pub const VALID_NIC_C: u32 = 1 << 25;
pub const VALID_NIC_BARO: u32 = 1 << 26;
pub const VALID_NAC_P: u32 = 1 << 27;
pub const VALID_NAC_V: u32 = 1 << 28;
pub const VALID_SIL: u32 = 1 << 29;
pub const VALID_GVA: u32 = 1 << 30;
pub const VALID_SDA: u32 = 1 << 31;

pub const FLAG_NOGPS: u8 = 1 << 0;
pub const FLAG_ALERT: u8 = 1 << 1;
pub const FLAG_SPI: u8 = 1 << 2;
pub const FLAG_ALERT_VALID: u8 = 1 << 3;
pub const FLAG_SPI_VALID: u8 = 1 << 4;
pub const FLAG_AIRGROUND_VALID: u8 = 1 << 5;

/// "version unknown" marker for the 4 bit wire encodings
const VERSION_UNKNOWN: u8 = 15;

#[derive(Debug, Clone, PartialEq, DekuWrite)]
#[deku(endian = "little")]
pub struct BinCraft {
    pub hex: u32,
    pub lat: i32,
    pub lon: i32,
    pub valid: u32,

    pub seen: u16,
    pub seen_pos: u16,
    pub baro_alt: i16,
    pub geom_alt: i16,
    pub baro_rate: i16,
    pub geom_rate: i16,
    pub gs: i16,
    pub ias: u16,
    pub tas: u16,
    pub mach: i16,
    pub track: i16,
    pub track_rate: i16,
    pub roll: i16,
    pub mag_heading: i16,
    pub true_heading: i16,
    pub nav_heading: i16,
    pub nav_qnh: i16,
    pub nav_altitude_mcp: u16,
    pub nav_altitude_fms: u16,
    pub squawk: u16,
    pub messages: u16,
    pub pos_rc: u16,
    pub receiver_count: u16,

    pub nav_modes: u8,
    pub pos_nic: u8,
    pub callsign: [u8; 8],
    pub registration: [u8; 12],
    pub type_code: [u8; 4],

    pub category: u8,
    pub emergency: u8,
    pub airground: u8,
    pub addrtype: u8,
    pub nav_altitude_src: u8,
    pub sil_type: u8,
    pub adsb_version: u8,
    pub adsr_version: u8,
    pub tisb_version: u8,
    pub nic_a: u8,
    pub nic_c: u8,
    pub nic_baro: u8,
    pub nac_p: u8,
    pub nac_v: u8,
    pub sil: u8,
    pub gva: u8,
    pub sda: u8,
    pub signal: u8,
    pub db_flags: u8,
    pub extra_flags: u8,

    pub padding: [u8; 4],
}

/// Record size on the wire.
pub const BIN_CRAFT_SIZE: usize = 112;

fn elapsed_100ms(now: i64, then: i64) -> u16 {
    ((now - then).max(0) / 100).min(u16::MAX as i64) as u16
}

fn scale_f32(value: f32, factor: f32) -> i16 {
    libm::rintf(value * factor) as i16
}

fn scale_f64(value: f64, factor: f64) -> i16 {
    libm::rint(value * factor) as i16
}

fn version_byte(version: i32) -> u8 {
    if version < 0 {
        VERSION_UNKNOWN
    } else {
        version as u8
    }
}

fn str_bytes<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    for (slot, byte) in out.iter_mut().zip(s.as_bytes()) {
        *slot = *byte;
    }
    out
}

fn flag(valid: &mut u32, bit: u32, v: &crate::validity::DataValidity) -> bool {
    let ok = v.is_valid();
    if ok {
        *valid |= bit;
    }
    ok
}

/**
 * Project one aircraft into its snapshot record. Pure function of the
 * record, the clock and the configuration: identical inputs give
 * byte-identical output.
 */
pub fn to_bin_craft(
    a: &Aircraft,
    now: i64,
    config: &Config,
    has_db: bool,
) -> BinCraft {
    let mut valid = 0u32;

    let callsign_valid = flag(&mut valid, VALID_CALLSIGN, &a.callsign_valid);
    let mut callsign = [0u8; 8];
    if callsign_valid {
        callsign = a.callsign;
    }

    let pos_reliable = a.pos_reliable(config);
    let (seen_pos, lat, lon, pos_nic, pos_rc) = if pos_reliable {
        valid |= VALID_POSITION;
        (
            elapsed_100ms(now, a.seen_pos),
            libm::rint(a.lat * 1e6) as i32,
            libm::rint(a.lon * 1e6) as i32,
            a.pos_nic,
            a.pos_rc,
        )
    } else if now < a.seen_pos_reliable + POS_RELIABLE_RETENTION {
        // keep showing the last reliable position, clearly aged
        (
            elapsed_100ms(now, a.seen_pos_reliable),
            libm::rint(a.lat_reliable * 1e6) as i32,
            libm::rint(a.lon_reliable * 1e6) as i32,
            a.pos_nic_reliable,
            a.pos_rc_reliable,
        )
    } else {
        (0, 0, 0, 0, 0)
    };

    let baro_alt = if a.alt_baro_reliable(config) {
        valid |= VALID_BARO_ALT;
        libm::rint(a.baro_alt as f64 / 25.0) as i16
    } else {
        0
    };
    let geom_alt = if flag(&mut valid, VALID_GEOM_ALT, &a.geom_alt_valid) {
        libm::rint(a.geom_alt as f64 / 25.0) as i16
    } else {
        0
    };
    let baro_rate = if flag(&mut valid, VALID_BARO_RATE, &a.baro_rate_valid) {
        libm::rint(a.baro_rate as f64 / 8.0) as i16
    } else {
        0
    };
    let geom_rate = if flag(&mut valid, VALID_GEOM_RATE, &a.geom_rate_valid) {
        libm::rint(a.geom_rate as f64 / 8.0) as i16
    } else {
        0
    };

    let gs = if flag(&mut valid, VALID_GS, &a.gs_valid) {
        scale_f32(a.gs, 10.0)
    } else {
        0
    };
    let ias = if flag(&mut valid, VALID_IAS, &a.ias_valid) {
        a.ias as u16
    } else {
        0
    };
    let tas = if flag(&mut valid, VALID_TAS, &a.tas_valid) {
        a.tas as u16
    } else {
        0
    };
    let mach = if flag(&mut valid, VALID_MACH, &a.mach_valid) {
        scale_f64(a.mach, 1000.0)
    } else {
        0
    };

    // the track falls back to one computed from consecutive positions
    let track = if flag(&mut valid, VALID_TRACK, &a.track_valid) {
        scale_f32(a.track, 90.0)
    } else {
        scale_f32(a.calc_track, 90.0)
    };
    let track_rate = if flag(&mut valid, VALID_TRACK_RATE, &a.track_rate_valid) {
        scale_f32(a.track_rate, 100.0)
    } else {
        0
    };
    let roll = if flag(&mut valid, VALID_ROLL, &a.roll_valid) {
        scale_f32(a.roll, 100.0)
    } else {
        0
    };
    let mag_heading = if flag(&mut valid, VALID_MAG_HEADING, &a.mag_heading_valid) {
        scale_f32(a.mag_heading, 90.0)
    } else {
        0
    };
    let true_heading = if flag(&mut valid, VALID_TRUE_HEADING, &a.true_heading_valid) {
        scale_f32(a.true_heading, 90.0)
    } else {
        0
    };

    let squawk = if flag(&mut valid, VALID_SQUAWK, &a.squawk_valid) {
        a.squawk
    } else {
        0
    };
    let emergency = if flag(&mut valid, VALID_EMERGENCY, &a.emergency_valid) {
        a.emergency
    } else {
        0
    };
    let category =
        if now < a.category_updated + config.track_expire_jaero {
            valid |= VALID_CATEGORY;
            a.category
        } else {
            0
        };

    let nav_qnh = if flag(&mut valid, VALID_NAV_QNH, &a.nav_qnh_valid) {
        scale_f32(a.nav_qnh, 10.0)
    } else {
        0
    };
    let nav_altitude_mcp =
        if flag(&mut valid, VALID_NAV_ALTITUDE_MCP, &a.nav_altitude_mcp_valid) {
            libm::rint(a.nav_altitude_mcp as f64 / 4.0) as u16
        } else {
            0
        };
    let nav_altitude_fms =
        if flag(&mut valid, VALID_NAV_ALTITUDE_FMS, &a.nav_altitude_fms_valid) {
            libm::rint(a.nav_altitude_fms as f64 / 4.0) as u16
        } else {
            0
        };
    let nav_altitude_src =
        if flag(&mut valid, VALID_NAV_ALTITUDE_SRC, &a.nav_altitude_src_valid) {
            a.nav_altitude_src as u8
        } else {
            0
        };
    let nav_heading = if flag(&mut valid, VALID_NAV_HEADING, &a.nav_heading_valid) {
        scale_f32(a.nav_heading, 90.0)
    } else {
        0
    };
    let nav_modes = if flag(&mut valid, VALID_NAV_MODES, &a.nav_modes_valid) {
        a.nav_modes
    } else {
        0
    };

    let nic_a = if flag(&mut valid, VALID_NIC_A, &a.nic_a_valid) { a.nic_a } else { 0 };
    let nic_c = if flag(&mut valid, VALID_NIC_C, &a.nic_c_valid) { a.nic_c } else { 0 };
    let nic_baro = if flag(&mut valid, VALID_NIC_BARO, &a.nic_baro_valid) {
        a.nic_baro
    } else {
        0
    };
    let nac_p = if flag(&mut valid, VALID_NAC_P, &a.nac_p_valid) { a.nac_p } else { 0 };
    let nac_v = if flag(&mut valid, VALID_NAC_V, &a.nac_v_valid) { a.nac_v } else { 0 };
    let sil = if flag(&mut valid, VALID_SIL, &a.sil_valid) { a.sil } else { 0 };
    let gva = if flag(&mut valid, VALID_GVA, &a.gva_valid) { a.gva } else { 0 };
    let sda = if flag(&mut valid, VALID_SDA, &a.sda_valid) { a.sda } else { 0 };

    let mut extra_flags = 0u8;
    if a.nogps_counter >= NOGPS_SHOW {
        extra_flags |= FLAG_NOGPS;
    }
    if a.alert_valid.is_valid() {
        extra_flags |= FLAG_ALERT_VALID;
        if a.alert {
            extra_flags |= FLAG_ALERT;
        }
    }
    if a.spi_valid.is_valid() {
        extra_flags |= FLAG_SPI_VALID;
        if a.spi {
            extra_flags |= FLAG_SPI;
        }
    }
    let airground = if a.airground_valid.is_valid() {
        extra_flags |= FLAG_AIRGROUND_VALID;
        a.airground as u8
    } else {
        0
    };

    let receiver_count = if config.json_globe_index {
        if a.position_valid.source == DataSource::Mlat {
            a.receiver_count_mlat
        } else if a.position_valid.source >= DataSource::TisB {
            a.distinct_receivers()
        } else {
            1
        }
    } else {
        0
    };

    let (registration, type_code, db_flags) = if has_db {
        (
            str_bytes::<12>(&a.registration),
            str_bytes::<4>(&a.type_code),
            a.db_flags,
        )
    } else {
        ([0; 12], [0; 4], 0)
    };

    BinCraft {
        hex: a.addr,
        lat,
        lon,
        valid,
        seen: elapsed_100ms(now, a.seen),
        seen_pos,
        baro_alt,
        geom_alt,
        baro_rate,
        geom_rate,
        gs,
        ias,
        tas,
        mach,
        track,
        track_rate,
        roll,
        mag_heading,
        true_heading,
        nav_heading,
        nav_qnh,
        nav_altitude_mcp,
        nav_altitude_fms,
        squawk,
        messages: a.messages.min(u16::MAX as u32) as u16,
        pos_rc: a.pos_rc.min(u16::MAX as u32) as u16,
        receiver_count,
        nav_modes,
        pos_nic,
        callsign,
        registration,
        type_code,
        category,
        emergency,
        airground,
        addrtype: a.addrtype as u8,
        nav_altitude_src,
        sil_type: a.sil_type as u8,
        adsb_version: version_byte(a.adsb_version),
        adsr_version: version_byte(a.adsr_version),
        tisb_version: version_byte(a.tisb_version),
        nic_a,
        nic_c,
        nic_baro,
        nac_p,
        nac_v,
        sil,
        gva,
        sda,
        signal: a.signal_8bit(),
        db_flags,
        extra_flags,
        padding: [0; 4],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DataSource;

    fn reliable_aircraft(config: &Config) -> Aircraft {
        let mut a = Aircraft::new(0x3c6444);
        a.position_valid.try_update(DataSource::Adsb, 100_000);
        a.pos_reliable_odd = config.json_reliable as f32;
        a.pos_reliable_even = config.json_reliable as f32;
        a.lat = 43.6291;
        a.lon = 1.3638;
        a.seen = 100_000;
        a.seen_pos = 100_000;
        a
    }

    #[test]
    fn record_size() {
        let config = Config::default();
        let a = Aircraft::new(1);
        let bytes = to_bin_craft(&a, 0, &config, false).to_bytes().unwrap();
        assert_eq!(bytes.len(), BIN_CRAFT_SIZE);
    }

    #[test]
    fn snapshot_is_pure() {
        let config = Config::default();
        let a = reliable_aircraft(&config);
        let b1 = to_bin_craft(&a, 101_000, &config, false);
        let b2 = to_bin_craft(&a, 101_000, &config, false);
        assert_eq!(b1, b2);
        assert_eq!(b1.to_bytes().unwrap(), b2.to_bytes().unwrap());
    }

    #[test]
    fn position_scales() {
        let config = Config::default();
        let a = reliable_aircraft(&config);
        let bin = to_bin_craft(&a, 101_000, &config, false);
        assert_ne!(bin.valid & VALID_POSITION, 0);
        assert_eq!(bin.lat, 43_629_100);
        assert_eq!(bin.lon, 1_363_800);
        assert_eq!(bin.seen, 10);
        assert_eq!(bin.seen_pos, 10);
    }

    #[test]
    fn field_scales() {
        let config = Config::default();
        let mut a = reliable_aircraft(&config);
        let now = 100_500;
        a.gs = 487.5;
        a.gs_valid.try_update(DataSource::Adsb, now);
        a.track = 271.3;
        a.track_valid.try_update(DataSource::Adsb, now);
        a.mach = 0.82;
        a.mach_valid.try_update(DataSource::ModeS, now);
        a.geom_alt = 37_025;
        a.geom_alt_valid.try_update(DataSource::Adsb, now);
        a.baro_rate = -1_500;
        a.baro_rate_valid.try_update(DataSource::Adsb, now);
        a.nav_qnh = 1013.2;
        a.nav_qnh_valid.try_update(DataSource::ModeS, now);
        a.nav_altitude_mcp = 35_008;
        a.nav_altitude_mcp_valid.try_update(DataSource::ModeS, now);

        let bin = to_bin_craft(&a, now, &config, false);
        assert_eq!(bin.gs, 4875);
        assert_eq!(bin.track, 24417);
        assert_eq!(bin.mach, 820);
        assert_eq!(bin.geom_alt, 1481);
        assert_eq!(bin.baro_rate, -188); // nearbyint(-187.5) rounds to even
        assert_eq!(bin.nav_qnh, 10132);
        assert_eq!(bin.nav_altitude_mcp, 8752);
    }

    #[test]
    fn invalid_fields_masked_to_zero() {
        let config = Config::default();
        let mut a = reliable_aircraft(&config);
        a.gs = 487.5;
        let bin = to_bin_craft(&a, 100_500, &config, false);
        assert_eq!(bin.valid & VALID_GS, 0);
        assert_eq!(bin.gs, 0);
    }

    #[test]
    fn reliable_position_fallback() {
        let config = Config::default();
        let mut a = Aircraft::new(0x3c6444);
        let now = 700_000;
        // position data expired, but a reliable fix exists ten minutes back
        a.seen_pos = now - 20_000;
        a.seen_pos_reliable = now - 600_000;
        a.lat_reliable = 50.0;
        a.lon_reliable = 8.0;
        a.pos_nic_reliable = 8;
        a.pos_rc_reliable = 186;
        assert!(!a.pos_reliable(&config));

        let bin = to_bin_craft(&a, now, &config, false);
        assert_eq!(bin.valid & VALID_POSITION, 0);
        assert_eq!(bin.lat, 50_000_000);
        assert_eq!(bin.lon, 8_000_000);
        assert_eq!(bin.seen_pos, 6_000);
        assert_eq!(bin.pos_nic, 8);

        // two weeks later the fallback is gone
        let later = now + POS_RELIABLE_RETENTION;
        let bin = to_bin_craft(&a, later, &config, false);
        assert_eq!(bin.lat, 0);
        assert_eq!(bin.lon, 0);
    }

    #[test]
    fn unknown_versions_encode_as_15() {
        let config = Config::default();
        let mut a = Aircraft::new(1);
        let bin = to_bin_craft(&a, 0, &config, false);
        assert_eq!(bin.adsb_version, 15);
        assert_eq!(bin.adsr_version, 15);
        assert_eq!(bin.tisb_version, 15);
        a.adsb_version = 2;
        let bin = to_bin_craft(&a, 0, &config, false);
        assert_eq!(bin.adsb_version, 2);
    }

    #[test]
    fn receiver_counts() {
        let config = Config {
            json_globe_index: true,
            ..Default::default()
        };
        let mut a = reliable_aircraft(&config);
        a.note_receiver(11);
        a.note_receiver(22);
        a.note_receiver(22);

        a.position_valid.invalidate();
        a.position_valid.try_update(DataSource::Mlat, 100_000);
        a.receiver_count_mlat = 5;
        let bin = to_bin_craft(&a, 100_000, &config, false);
        assert_eq!(bin.receiver_count, 5);

        a.position_valid.invalidate();
        a.position_valid.try_update(DataSource::Adsb, 100_000);
        let bin = to_bin_craft(&a, 100_000, &config, false);
        assert_eq!(bin.receiver_count, 2);

        a.position_valid.invalidate();
        a.position_valid.try_update(DataSource::ModeS, 100_000);
        let bin = to_bin_craft(&a, 100_000, &config, false);
        assert_eq!(bin.receiver_count, 1);
    }

    #[test]
    fn callsign_and_db_fields_masked() {
        let config = Config::default();
        let mut a = reliable_aircraft(&config);
        a.callsign = *b"DLH39A  ";
        a.registration = "D-ABYC".into();
        a.type_code = "B748".into();

        let bin = to_bin_craft(&a, 100_000, &config, true);
        assert_eq!(bin.valid & VALID_CALLSIGN, 0);
        assert_eq!(bin.callsign, [0; 8]);
        assert_eq!(&bin.registration[..6], b"D-ABYC");
        assert_eq!(&bin.type_code, b"B748");

        a.callsign_valid.try_update(DataSource::Adsb, 100_000);
        let bin = to_bin_craft(&a, 100_000, &config, true);
        assert_eq!(&bin.callsign, b"DLH39A  ");

        let bin = to_bin_craft(&a, 100_000, &config, false);
        assert_eq!(bin.registration, [0; 12]);
    }
}
