/**
 * The update pipeline: one [`Tracker`] consumes decoded messages and keeps
 * the aircraft directory, the receiver table and the metadata database
 * consistent.
 *
 * The tracker is a single-writer structure. The intended deployment wraps
 * it in an `Arc<Mutex<_>>` shared between the decoding pipeline (writer)
 * and the snapshot/JSON producers (readers); every message is an
 * independent transaction and exceptional conditions degrade to "message
 * ignored".
 */
use crate::aircraft::{Aircraft, CprCell, Discarded, ALTITUDE_BARO_RELIABLE_MAX};
use crate::bincraft::{to_bin_craft, BinCraft};
use crate::config::Config;
use crate::db::{update_type_reg, DbStore};
use crate::directory::AircraftTable;
use crate::geo::{bearing, bogus_lat_lon, greatcircle};
use crate::message::{
    CprFragment, CprKind, DataSource, ModesMessage, AddrType,
    MAGIC_UAT_TIMESTAMP,
};
use crate::output::write_json_atomic;
use crate::receiver::{receiver_id16, ReceiverTable};
use crate::trace::TracePoint;
use deku::DekuContainerWrite;

type Result<T> =
    std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Oldest opposite-parity fragment still usable for a global decode.
const CPR_PAIR_MAX_AGE: i64 = 10 * 1000;

/// How long after the last reliable fix a lone fragment may be decoded
/// relative to the aircraft's own position.
const LOCAL_DECODE_WINDOW: i64 = 30 * 1000;

/// Fixed slack absorbing position jitter in the speed check, meters.
const SPEED_CHECK_MARGIN: f64 = 600.0;

const KNOTS_TO_M_PER_MS: f64 = 0.514444 / 1000.0;

/**
 * The CPR arithmetic lives outside this crate; the pipeline only needs
 * these two operations. Implementations must never pair a surface with an
 * airborne fragment (the pipeline does not offer such pairs).
 */
pub trait CprDecoder {
    /// Globally unambiguous decode from a matched even/odd pair.
    fn global(
        &self,
        even: &CprFragment,
        odd: &CprFragment,
        surface: bool,
    ) -> Option<(f64, f64)>;

    /// Decode a single fragment against a nearby reference position.
    fn relative(
        &self,
        fragment: &CprFragment,
        ref_lat: f64,
        ref_lon: f64,
    ) -> Option<(f64, f64)>;
}

/// Decoder for deployments without CPR plumbing: every decode fails.
#[derive(Debug, Default)]
pub struct NullDecoder;

impl CprDecoder for NullDecoder {
    fn global(
        &self,
        _even: &CprFragment,
        _odd: &CprFragment,
        _surface: bool,
    ) -> Option<(f64, f64)> {
        None
    }

    fn relative(
        &self,
        _fragment: &CprFragment,
        _ref_lat: f64,
        _ref_lon: f64,
    ) -> Option<(f64, f64)> {
        None
    }
}

/// Message-level rejections are not errors; they only move counters.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub messages: u64,
    pub unique_aircraft: u64,
    pub quarantined_dropped: u64,
    pub uat_duplicates: u64,
    pub cpr_global: u64,
    pub cpr_local: u64,
    pub position_bogus: u64,
    pub speed_check_failed: u64,
}

pub struct Tracker {
    pub config: Config,
    pub aircraft: AircraftTable,
    pub receivers: ReceiverTable,
    pub db: DbStore,
    pub stats: Stats,
    decoder: Box<dyn CprDecoder + Send + Sync>,
}

impl Tracker {
    pub fn new(config: Config) -> Self {
        Self::with_decoder(config, Box::new(NullDecoder))
    }

    pub fn with_decoder(
        config: Config,
        decoder: Box<dyn CprDecoder + Send + Sync>,
    ) -> Self {
        Tracker {
            config,
            aircraft: AircraftTable::new(),
            receivers: ReceiverTable::new(),
            db: DbStore::default(),
            stats: Stats::default(),
            decoder,
        }
    }

    /**
     * Apply one decoded message: resolve the receiver and the aircraft,
     * push every observable through its validity gate, and run the
     * position machinery for CPR fragments or upstream-decoded positions.
     */
    pub fn update_from_message(&mut self, mm: &ModesMessage) {
        let now = mm.timestamp;
        self.stats.messages += 1;

        let Tracker {
            config,
            aircraft,
            receivers,
            db,
            stats,
            decoder,
        } = self;

        let quarantined = receivers.check_bad(mm.receiver_id, now);

        let is_new = aircraft.get(mm.addr).is_none();
        let a = aircraft.get_or_create(mm.addr);
        if is_new {
            stats.unique_aircraft += 1;
            update_type_reg(a, db.live().map(|db| db.as_ref()));
        }

        if uat_duplicate(now, a, mm) {
            stats.uat_duplicates += 1;
            return;
        }

        a.seen = now;
        a.messages += 1;
        a.receiver_id = mm.receiver_id;
        if mm.signal_level > 0.0 {
            a.push_signal(mm.signal_level);
        }
        if mm.addrtype != AddrType::Unknown {
            a.addrtype = mm.addrtype;
            a.addrtype_updated = now;
        }
        if let Some(n) = mm.mlat_receiver_count {
            a.receiver_count_mlat = n;
        }

        apply_fields(a, mm, now);

        if mm.cpr.is_some() || mm.decoded_position.is_some() {
            if quarantined {
                stats.quarantined_dropped += 1;
            } else {
                process_position(config, receivers, decoder.as_ref(), stats, a, mm, now);
            }
        }
    }

    /**
     * Partitioned stale sweep: refresh every validity, then delete aircraft
     * not heard from within `aircraft_timeout` once every field expired.
     * Part 0 also revisits the quick cache sizing.
     */
    pub fn remove_stale(&mut self, now: i64, part: usize, n_parts: usize) {
        let Tracker {
            config, aircraft, ..
        } = self;

        if part == 0 {
            aircraft.quick_init();
        }

        let buckets = aircraft.buckets_len();
        let stride = buckets / n_parts;
        let start = part * stride;
        let end = if part + 1 == n_parts {
            buckets
        } else {
            start + stride
        };

        let mut dead = Vec::new();
        for bucket in start..end {
            for addr in aircraft.bucket_addrs(bucket) {
                if let Some(a) = aircraft.get(addr) {
                    a.update_validities(now, config);
                    if now - a.seen > config.aircraft_timeout
                        && a.all_invalid()
                    {
                        dead.push(addr);
                    }
                }
            }
        }
        for addr in dead {
            if let Some(mut a) = aircraft.remove(addr) {
                a.trace.cleanup();
            }
        }
    }

    /// Parse the configured metadata file into the staging generation.
    pub fn db_update(&mut self) -> Result<bool> {
        self.db.update(&self.config)
    }

    /// Swap the staging generation in and re-attach metadata everywhere.
    pub fn db_finish_update(&mut self) -> bool {
        if self.config.debug_db_json {
            if let (Some(staging), Some(dir)) =
                (self.db.staging(), &self.config.json_dir)
            {
                if let Err(e) =
                    write_json_atomic(dir, "db.json", &staging.to_json())
                {
                    tracing::warn!(error = %e, "db.json write failed");
                }
            }
        }
        if !self.db.finish_update() {
            return false;
        }
        let Tracker { aircraft, db, .. } = self;
        let live = db.live().map(|db| db.as_ref());
        for a in aircraft.iter_mut() {
            update_type_reg(a, live);
        }
        true
    }

    /// The snapshot record for one aircraft.
    pub fn bin_craft(&self, a: &Aircraft, now: i64) -> BinCraft {
        to_bin_craft(a, now, &self.config, self.db.live().is_some())
    }

    /// All aircraft projected into one contiguous snapshot buffer.
    pub fn snapshot_bin(&self, now: i64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for a in self.aircraft.iter() {
            out.extend_from_slice(&self.bin_craft(a, now).to_bytes()?);
        }
        Ok(out)
    }

    /// Write receivers.json into the configured output directory.
    pub fn write_receivers_json(&self, now: i64) -> Result<()> {
        if let Some(dir) = &self.config.json_dir {
            let json =
                serde_json::to_value(self.receivers.receivers_json(now))?;
            write_json_atomic(dir, "receivers.json", &json)?;
        }
        Ok(())
    }
}

/// UAT translators replay DF18 frames without a usable RF timestamp; close
/// on the heels of a reliable position they are duplicates.
fn uat_duplicate(now: i64, a: &Aircraft, mm: &ModesMessage) -> bool {
    mm.cpr.map_or(false, |c| c.odd)
        && mm.msgtype == 18
        && (mm.timestamp_msg == MAGIC_UAT_TIMESTAMP || mm.timestamp_msg == 0)
        && now - a.seen_pos_reliable < 2500
}

/// Push every non-position observable through its validity gate.
fn apply_fields(a: &mut Aircraft, mm: &ModesMessage, now: i64) {
    let source = mm.source;

    if let Some(callsign) = mm.callsign {
        if a.callsign_valid.try_update(source, now) {
            a.callsign = callsign;
        }
    }

    if let Some(squawk) = mm.squawk {
        // require the same squawk code twice before accepting it
        if squawk == a.squawk && a.squawk_valid.is_valid() {
            a.squawk_valid.try_update(source, now);
        } else if squawk == a.squawk_tentative {
            if a.squawk_valid.try_update(source, now) {
                a.squawk = squawk;
            }
        } else {
            a.squawk_tentative = squawk;
        }
    }

    if let Some(emergency) = mm.emergency {
        if a.emergency_valid.try_update(source, now) {
            a.emergency = emergency;
        }
    }
    if let Some(category) = mm.category {
        a.category = category;
        a.category_updated = now;
    }
    if let Some(airground) = mm.airground {
        if a.airground_valid.try_update(source, now) {
            a.airground = airground;
        }
    }
    if let Some(alert) = mm.alert {
        if a.alert_valid.try_update(source, now) {
            a.alert = alert;
        }
    }
    if let Some(spi) = mm.spi {
        if a.spi_valid.try_update(source, now) {
            a.spi = spi;
        }
    }

    if let Some(alt) = mm.baro_alt {
        if a.baro_alt_valid.accepts(source, now) {
            update_baro_alt(a, alt, now);
            a.baro_alt_valid.try_update(source, now);
        }
    }
    if let Some(alt) = mm.geom_alt {
        if a.geom_alt_valid.try_update(source, now) {
            a.geom_alt = alt;
            if a.baro_alt_valid.is_valid() {
                a.geom_delta = a.geom_alt - a.baro_alt;
                a.geom_delta_valid.try_update(source, now);
            }
        }
    }
    if let Some(rate) = mm.baro_rate {
        if a.baro_rate_valid.try_update(source, now) {
            a.baro_rate = rate;
        }
    }
    if let Some(rate) = mm.geom_rate {
        if a.geom_rate_valid.try_update(source, now) {
            a.geom_rate = rate;
        }
    }

    if let Some(gs) = mm.gs {
        if a.gs_valid.try_update(source, now) {
            a.gs = gs;
        }
    }
    if let Some(ias) = mm.ias {
        if a.ias_valid.try_update(source, now) {
            a.ias = ias;
        }
    }
    if let Some(tas) = mm.tas {
        if a.tas_valid.try_update(source, now) {
            a.tas = tas;
        }
    }
    if let Some(mach) = mm.mach {
        if a.mach_valid.try_update(source, now) {
            a.mach = mach;
        }
    }
    if let Some(track) = mm.track {
        if a.track_valid.try_update(source, now) {
            a.track = track;
        }
    }
    if let Some(track_rate) = mm.track_rate {
        if a.track_rate_valid.try_update(source, now) {
            a.track_rate = track_rate;
        }
    }
    if let Some(roll) = mm.roll {
        if a.roll_valid.try_update(source, now) {
            a.roll = roll;
        }
    }
    if let Some(heading) = mm.mag_heading {
        if a.mag_heading_valid.try_update(source, now) {
            a.mag_heading = heading;
        }
    }
    if let Some(heading) = mm.true_heading {
        if a.true_heading_valid.try_update(source, now) {
            a.true_heading = heading;
        }
    }

    if let Some(qnh) = mm.nav_qnh {
        if a.nav_qnh_valid.try_update(source, now) {
            a.nav_qnh = qnh;
        }
    }
    if let Some(heading) = mm.nav_heading {
        if a.nav_heading_valid.try_update(source, now) {
            a.nav_heading = heading;
        }
    }
    if let Some(alt) = mm.nav_altitude_mcp {
        if a.nav_altitude_mcp_valid.try_update(source, now) {
            a.nav_altitude_mcp = alt;
        }
    }
    if let Some(alt) = mm.nav_altitude_fms {
        if a.nav_altitude_fms_valid.try_update(source, now) {
            a.nav_altitude_fms = alt;
        }
    }
    if let Some(src) = mm.nav_altitude_src {
        if a.nav_altitude_src_valid.try_update(source, now) {
            a.nav_altitude_src = src;
        }
    }
    if let Some(modes) = mm.nav_modes {
        if a.nav_modes_valid.try_update(source, now) {
            a.nav_modes = modes;
        }
    }

    if let Some(v) = mm.nic_a {
        if a.nic_a_valid.try_update(source, now) {
            a.nic_a = v;
        }
    }
    if let Some(v) = mm.nic_c {
        if a.nic_c_valid.try_update(source, now) {
            a.nic_c = v;
        }
    }
    if let Some(v) = mm.nic_baro {
        if a.nic_baro_valid.try_update(source, now) {
            a.nic_baro = v;
        }
    }
    if let Some(v) = mm.nac_p {
        if a.nac_p_valid.try_update(source, now) {
            a.nac_p = v;
        }
    }
    if let Some(v) = mm.nac_v {
        if a.nac_v_valid.try_update(source, now) {
            a.nac_v = v;
        }
    }
    if let Some(v) = mm.sil {
        if a.sil_valid.try_update(source, now) {
            a.sil = v;
        }
    }
    if let Some(v) = mm.sil_type {
        a.sil_type = v;
    }
    if let Some(v) = mm.gva {
        if a.gva_valid.try_update(source, now) {
            a.gva = v;
        }
    }
    if let Some(v) = mm.sda {
        if a.sda_valid.try_update(source, now) {
            a.sda = v;
        }
    }

    if let Some(version) = mm.version {
        match source {
            DataSource::Adsb => a.adsb_version = version,
            DataSource::AdsR => a.adsr_version = version,
            DataSource::TisB => a.tisb_version = version,
            _ => {}
        }
    }
}

/// Baro altitude keeps its own reliability counter: consistent readings
/// build it up, a jump beyond what the elapsed time allows knocks it down.
fn update_baro_alt(a: &mut Aircraft, alt: i32, now: i64) {
    if !a.baro_alt_valid.is_valid() || a.alt_reliable == 0 {
        a.baro_alt = alt;
        a.alt_reliable = 1;
        return;
    }
    let age_s = a.baro_alt_valid.age(now) / 1000;
    let allowed = 500 * (1 + age_s as i32);
    if (alt - a.baro_alt).abs() <= allowed {
        a.baro_alt = alt;
        a.alt_reliable = (a.alt_reliable + 1).min(ALTITUDE_BARO_RELIABLE_MAX);
    } else {
        a.alt_reliable -= 1;
        if a.alt_reliable <= 0 {
            a.baro_alt = alt;
            a.alt_reliable = 1;
        }
    }
}

/// How the candidate position was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeKind {
    /// Paired even/odd global decode
    Global,
    /// Relative to the aircraft's own recent position
    AircraftRelative,
    /// Relative to the receiver's rough location
    ReceiverRelative,
    /// Decoded upstream (MLAT, JAERO)
    Upstream,
}

fn process_position(
    config: &Config,
    receivers: &mut ReceiverTable,
    decoder: &dyn CprDecoder,
    stats: &mut Stats,
    a: &mut Aircraft,
    mm: &ModesMessage,
    now: i64,
) {
    let candidate = if let Some((lat, lon)) = mm.decoded_position {
        Some((lat, lon, DecodeKind::Upstream, None))
    } else if let Some(frag) = &mm.cpr {
        decode_cpr(config, receivers, decoder, a, mm, frag, now)
            .map(|(lat, lon, kind)| (lat, lon, kind, Some(*frag)))
    } else {
        None
    };

    let Some((lat, lon, kind, frag)) = candidate else {
        return;
    };

    if bogus_lat_lon(lat, lon) {
        stats.position_bogus += 1;
        position_bad(config, receivers, a, mm, frag, now);
        return;
    }
    if !speed_check(a, lat, lon, now) {
        stats.speed_check_failed += 1;
        position_bad(config, receivers, a, mm, frag, now);
        return;
    }

    let source = match kind {
        DecodeKind::ReceiverRelative
            if config.debug_rough_receiver_location =>
        {
            DataSource::Indirect
        }
        _ => mm.source,
    };
    if !a.position_valid.try_update(source, now) {
        return;
    }

    match kind {
        DecodeKind::Global => stats.cpr_global += 1,
        DecodeKind::Upstream => {}
        _ => stats.cpr_local += 1,
    }

    let surface = frag.map_or(false, |f| f.kind == CprKind::Surface);
    if a.prev_pos_time != 0 {
        let moved = greatcircle(a.prev_lat, a.prev_lon, lat, lon, true);
        if moved > 100.0 {
            a.calc_track = bearing(a.prev_lat, a.prev_lon, lat, lon) as f32;
        }
    }

    a.lat = lat;
    a.lon = lon;
    if let Some(frag) = frag {
        a.pos_nic = frag.nic;
        a.pos_rc = frag.rc;
        a.last_cpr_kind = frag.kind;
    }
    a.pos_surface = surface;
    a.seen_pos = now;
    a.last_pos_receiver_id = mm.receiver_id;
    a.note_receiver(receiver_id16(mm.receiver_id));
    if a.gs_valid.is_valid() {
        a.gs_last_pos = a.gs;
    }
    a.prev_lat = lat;
    a.prev_lon = lon;
    a.prev_pos_time = now;

    if kind == DecodeKind::Global {
        let cap = config.position_persistence as f32;
        let odd = frag.map_or(false, |f| f.odd);
        if odd {
            a.pos_reliable_odd = (a.pos_reliable_odd + 1.0).min(cap);
        } else {
            a.pos_reliable_even = (a.pos_reliable_even + 1.0).min(cap);
        }
        a.seen_pos_global = now;
    }

    if a.pos_reliable(config) {
        a.seen_pos_reliable = now;
        a.lat_reliable = lat;
        a.lon_reliable = lon;
        a.pos_nic_reliable = a.pos_nic;
        a.pos_rc_reliable = a.pos_rc;
        if mm.source == DataSource::Adsb {
            a.seen_adsb_reliable = now;
        }
        if kind == DecodeKind::Global {
            receivers.position_received(a, mm, lat, lon, now, config);
        }
        push_trace(a, now, surface);
    }
}

fn decode_cpr(
    config: &Config,
    receivers: &ReceiverTable,
    decoder: &dyn CprDecoder,
    a: &mut Aircraft,
    mm: &ModesMessage,
    frag: &CprFragment,
    now: i64,
) -> Option<(f64, f64, DecodeKind)> {
    let surface = frag.kind == CprKind::Surface;
    let accepted = if frag.odd {
        a.cpr_odd_valid.try_update(mm.source, now)
    } else {
        a.cpr_even_valid.try_update(mm.source, now)
    };
    if !accepted {
        return None;
    }
    let cell = CprCell {
        lat: frag.lat,
        lon: frag.lon,
        nic: frag.nic,
        rc: frag.rc,
        kind: frag.kind,
        receiver_id: mm.receiver_id,
    };
    if frag.odd {
        a.cpr_odd = cell;
    } else {
        a.cpr_even = cell;
    }

    // a fresh opposite fragment of the same kind allows a global decode
    let (opposite, opposite_valid) = if frag.odd {
        (a.cpr_even, a.cpr_even_valid)
    } else {
        (a.cpr_odd, a.cpr_odd_valid)
    };
    if opposite_valid.is_valid()
        && now - opposite_valid.updated < CPR_PAIR_MAX_AGE
        && opposite.kind == frag.kind
    {
        let (even, odd) = if frag.odd {
            (opposite.fragment(false), *frag)
        } else {
            (*frag, opposite.fragment(true))
        };
        if let Some((lat, lon)) = decoder.global(&even, &odd, surface) {
            return Some((lat, lon, DecodeKind::Global));
        }
    }

    // relative to our own recent reliable position
    if a.local_cpr_allow_ac_rel
        && a.seen_pos_reliable != 0
        && now - a.seen_pos_reliable < LOCAL_DECODE_WINDOW
    {
        if let Some((lat, lon)) =
            decoder.relative(frag, a.lat_reliable, a.lon_reliable)
        {
            return Some((lat, lon, DecodeKind::AircraftRelative));
        }
    }

    // last resort: the receiver's rough location
    if let Some((rlat, rlon)) = receivers.get_reference(mm.receiver_id, config)
    {
        if let Some((lat, lon)) = decoder.relative(frag, rlat, rlon) {
            return Some((lat, lon, DecodeKind::ReceiverRelative));
        }
    }
    None
}

/**
 * Plausibility gate on a candidate position: the implied speed over ground
 * from the previous accepted position must stay under an altitude-dependent
 * bound, with fixed slack for jitter.
 */
fn speed_check(a: &Aircraft, lat: f64, lon: f64, now: i64) -> bool {
    if a.prev_pos_time == 0 {
        return true;
    }
    let elapsed = now - a.prev_pos_time;
    if elapsed < 0 {
        return false;
    }
    let distance = greatcircle(a.prev_lat, a.prev_lon, lat, lon, true);
    let max_kts = max_speed_kts(a);
    distance <= SPEED_CHECK_MARGIN
        + max_kts * KNOTS_TO_M_PER_MS * elapsed as f64
}

/// Maximum plausible ground speed in knots: 700 below 10 000 ft, rising
/// linearly to 1 100 at 20 000 ft, on the ground much less.
fn max_speed_kts(a: &Aircraft) -> f64 {
    if a.pos_surface {
        return 150.0;
    }
    let alt = if a.baro_alt_valid.is_valid() {
        a.baro_alt
    } else if a.geom_alt_valid.is_valid() {
        a.geom_alt
    } else {
        return 1100.0;
    };
    match alt {
        ..=10_000 => 700.0,
        10_001..=19_999 => 700.0 + (alt - 10_000) as f64 * 400.0 / 10_000.0,
        _ => 1100.0,
    }
}

fn position_bad(
    config: &Config,
    receivers: &mut ReceiverTable,
    a: &mut Aircraft,
    mm: &ModesMessage,
    frag: Option<CprFragment>,
    now: i64,
) {
    a.pos_reliable_odd = (a.pos_reliable_odd - 1.0).max(0.0);
    a.pos_reliable_even = (a.pos_reliable_even - 1.0).max(0.0);
    if let Some(frag) = frag {
        a.push_discarded(Discarded {
            cpr_lat: frag.lat,
            cpr_lon: frag.lon,
            ts: now,
            receiver_id: mm.receiver_id,
        });
    }
    receivers.bad(mm.receiver_id, a.addr, now, config);
}

fn push_trace(a: &mut Aircraft, now: i64, on_ground: bool) {
    let mut point = TracePoint {
        timestamp: now,
        addrtype: a.addrtype,
        on_ground,
        stale: a.position_valid.stale,
        receiver_id: a.last_pos_receiver_id as u32,
        ..Default::default()
    };
    point.set_position(a.lat, a.lon);
    if a.gs_valid.is_valid() {
        point.set_gs(a.gs);
    }
    if a.track_valid.is_valid() {
        point.set_track(a.track);
    }
    if a.baro_alt_valid.is_valid() {
        point.set_baro_alt(a.baro_alt);
    }
    if a.geom_alt_valid.is_valid() {
        point.set_geom_alt(a.geom_alt);
    }
    if a.baro_rate_valid.is_valid() {
        point.set_baro_rate(a.baro_rate);
    }
    if a.geom_rate_valid.is_valid() {
        point.set_geom_rate(a.geom_rate);
    }
    if a.roll_valid.is_valid() {
        point.set_roll(a.roll);
    }
    if a.ias_valid.is_valid() {
        point.ias = a.ias as u16;
        point.ias_valid = true;
    }
    a.trace.push(point);
}
