/**
 * Receiver reputation and coverage.
 *
 * Every feeder is tracked under its 64 bit identifier: a coverage bounding
 * box grown from the reliable positions it relays, good/bad message
 * counters, and a quarantine window for feeders relaying garbage. The box
 * center doubles as a rough reference location for decoding isolated CPR
 * fragments.
 */
use crate::aircraft::Aircraft;
use crate::config::Config;
use crate::geo::greatcircle;
use crate::message::{CprKind, DataSource, ModesMessage};
use serde::Serialize;
use serde_tuple::Serialize_tuple;

pub const RECEIVER_TABLE_HASH_BITS: u32 = 14;
pub const RECEIVER_TABLE_SIZE: usize = 1 << RECEIVER_TABLE_HASH_BITS;

/// Positions further than this from the box center are suspect.
pub const RECEIVER_MAX_RANGE: f64 = 800e3;

/// Slots for remembering which aircraft produced out-of-range positions.
pub const RECEIVER_BAD_AIRCRAFT: usize = 4;

const BAD_AIRCRAFT_EXPIRE: i64 = 3 * 60 * 1000;
const QUARANTINE_TIMEOUT: i64 = 12 * 1000;
const BAD_EXTENT_EXCLUDE: i64 = 30 * 60 * 1000;

fn mix_fasthash(mut h: u64) -> u64 {
    h ^= h >> 23;
    h = h.wrapping_mul(0x2127_599b_f432_5c37);
    h ^= h >> 47;
    h
}

/// 64 bit id mixed through a fixed avalanche constant, folded down to the
/// table size by a subtract-shift fold.
pub fn receiver_hash(id: u64) -> u32 {
    let mut h: u64 =
        0x3073_2349_f781_0465 ^ 4u64.wrapping_mul(0x2127_599b_f432_5c37);
    h ^= mix_fasthash(id);

    h = h.wrapping_sub(h >> 32);
    h &= (1u64 << 32) - 1;
    h = h.wrapping_sub(h >> RECEIVER_TABLE_HASH_BITS);

    (h as u32) & (RECEIVER_TABLE_SIZE as u32 - 1)
}

/// Compress a receiver id into the 16 bit form kept on aircraft records.
pub fn receiver_id16(id: u64) -> u16 {
    let h = mix_fasthash(id) as u16;
    // zero marks an empty ring slot
    if h == 0 {
        1
    } else {
        h
    }
}

/// 16 hex digits with a separator, the receivers.json identifier format.
pub fn format_receiver_id(id: u64) -> String {
    format!("{:08x}-{:08x}", id >> 32, id as u32)
}

#[derive(Debug, Clone, Copy, Default)]
struct BadAircraft {
    addr: u32,
    ts: i64,
}

#[derive(Debug)]
pub struct Receiver {
    pub id: u64,
    next: Option<Box<Receiver>>,

    pub first_seen: i64,
    pub last_seen: i64,

    pub position_counter: u64,
    pub good_counter: u32,
    pub bad_counter: f32,
    pub timed_out_counter: u32,
    pub timed_out_until: i64,
    /// Set when distinct aircraft place this feeder outside its plausible
    /// range; zero otherwise
    pub bad_extent: i64,

    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,

    bad_aircraft: [BadAircraft; RECEIVER_BAD_AIRCRAFT],
}

impl Receiver {
    fn new(id: u64, now: i64) -> Self {
        Receiver {
            id,
            next: None,
            first_seen: now,
            last_seen: now,
            position_counter: 0,
            good_counter: 0,
            bad_counter: 0.0,
            timed_out_counter: 0,
            timed_out_until: 0,
            bad_extent: 0,
            lat_min: 0.0,
            lat_max: 0.0,
            lon_min: 0.0,
            lon_max: 0.0,
            bad_aircraft: [BadAircraft::default(); RECEIVER_BAD_AIRCRAFT],
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.lat_min + (self.lat_max - self.lat_min) / 2.0,
            self.lon_min + (self.lon_max - self.lon_min) / 2.0,
        )
    }
}

/// What happened to a position offered for coverage estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageOutcome {
    /// In range, box updated
    Accepted,
    /// Counted, but too far from the box center to grow it
    OutOfRange,
    /// Invalid input or insufficient aircraft reliability
    Rejected,
}

#[derive(Debug)]
pub struct ReceiverTable {
    buckets: Vec<Option<Box<Receiver>>>,
    count: usize,
}

impl Default for ReceiverTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverTable {
    pub fn new() -> Self {
        let mut buckets = Vec::new();
        buckets.resize_with(RECEIVER_TABLE_SIZE, || None);
        ReceiverTable { buckets, count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, id: u64) -> Option<&Receiver> {
        let mut cur = self.buckets[receiver_hash(id) as usize].as_deref();
        while let Some(r) = cur {
            if r.id == id {
                return Some(r);
            }
            cur = r.next.as_deref();
        }
        None
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Receiver> {
        let mut cur = self.buckets[receiver_hash(id) as usize].as_deref_mut();
        while let Some(r) = cur {
            if r.id == id {
                return Some(r);
            }
            cur = r.next.as_deref_mut();
        }
        None
    }

    /// Existing receiver, or a fresh one inserted at the chain head. Refuses
    /// creation once the table holds four times its nominal size.
    pub fn get_or_create(
        &mut self,
        id: u64,
        now: i64,
    ) -> Option<&mut Receiver> {
        if self.get(id).is_none() {
            if self.count > 4 * RECEIVER_TABLE_SIZE {
                return None;
            }
            let bucket = receiver_hash(id) as usize;
            let mut r = Box::new(Receiver::new(id, now));
            r.next = self.buckets[bucket].take();
            self.buckets[bucket] = Some(r);
            self.count += 1;
            if self.count % (RECEIVER_TABLE_SIZE / 8) == 0 {
                tracing::info!(
                    fill = self.count as f64 / RECEIVER_TABLE_SIZE as f64,
                    "receiver table fill"
                );
            }
        }
        self.get_mut(id)
    }

    /**
     * Feed a reliable ADS-B position into the coverage box of the receiver
     * it came from. Points within [`RECEIVER_MAX_RANGE`] of the box center
     * grow the box; distant points are remembered per aircraft, and once a
     * second distinct aircraft shows up at implausible range within three
     * minutes, the extent itself is declared bad.
     */
    pub fn position_received(
        &mut self,
        a: &Aircraft,
        mm: &ModesMessage,
        lat: f64,
        lon: f64,
        now: i64,
        config: &Config,
    ) -> CoverageOutcome {
        if !(-85.0..=85.0).contains(&lat) || !(-175.0..=175.0).contains(&lon)
        {
            return CoverageOutcome::Rejected;
        }
        let required = config.reliability_required() as f32;
        let surface = matches!(
            mm.cpr.map(|c| c.kind),
            Some(CprKind::Surface) | Some(CprKind::Coarse)
        );
        if !(mm.source == DataSource::Adsb
            && !surface
            && a.pos_reliable_odd >= required
            && a.pos_reliable_even >= required)
        {
            return CoverageOutcome::Rejected;
        }

        let starting = match self.get(mm.receiver_id) {
            Some(r) => r.position_counter == 0,
            None => true,
        };
        let debug_receiver = config.debug_receiver;
        let Some(r) = self.get_or_create(mm.receiver_id, now) else {
            return CoverageOutcome::Rejected;
        };

        let mut distance = 0.0;
        if starting {
            r.lat_min = lat;
            r.lat_max = lat;
            r.lon_min = lon;
            r.lon_max = lon;
        } else {
            let (rlat, rlon) = r.center();
            distance = greatcircle(rlat, rlon, lat, lon, true);

            if distance < RECEIVER_MAX_RANGE {
                r.lat_min = r.lat_min.min(lat);
                r.lon_min = r.lon_min.min(lon);
                r.lat_max = r.lat_max.max(lat);
                r.lon_max = r.lon_max.max(lon);
                r.good_counter += 1;
                r.bad_counter = (r.bad_counter - 0.5).max(0.0);
            }

            if r.bad_extent == 0 && distance > RECEIVER_MAX_RANGE {
                // one aircraft at implausible range is excused and
                // remembered; a second distinct one within the expiry window
                // condemns the extent itself
                let known = r.bad_aircraft.iter_mut().find(|bad| {
                    bad.addr == a.addr && now - bad.ts <= BAD_AIRCRAFT_EXPIRE
                });
                if let Some(bad) = known {
                    bad.ts = now;
                } else {
                    let other = r.bad_aircraft.iter().any(|bad| {
                        bad.addr != 0
                            && bad.addr != a.addr
                            && now - bad.ts <= BAD_AIRCRAFT_EXPIRE
                    });
                    if other {
                        r.bad_extent = now;
                        if debug_receiver {
                            tracing::debug!(
                                receiver = %format_receiver_id(r.id),
                                addr = format_args!("{:06x}", a.addr),
                                nmi = distance / 1852.0,
                                positions = r.position_counter,
                                "receiver bad extent"
                            );
                        }
                    } else if let Some(free) =
                        r.bad_aircraft.iter_mut().find(|bad| {
                            bad.addr == 0
                                || now - bad.ts > BAD_AIRCRAFT_EXPIRE
                        })
                    {
                        free.addr = a.addr;
                        free.ts = now;
                    }
                }
            }
        }

        r.position_counter += 1;
        r.last_seen = now;

        if distance > RECEIVER_MAX_RANGE {
            CoverageOutcome::OutOfRange
        } else {
            CoverageOutcome::Accepted
        }
    }

    /// Quarantined right now?
    pub fn check_bad(&self, id: u64, now: i64) -> bool {
        match self.get(id) {
            Some(r) => now < r.timed_out_until,
            None => false,
        }
    }

    /**
     * Charge one bad message to a feeder. Six strikes inside the window put
     * it in quarantine for twelve seconds and reset the counters; an almost
     * elapsed quarantine does not shield against new strikes.
     */
    pub fn bad(&mut self, id: u64, addr: u32, now: i64, config: &Config) {
        let debug_garbage = config.debug_garbage;
        let Some(r) = self.get_or_create(id, now) else {
            return;
        };

        if now + QUARANTINE_TIMEOUT * 2 / 3 > r.timed_out_until {
            r.last_seen = now;
            r.bad_counter += 1.0;
            if r.bad_counter > 5.99 {
                r.timed_out_counter += 1;
                if debug_garbage {
                    tracing::debug!(
                        receiver = %format_receiver_id(r.id),
                        addr = format_args!("{:06x}", addr),
                        good = r.good_counter,
                        bad = r.bad_counter,
                        timeouts = r.timed_out_counter,
                        "receiver quarantined"
                    );
                }
                r.timed_out_until = now + QUARANTINE_TIMEOUT;
                r.good_counter = 0;
                r.bad_counter = 0.0;
            }
        }
    }

    /**
     * The box center as a rough reference for global decoding of isolated
     * CPR fragments. Under-sampled or bad-extent receivers yield nothing.
     */
    pub fn get_reference(
        &self,
        id: u64,
        config: &Config,
    ) -> Option<(f64, f64)> {
        let r = self.get(id)?;
        let (lat, lon) = r.center();

        let required: u64 = if config.receiver_focus { 4 } else { 100 };
        if r.position_counter < required || r.bad_extent != 0 {
            if config.debug_receiver {
                tracing::debug!(
                    receiver = %format_receiver_id(r.id),
                    positions = r.position_counter,
                    bad_extent = r.bad_extent,
                    "no reference"
                );
            }
            return None;
        }
        Some((lat, lon))
    }

    /**
     * Sharded eviction sweep over `1/n_parts` of the table. A receiver goes
     * when the table is over-full and it has been quiet for twenty minutes,
     * when it has been quiet for a day, or thirty minutes after its extent
     * went bad.
     */
    pub fn timeout(&mut self, part: usize, n_parts: usize, now: i64) {
        let stride = RECEIVER_TABLE_SIZE / n_parts;
        let start = stride * part;
        let end = start + stride;
        let over_full = self.count > RECEIVER_TABLE_SIZE;
        let mut removed = 0usize;

        for bucket in start..end {
            let mut link = &mut self.buckets[bucket];
            loop {
                let evict = match link.as_deref() {
                    None => break,
                    Some(r) => {
                        (over_full
                            && r.last_seen < now - 20 * 60 * 1000)
                            || now > r.last_seen + 24 * 3600 * 1000
                            || (r.bad_extent != 0
                                && now > r.bad_extent + BAD_EXTENT_EXCLUDE)
                    }
                };
                if evict {
                    if let Some(node) = link.take() {
                        *link = node.next;
                        removed += 1;
                    }
                } else if let Some(node) = link {
                    link = &mut node.next;
                }
            }
        }
        self.count -= removed;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Receiver> {
        self.buckets.iter().flat_map(|bucket| {
            let mut out = bucket.as_deref();
            std::iter::from_fn(move || {
                let r = out?;
                out = r.next.as_deref();
                Some(r)
            })
        })
    }

    /// The receivers.json payload.
    pub fn receivers_json(&self, now: i64) -> ReceiversJson {
        let receivers = self
            .iter()
            .map(|r| {
                let elapsed =
                    (r.last_seen - r.first_seen) as f64 / 1000.0 + 1.0;
                let (lat_center, lon_center) = r.center();
                ReceiverRow {
                    uuid: format_receiver_id(r.id),
                    position_rate: r.position_counter as f64 / elapsed,
                    timeout_rate: r.timed_out_counter as f64 * 3600.0
                        / elapsed,
                    lat_min: r.lat_min,
                    lat_max: r.lat_max,
                    lon_min: r.lon_min,
                    lon_max: r.lon_max,
                    bad_extent: u8::from(r.bad_extent != 0),
                    lat_center,
                    lon_center,
                }
            })
            .collect();
        ReceiversJson {
            now: now as f64 / 1000.0,
            receivers,
        }
    }
}

#[derive(Debug, Serialize_tuple)]
pub struct ReceiverRow {
    pub uuid: String,
    pub position_rate: f64,
    pub timeout_rate: f64,
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub bad_extent: u8,
    pub lat_center: f64,
    pub lon_center: f64,
}

#[derive(Debug, Serialize)]
pub struct ReceiversJson {
    pub now: f64,
    pub receivers: Vec<ReceiverRow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CprFragment;

    fn reliable_aircraft(addr: u32, config: &Config) -> Aircraft {
        let mut a = Aircraft::new(addr);
        a.pos_reliable_odd = config.position_persistence as f32;
        a.pos_reliable_even = config.position_persistence as f32;
        a
    }

    fn adsb_position(receiver_id: u64) -> ModesMessage {
        ModesMessage {
            source: DataSource::Adsb,
            receiver_id,
            cpr: Some(CprFragment::default()),
            ..Default::default()
        }
    }

    #[test]
    fn box_grows_monotonically() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let a = reliable_aircraft(0x3c6444, &config);
        let mm = adsb_position(42);

        let points = [(50.0, 8.0), (50.5, 8.5), (49.5, 7.5), (50.2, 8.1)];
        for (i, (lat, lon)) in points.iter().enumerate() {
            let out = table
                .position_received(&a, &mm, *lat, *lon, 1_000 + i as i64, &config);
            assert_eq!(out, CoverageOutcome::Accepted);
        }
        let r = table.get(42).unwrap();
        assert_eq!(r.lat_min, 49.5);
        assert_eq!(r.lat_max, 50.5);
        assert_eq!(r.lon_min, 7.5);
        assert_eq!(r.lon_max, 8.5);
        assert_eq!(r.position_counter, 4);
    }

    #[test]
    fn unreliable_aircraft_rejected() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let a = Aircraft::new(0x3c6444);
        let mm = adsb_position(42);
        let out = table.position_received(&a, &mm, 50.0, 8.0, 1_000, &config);
        assert_eq!(out, CoverageOutcome::Rejected);
        assert!(table.get(42).is_none());
    }

    #[test]
    fn out_of_range_point_sets_bad_extent_on_second_aircraft() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let a1 = reliable_aircraft(0x111111, &config);
        let a2 = reliable_aircraft(0x222222, &config);
        let mm = adsb_position(7);
        let base = 10_000_000;

        assert_eq!(
            table.position_received(&a1, &mm, 50.0, 8.0, base, &config),
            CoverageOutcome::Accepted
        );
        // far away point: counted but the box stays put
        assert_eq!(
            table.position_received(&a1, &mm, 0.0, 0.5, base + 2_000, &config),
            CoverageOutcome::OutOfRange
        );
        {
            let r = table.get(7).unwrap();
            assert_eq!(r.lat_min, 50.0);
            assert_eq!(r.bad_extent, 0);
            assert_eq!(r.position_counter, 2);
        }
        // same aircraft again: still excused
        assert_eq!(
            table.position_received(&a1, &mm, 0.0, 0.5, base + 3_000, &config),
            CoverageOutcome::OutOfRange
        );
        assert_eq!(table.get(7).unwrap().bad_extent, 0);
        // a second distinct aircraft at silly range within the window
        assert_eq!(
            table.position_received(&a2, &mm, 0.0, 0.5, base + 4_000, &config),
            CoverageOutcome::OutOfRange
        );
        assert_eq!(table.get(7).unwrap().bad_extent, base + 4_000);
        // bad extent excludes the receiver from reference duty
        assert!(table.get_reference(7, &config).is_none());
    }

    #[test]
    fn reference_requires_samples() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let a = reliable_aircraft(0x3c6444, &config);
        let mm = adsb_position(9);
        for i in 0..99 {
            table.position_received(&a, &mm, 50.0, 8.0, 1_000 + i, &config);
        }
        assert!(table.get_reference(9, &config).is_none());
        table.position_received(&a, &mm, 51.0, 9.0, 2_000, &config);
        let (lat, lon) = table.get_reference(9, &config).unwrap();
        assert!((lat - 50.5).abs() < 1e-9);
        assert!((lon - 8.5).abs() < 1e-9);
    }

    #[test]
    fn focus_mode_lowers_reference_requirement() {
        let config = Config {
            receiver_focus: true,
            ..Default::default()
        };
        let mut table = ReceiverTable::new();
        let a = reliable_aircraft(0x3c6444, &config);
        let mm = adsb_position(9);
        for i in 0..4 {
            table.position_received(&a, &mm, 50.0, 8.0, 1_000 + i, &config);
        }
        assert!(table.get_reference(9, &config).is_some());
    }

    #[test]
    fn quarantine_after_six_strikes() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let now = 100_000;
        for _ in 0..5 {
            table.bad(5, 0xabcdef, now, &config);
        }
        assert!(!table.check_bad(5, now));
        table.bad(5, 0xabcdef, now, &config);
        assert!(table.check_bad(5, now));
        assert!(table.check_bad(5, now + QUARANTINE_TIMEOUT - 1));
        assert!(!table.check_bad(5, now + QUARANTINE_TIMEOUT));
        let r = table.get(5).unwrap();
        assert_eq!(r.timed_out_counter, 1);
        assert_eq!(r.bad_counter, 0.0);
        assert_eq!(r.good_counter, 0);
    }

    #[test]
    fn fresh_quarantine_shields_against_strikes() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let now = 100_000;
        for _ in 0..6 {
            table.bad(5, 0xabcdef, now, &config);
        }
        // just quarantined: more strikes within the first two thirds of the
        // window do not accumulate
        table.bad(5, 0xabcdef, now + 1_000, &config);
        assert_eq!(table.get(5).unwrap().bad_counter, 0.0);
        // near the end of the window they count again
        table.bad(5, 0xabcdef, now + QUARANTINE_TIMEOUT - 1_000, &config);
        assert_eq!(table.get(5).unwrap().bad_counter, 1.0);
    }

    #[test]
    fn good_points_decay_bad_counter() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let a = reliable_aircraft(0x3c6444, &config);
        let mm = adsb_position(3);
        table.position_received(&a, &mm, 50.0, 8.0, 1_000, &config);
        table.bad(3, 0x3c6444, 2_000, &config);
        table.bad(3, 0x3c6444, 3_000, &config);
        assert_eq!(table.get(3).unwrap().bad_counter, 2.0);
        table.position_received(&a, &mm, 50.1, 8.1, 4_000, &config);
        assert_eq!(table.get(3).unwrap().bad_counter, 1.5);
    }

    #[test]
    fn eviction_rules() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let day = 24 * 3600 * 1000;

        table.get_or_create(1, 0);
        table.get_or_create(2, 0);
        let now = day + 1;
        table.get_or_create(3, now);
        table.get_mut(2).unwrap().last_seen = now;
        table.get_mut(3).unwrap().bad_extent = now - BAD_EXTENT_EXCLUDE - 1;

        table.timeout(0, 1, now);
        // 1 idle for a day, 3 with an expired bad extent
        assert!(table.get(1).is_none());
        assert!(table.get(2).is_some());
        assert!(table.get(3).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn partitioned_sweep_covers_the_table() {
        let config = Config::default();
        let _ = config;
        let mut table = ReceiverTable::new();
        for id in 0..1_000u64 {
            table.get_or_create(id, 0);
        }
        let now = 25 * 3600 * 1000;
        for part in 0..8 {
            table.timeout(part, 8, now);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn receivers_json_shape() {
        let config = Config::default();
        let mut table = ReceiverTable::new();
        let a = reliable_aircraft(0x3c6444, &config);
        let mm = adsb_position(0x1122334455667788);
        table.position_received(&a, &mm, 50.0, 8.0, 1_000, &config);
        table.position_received(&a, &mm, 51.0, 9.0, 2_000, &config);

        let json = serde_json::to_value(table.receivers_json(2_000)).unwrap();
        assert_eq!(json["now"], 2.0);
        let row = &json["receivers"][0];
        assert_eq!(row[0], "11223344-55667788");
        assert_eq!(row[3], 50.0); // latMin
        assert_eq!(row[4], 51.0); // latMax
        assert_eq!(row[7], 0); // badExtent
        assert_eq!(row[8], 50.5); // lat center
    }

    #[test]
    fn creation_refused_when_overfull() {
        let mut table = ReceiverTable::new();
        table.count = 4 * RECEIVER_TABLE_SIZE + 1;
        assert!(table.get_or_create(99, 0).is_none());
    }
}
