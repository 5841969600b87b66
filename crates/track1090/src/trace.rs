/**
 * The trace keeps a compressed history of recent positions for one
 * aircraft. Points are integer-scaled the same way the binary snapshot
 * compresses its fields, so a trace stays small enough to hold thousands of
 * points per aircraft.
 *
 * The newest point sits in a buffered head slot: consecutive updates inside
 * the commit interval overwrite the head instead of growing the array.
 * Writing traces to disk is the daemon's business, the tracker only hands
 * out the points.
 */
use crate::message::AddrType;
use serde::Serialize;

// uint16: 0 to 65535
const GS_FACTOR: f32 = 10.0; // 6000 to 60000
const TRACK_FACTOR: f32 = 100.0; // 360 to 36000

// int16: -32768 to 32767
const ALT_FACTOR: f64 = 1.0 / 6.25; // 200000 to 32000
const RATE_FACTOR: f64 = 1.0 / 8.0; // 262136 to 32767
const ROLL_FACTOR: f32 = 100.0; // 180 to 18000

/// A point is committed once the buffered head is at least this old.
const TRACE_INTERVAL: i64 = 15 * 1000;

/// One point of an aircraft trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TracePoint {
    pub timestamp: i64,
    pub lat: i32,
    pub lon: i32,
    pub gs: u16,
    pub track: u16,
    pub baro_alt: i16,
    pub baro_rate: i16,
    pub geom_alt: i16,
    pub geom_rate: i16,
    pub ias: u16,
    pub roll: i16,
    pub addrtype: AddrType,
    pub on_ground: bool,
    pub stale: bool,
    pub leg_marker: bool,
    pub gs_valid: bool,
    pub track_valid: bool,
    pub baro_alt_valid: bool,
    pub baro_rate_valid: bool,
    pub geom_alt_valid: bool,
    pub geom_rate_valid: bool,
    pub roll_valid: bool,
    pub ias_valid: bool,
    pub receiver_id: u32,
}

impl TracePoint {
    pub fn set_position(&mut self, lat: f64, lon: f64) {
        self.lat = libm::rint(lat * 1e6) as i32;
        self.lon = libm::rint(lon * 1e6) as i32;
    }

    pub fn set_gs(&mut self, gs: f32) {
        self.gs = libm::rintf(gs * GS_FACTOR) as u16;
        self.gs_valid = true;
    }

    pub fn set_track(&mut self, track: f32) {
        self.track = libm::rintf(track * TRACK_FACTOR) as u16;
        self.track_valid = true;
    }

    pub fn set_baro_alt(&mut self, alt: i32) {
        self.baro_alt = libm::rint(alt as f64 * ALT_FACTOR) as i16;
        self.baro_alt_valid = true;
    }

    pub fn set_geom_alt(&mut self, alt: i32) {
        self.geom_alt = libm::rint(alt as f64 * ALT_FACTOR) as i16;
        self.geom_alt_valid = true;
    }

    pub fn set_baro_rate(&mut self, rate: i32) {
        self.baro_rate = libm::rint(rate as f64 * RATE_FACTOR) as i16;
        self.baro_rate_valid = true;
    }

    pub fn set_geom_rate(&mut self, rate: i32) {
        self.geom_rate = libm::rint(rate as f64 * RATE_FACTOR) as i16;
        self.geom_rate_valid = true;
    }

    pub fn set_roll(&mut self, roll: f32) {
        self.roll = libm::rintf(roll * ROLL_FACTOR) as i16;
        self.roll_valid = true;
    }
}

/// Committed points plus the buffered head slot.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    points: Vec<TracePoint>,
    head: Option<TracePoint>,
}

impl Trace {
    /// Record a new point. The head slot absorbs updates arriving within
    /// [`TRACE_INTERVAL`]; older heads are committed first.
    pub fn push(&mut self, point: TracePoint) {
        if let Some(head) = self.head {
            if point.timestamp >= head.timestamp + TRACE_INTERVAL {
                self.points.push(head);
                self.head = Some(point);
                return;
            }
        }
        self.head = Some(point);
    }

    /// Committed points, oldest first. The buffered head is not included.
    pub fn points(&self) -> &[TracePoint] {
        &self.points
    }

    pub fn head(&self) -> Option<&TracePoint> {
        self.head.as_ref()
    }

    pub fn len(&self) -> usize {
        self.points.len() + usize::from(self.head.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the backing storage when the aircraft is deleted.
    pub fn cleanup(&mut self) {
        self.points = Vec::new();
        self.head = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64, lat: f64, lon: f64) -> TracePoint {
        let mut p = TracePoint {
            timestamp: ts,
            ..Default::default()
        };
        p.set_position(lat, lon);
        p
    }

    #[test]
    fn head_absorbs_updates_within_interval() {
        let mut trace = Trace::default();
        trace.push(point(1_000, 50.0, 8.0));
        trace.push(point(2_000, 50.1, 8.1));
        assert_eq!(trace.points().len(), 0);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.head().unwrap().lat, 50_100_000);
    }

    #[test]
    fn old_head_is_committed() {
        let mut trace = Trace::default();
        trace.push(point(1_000, 50.0, 8.0));
        trace.push(point(1_000 + TRACE_INTERVAL, 50.1, 8.1));
        assert_eq!(trace.points().len(), 1);
        assert_eq!(trace.points()[0].lat, 50_000_000);
        assert_eq!(trace.head().unwrap().lat, 50_100_000);
    }

    #[test]
    fn scale_factors() {
        let mut p = TracePoint::default();
        p.set_gs(123.4);
        p.set_track(359.9);
        p.set_baro_alt(30_000);
        p.set_roll(-12.3);
        assert_eq!(p.gs, 1234);
        assert_eq!(p.track, 35990);
        assert_eq!(p.baro_alt, 4800);
        assert_eq!(p.roll, -1230);
    }

    #[test]
    fn cleanup_drops_points() {
        let mut trace = Trace::default();
        trace.push(point(0, 1.0, 1.0));
        trace.push(point(TRACE_INTERVAL, 1.1, 1.1));
        trace.cleanup();
        assert!(trace.is_empty());
    }
}
