/**
 * Per-field data validity.
 *
 * Every observable on an aircraft record carries its own [`DataValidity`].
 * Data moves through three states:
 *
 *  - fresh: data is valid, updates from a less reliable source are rejected
 *  - stale: data is valid, updates from any valid source are accepted
 *  - expired: data is not valid
 */
use crate::config::Config;
use crate::message::DataSource;
use serde::{Deserialize, Serialize};

/// Data turns stale this long after the last update.
pub const TRACK_STALE: i64 = 15 * 1000;
/// Default expiration timeout.
pub const TRACK_EXPIRE: i64 = 60 * 1000;
/// Expiration timeout for slowly refreshed fields (intent, quality codes).
pub const TRACK_EXPIRE_LONG: i64 = 180 * 1000;
/// Expiration timeout for positions derived from a rough receiver location.
pub const TRACK_EXPIRE_ROUGH: i64 = 2 * 60 * 1000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct DataValidity {
    /// When the data arrived, milliseconds since the epoch
    pub updated: i64,
    /// When to next forward this field on the reduced output
    pub next_reduce_forward: i64,
    pub source: DataSource,
    /// Last source that actually delivered data, survives expiration
    pub last_source: DataSource,
    pub stale: bool,
}

impl DataValidity {
    pub fn is_valid(&self) -> bool {
        self.source.is_valid()
    }

    /// Age of the data in milliseconds, zero for timestamps in the future.
    pub fn age(&self, now: i64) -> i64 {
        (now - self.updated).max(0)
    }

    /// Acceptance gate: an expired or stale field takes any valid source, a
    /// fresh field only an equal or better one.
    pub fn accepts(&self, source: DataSource, now: i64) -> bool {
        if !source.is_valid() {
            return false;
        }
        if !self.source.is_valid()
            || self.stale
            || now > self.updated + TRACK_STALE
        {
            return true;
        }
        source >= self.source
    }

    /// Apply the gate and on success record the update. Returns whether the
    /// caller should install the new value.
    pub fn try_update(&mut self, source: DataSource, now: i64) -> bool {
        if !self.accepts(source, now) {
            return false;
        }
        self.source = source;
        self.last_source = source;
        self.updated = now;
        self.stale = false;
        true
    }

    /// Drive the fresh → stale → expired machine. JAERO and indirect data
    /// override the caller-supplied expiration timeout.
    pub fn refresh(&mut self, now: i64, expiration_timeout: i64, config: &Config) {
        if !self.source.is_valid() {
            return;
        }
        self.stale = now > self.updated + TRACK_STALE;

        let timeout = match self.source {
            DataSource::Jaero => config.track_expire_jaero,
            DataSource::Indirect if config.debug_rough_receiver_location => {
                TRACK_EXPIRE_ROUGH
            }
            _ => expiration_timeout,
        };
        if now > self.updated + timeout {
            self.source = DataSource::Invalid;
        }
    }

    /// Force expiration, keeping `last_source` for diagnostics.
    pub fn invalidate(&mut self) {
        self.source = DataSource::Invalid;
        self.stale = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(source: DataSource, updated: i64) -> DataValidity {
        DataValidity {
            updated,
            source,
            last_source: source,
            ..Default::default()
        }
    }

    #[test]
    fn lower_source_rejected_while_fresh() {
        let mut v = fresh(DataSource::Adsb, 1_000);
        assert!(!v.try_update(DataSource::Mlat, 2_000));
        assert_eq!(v.source, DataSource::Adsb);
        assert_eq!(v.updated, 1_000);
    }

    #[test]
    fn equal_or_better_source_accepted_while_fresh() {
        let mut v = fresh(DataSource::Mlat, 1_000);
        assert!(v.try_update(DataSource::Mlat, 2_000));
        assert_eq!(v.updated, 2_000);
        assert!(v.try_update(DataSource::Adsb, 3_000));
        assert_eq!(v.source, DataSource::Adsb);
    }

    #[test]
    fn any_source_accepted_once_stale() {
        let config = Config::default();
        let mut v = fresh(DataSource::Adsb, 1_000);
        v.refresh(1_000 + TRACK_STALE + 1, TRACK_EXPIRE, &config);
        assert!(v.stale);
        assert!(v.is_valid());
        assert!(v.try_update(DataSource::ModeAc, 1_000 + TRACK_STALE + 2));
        assert_eq!(v.source, DataSource::ModeAc);
        assert!(!v.stale);
    }

    #[test]
    fn expiration_drives_source_invalid() {
        let config = Config::default();
        let mut v = fresh(DataSource::ModeS, 0);
        v.refresh(TRACK_EXPIRE, TRACK_EXPIRE, &config);
        assert!(v.is_valid());
        v.refresh(TRACK_EXPIRE + 1, TRACK_EXPIRE, &config);
        assert!(!v.is_valid());
        assert_eq!(v.last_source, DataSource::ModeS);
    }

    #[test]
    fn jaero_expires_on_its_own_timeout() {
        let config = Config::default();
        let mut v = fresh(DataSource::Jaero, 0);
        v.refresh(TRACK_EXPIRE + 1, TRACK_EXPIRE, &config);
        assert!(v.is_valid());
        v.refresh(config.track_expire_jaero + 1, TRACK_EXPIRE, &config);
        assert!(!v.is_valid());
    }

    #[test]
    fn rough_receiver_position_expires_quickly() {
        let config = Config {
            debug_rough_receiver_location: true,
            ..Default::default()
        };
        let mut v = fresh(DataSource::Indirect, 0);
        v.refresh(TRACK_EXPIRE_ROUGH + 1, TRACK_EXPIRE, &config);
        assert!(!v.is_valid());
    }
}
