//! Injected time source
//!
//! Every wallclock read in the store (`uid_validity`, `received_at`,
//! `internal_date` fallbacks, retry scheduling) and every monotonic read
//! (MIME boundary counters) goes through [`Clock`], so tests can pin time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Time source abstraction
///
/// `now` is wallclock; `ticks` is a strictly increasing counter with
/// nanosecond-scale granularity, used where uniqueness matters more than
/// absolute time (MIME boundary generation).
pub trait Clock: Send + Sync {
    /// Current wallclock time in UTC
    fn now(&self) -> DateTime<Utc>;

    /// Next value of a strictly increasing high-resolution counter
    fn ticks(&self) -> u64;
}

/// Default clock backed by the system time
///
/// The tick counter is seeded from the UNIX epoch nanoseconds at
/// construction and incremented on every read, so two reads never return
/// the same value even within one nanosecond.
pub struct SystemClock {
    counter: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            counter: AtomicU64::new(seed),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn ticks(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Clock pinned to a fixed instant
///
/// `now` always returns the construction time; `ticks` still increases so
/// boundary generation stays unique. Intended for tests and deterministic
/// replay.
pub struct FixedClock {
    instant: DateTime<Utc>,
    counter: AtomicU64,
}

impl FixedClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            instant,
            counter: AtomicU64::new(1),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.instant
    }

    fn ticks(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Shared clock handle used throughout the store
pub type SharedClock = Arc<dyn Clock>;

/// Convert a stored epoch-seconds column back to UTC
///
/// Out-of-range values clamp to the epoch rather than panic; the store
/// never writes such values itself.
pub(crate) fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::{Clock, FixedClock, SystemClock};

    #[test]
    fn system_clock_ticks_are_strictly_increasing() {
        let clock = SystemClock::new();
        let a = clock.ticks();
        let b = clock.ticks();
        let c = clock.ticks();
        assert!(a < b && b < c);
    }

    #[test]
    fn fixed_clock_pins_now_but_advances_ticks() {
        let instant = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::at(instant);
        assert_eq!(clock.now(), instant);
        assert_eq!(clock.now(), instant);
        assert!(clock.ticks() < clock.ticks());
    }
}
