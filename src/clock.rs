//! Injectable time source. Production code uses [`SystemClock`]; tests use
//! [`FakeClock`] so scheduling and idle-timeout logic can be asserted
//! without real sleeps (spec.md §2 calls the `Clock` a leaf dependency of
//! everything else).

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Monotonic + wall-clock time, injectable for tests.
pub trait Clock: Send + Sync {
    /// Wall-clock time, used for `created_at`/`execution_time` comparisons
    /// and anything persisted to a repository.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant, used for measuring elapsed durations (container
    /// run time, idle duration) without being affected by clock skew.
    fn monotonic_now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose wall-clock value can be advanced explicitly by tests.
/// The monotonic half still uses a real `Instant` base point offset by the
/// same advanced amount, since [`Instant`] cannot be constructed from an
/// arbitrary value.
pub struct FakeClock {
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    offset_millis: AtomicI64,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            base_instant: Instant::now(),
            base_utc: start,
            offset_millis: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.offset_millis
            .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.base_utc + chrono::Duration::milliseconds(self.offset_millis.load(Ordering::SeqCst))
    }

    fn monotonic_now(&self) -> Instant {
        self.base_instant
            + std::time::Duration::from_millis(self.offset_millis.load(Ordering::SeqCst).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_wall_clock() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now_utc(), start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(30));
    }

    #[test]
    fn fake_clock_monotonic_tracks_advance() {
        let clock = FakeClock::new(Utc::now());
        let t0 = clock.monotonic_now();
        clock.advance(chrono::Duration::milliseconds(500));
        let t1 = clock.monotonic_now();
        assert!(t1 >= t0);
        assert!(t1.duration_since(t0) >= std::time::Duration::from_millis(500));
    }

    #[test]
    fn system_clock_is_monotonic_nondecreasing() {
        let clock = SystemClock;
        let t0 = clock.monotonic_now();
        let t1 = clock.monotonic_now();
        assert!(t1 >= t0);
    }
}
