//! Wall-clock source for stale/expire arithmetic.
//!
//! Timestamps are epoch milliseconds so cached entries survive persistence
//! across processes. Delays (refetch, retry) run on tokio timers and are not
//! routed through this trait.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Millisecond value standing in for an unbounded duration.
pub const INFINITE_MS: i64 = i64::MAX;

pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time in epoch milliseconds.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock advanced by hand. Test tooling; exported so downstream crates can
/// drive expiry in their own tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.now_ms
            .fetch_add(duration_ms(delta), Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Convert a duration to milliseconds, saturating oversized values to the
/// infinite sentinel.
#[must_use]
pub fn duration_ms(duration: Duration) -> i64 {
    if duration == Duration::MAX {
        return INFINITE_MS;
    }
    i64::try_from(duration.as_millis()).unwrap_or(INFINITE_MS)
}

#[must_use]
pub const fn is_infinite(ms: i64) -> bool {
    ms == INFINITE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance(Duration::from_millis(150));
        assert_eq!(clock.now_ms(), 1_150);

        clock.set(0);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_secs(2)), 2_000);
        assert!(is_infinite(duration_ms(Duration::MAX)));
        assert!(!is_infinite(duration_ms(Duration::from_secs(1))));
    }

    #[test]
    fn test_system_clock_is_monotone_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
