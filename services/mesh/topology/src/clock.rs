//! Time sources.
//!
//! Metric ages, Hello timestamps and LSDB staleness are all measured in
//! nanoseconds on a monotonic clock. Link-state versions use wall-clock
//! nanoseconds so they keep increasing across restarts.

use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond clock
pub trait Clock: Send + Sync + fmt::Debug {
    /// Nanoseconds since an arbitrary fixed origin
    fn now(&self) -> u64;
}

/// Process-wide monotonic clock
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        static START: Lazy<Instant> = Lazy::new(Instant::now);
        START.elapsed().as_nanos() as u64
    }
}

/// Hand-driven clock for deterministic tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start` nanoseconds
    pub fn new(start: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute reading
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Wall-clock nanoseconds since the Unix epoch
pub fn wall_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5);
        assert_eq!(clock.now(), 5);
        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.now(), 1005);
        clock.set(42);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let clock = MonotonicClock;
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now() > a);
        assert!(wall_nanos() > 1_600_000_000_000_000_000);
    }
}
