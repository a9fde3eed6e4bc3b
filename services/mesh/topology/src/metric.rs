//! Per-route latency metric.
//!
//! A [`MetricEstimator`] keeps the last [`AVERAGE_WINDOW`] RTT samples of one
//! physical route. Its value is the average RTT penalized cubically by the
//! fraction of expected Hello rounds that produced no sample, so a lossy
//! route looks much worse than a merely slow one.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Interval between Hello messages on each route
pub const HELLO_INTERVAL: Duration = Duration::from_millis(1024);

/// A route without samples for this long is dead
pub const ROUTER_DEAD_INTERVAL: Duration = Duration::from_secs(256);

/// Percentage change of an adjacency metric that triggers a flood
pub const UPDATE_THRESHOLD: u64 = 32;

/// Metric of an unusable route (one hour in nanoseconds)
pub const MAX_METRIC: u64 = 3_600_000_000_000;

/// Number of samples averaged per route
pub const AVERAGE_WINDOW: usize = 9;

const FIXED_ONE: u128 = 128;

/// One RTT measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RttSample {
    /// Round trip time in nanoseconds
    pub latency: u64,
    /// Monotonic time the sample was taken
    pub observed_at: u64,
}

/// Sliding window of RTT samples for one route
#[derive(Debug, Clone, Default)]
pub struct MetricEstimator {
    samples: VecDeque<RttSample>,
}

impl MetricEstimator {
    /// Create an empty estimator
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(AVERAGE_WINDOW),
        }
    }

    /// Record a sample, evicting the oldest when the window is full
    pub fn push(&mut self, sample: RttSample) {
        if self.samples.len() == AVERAGE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Retained samples, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &RttSample> {
        self.samples.iter()
    }

    /// Number of retained samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been recorded
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Current metric at monotonic time `now`.
    ///
    /// [`MAX_METRIC`] when empty or when the newest sample is older than
    /// [`ROUTER_DEAD_INTERVAL`]. Live values never reach [`MAX_METRIC`].
    pub fn value(&self, now: u64) -> u64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return MAX_METRIC;
        };
        if now.saturating_sub(last.observed_at) > ROUTER_DEAD_INTERVAL.as_nanos() as u64 {
            return MAX_METRIC;
        }

        let count = self.samples.len() as u128;
        let sum: u128 = self.samples.iter().map(|s| s.latency as u128).sum();
        let interval = HELLO_INTERVAL.as_nanos();
        let span = last.observed_at.saturating_sub(first.observed_at) as u128;
        let hello_count = (span + interval / 2) / interval + 1;
        let ratio = hello_count * FIXED_ONE / count;

        let value = sum / count * ratio * ratio * ratio / (FIXED_ONE * FIXED_ONE * FIXED_ONE);
        value.min((MAX_METRIC - 1) as u128) as u64
    }

    /// Human readable value and sample age
    pub fn describe(&self, now: u64) -> String {
        let age = self
            .samples
            .back()
            .map(|s| now.saturating_sub(s.observed_at))
            .unwrap_or_default();
        format!(
            "{:?} at {:?} ago",
            Duration::from_nanos(self.value(now)),
            Duration::from_nanos(age)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: u64 = 1_024_000_000;

    fn sample(latency: u64, observed_at: u64) -> RttSample {
        RttSample {
            latency,
            observed_at,
        }
    }

    #[test]
    fn test_empty_is_max() {
        assert_eq!(MetricEstimator::new().value(0), MAX_METRIC);
    }

    #[test]
    fn test_single_sample() {
        let mut m = MetricEstimator::new();
        m.push(sample(5_000_000, 100));
        assert_eq!(m.value(100), 5_000_000);
    }

    #[test]
    fn test_stale_is_max() {
        let mut m = MetricEstimator::new();
        for i in 0..9 {
            m.push(sample(1_000, i * HELLO));
        }
        let last = 8 * HELLO;
        let dead = ROUTER_DEAD_INTERVAL.as_nanos() as u64;
        assert_ne!(m.value(last + dead), MAX_METRIC);
        assert_eq!(m.value(last + dead + 1), MAX_METRIC);
    }

    #[test]
    fn test_window_keeps_newest() {
        let mut m = MetricEstimator::new();
        for i in 0..15u64 {
            m.push(sample(i, i * HELLO));
        }
        let kept: Vec<u64> = m.samples().map(|s| s.latency).collect();
        assert_eq!(kept, (6..15).collect::<Vec<_>>());
        assert_eq!(m.len(), AVERAGE_WINDOW);
    }

    #[test]
    fn test_regular_cadence_is_plain_average() {
        let mut m = MetricEstimator::new();
        for (i, rtt) in [100u64, 200, 300].into_iter().enumerate() {
            m.push(sample(rtt, i as u64 * HELLO));
        }
        assert_eq!(m.value(2 * HELLO), 200);
    }

    #[test]
    fn test_missing_hellos_penalized_cubically() {
        let mut m = MetricEstimator::new();
        // two samples four Hello rounds apart: 5 expected, 2 received
        m.push(sample(1_000, 0));
        m.push(sample(1_000, 4 * HELLO));
        // ratio = 5 * 128 / 2 = 320, (320/128)^3 = 15.625
        assert_eq!(m.value(4 * HELLO), 15_625);
    }

    #[test]
    fn test_live_value_clamped_below_max() {
        let mut m = MetricEstimator::new();
        m.push(sample(MAX_METRIC, 0));
        m.push(sample(MAX_METRIC, 200 * HELLO));
        assert_eq!(m.value(200 * HELLO), MAX_METRIC - 1);
    }
}
