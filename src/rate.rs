//! Sliding-window rate estimation.
//!
//! `RateEstimator` keeps roughly the last `interval` worth of
//! `(timestamp, cumulative count)` samples and reports how fast the count is
//! growing. Updates are amortized O(1): each sample stores the rate of the pair
//! it closes, so evicting a sample only subtracts one stored value from a
//! running sum.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// A rate reading from the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// No samples have been recorded.
    NoData,
    /// Only one sample exists, so the rate is unbounded.
    Unbounded,
    /// Counts per estimator interval.
    PerInterval(f64),
}

impl Rate {
    /// Numeric value, if one exists.
    pub fn value(self) -> Option<f64> {
        match self {
            Rate::PerInterval(v) => Some(v),
            _ => None,
        }
    }

    /// Rescale a per-`interval` reading to counts per second.
    pub fn per_second(self, interval: Duration) -> Rate {
        match self {
            Rate::PerInterval(v) => Rate::PerInterval(v / interval.as_secs_f64()),
            other => other,
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::NoData => f.write_str("n/a"),
            Rate::Unbounded => f.write_str("inf"),
            Rate::PerInterval(v) => write!(f, "{v:.2}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    when: Instant,
    count: u64,
    /// Rate between the previous sample and this one; zero for the oldest.
    pair_rate: f64,
}

/// Trailing-window throughput estimator.
#[derive(Debug)]
pub struct RateEstimator {
    samples: VecDeque<Sample>,
    interval: Duration,
    /// Sum of `pair_rate` over all retained samples.
    rate_sum: f64,
}

impl RateEstimator {
    /// Create an estimator covering the last `interval` of samples.
    pub fn new(interval: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            interval,
            rate_sum: 0.0,
        }
    }

    /// Window length; rates are reported in counts per this duration.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record the cumulative `count` observed at `when`.
    ///
    /// Timestamps must not go backwards. A sample taken at the same instant as
    /// the newest one replaces that sample's count.
    pub fn update(&mut self, when: Instant, count: u64) {
        debug_assert!(
            self.samples.back().map_or(true, |last| when >= last.when),
            "samples must be recorded in time order"
        );

        if let Some(last) = self.samples.back() {
            if when == last.when {
                let stale = self.samples.pop_back().map_or(0.0, |s| s.pair_rate);
                self.rate_sum -= stale;
            }
        }

        let pair_rate = match self.samples.back() {
            Some(prev) => self.pair_rate(prev, when, count),
            None => 0.0,
        };
        self.samples.push_back(Sample {
            when,
            count,
            pair_rate,
        });
        self.rate_sum += pair_rate;

        self.evict(when);
    }

    /// Growth between the oldest and newest retained samples, per interval.
    pub fn instant_rate(&self) -> Rate {
        match (self.samples.front(), self.samples.back()) {
            (None, _) | (_, None) => Rate::NoData,
            _ if self.samples.len() == 1 => Rate::Unbounded,
            (Some(oldest), Some(newest)) => {
                let elapsed = newest.when.duration_since(oldest.when);
                let delta = newest.count.saturating_sub(oldest.count) as f64;
                Rate::PerInterval(delta / (elapsed.as_secs_f64() / self.interval.as_secs_f64()))
            }
        }
    }

    /// Mean of the per-pair rates across the window, per interval.
    pub fn average_rate(&self) -> Rate {
        match self.samples.len() {
            0 => Rate::NoData,
            1 => Rate::Unbounded,
            n => Rate::PerInterval(self.rate_sum / (n - 1) as f64),
        }
    }

    fn pair_rate(&self, prev: &Sample, when: Instant, count: u64) -> f64 {
        let elapsed = when.duration_since(prev.when).as_secs_f64();
        let delta = count.saturating_sub(prev.count) as f64;
        delta / (elapsed / self.interval.as_secs_f64())
    }

    /// Drop samples older than the window, keeping the last sample at or before
    /// the horizon so the window never narrows below `interval`.
    fn evict(&mut self, now: Instant) {
        let Some(horizon) = now.checked_sub(self.interval) else {
            return;
        };

        while self.samples.len() > 2 && self.samples[1].when <= horizon {
            self.samples.pop_front();
            if let Some(front) = self.samples.front_mut() {
                self.rate_sum -= front.pair_rate;
                front.pair_rate = 0.0;
            }
        }

        if self.samples.len() < 2 {
            self.rate_sum = 0.0;
        }
    }
}
