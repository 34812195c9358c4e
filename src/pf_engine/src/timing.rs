//! Update-step timing for profiling.
//!
//! Real timing is collected only with the `profiling` feature. Without it the
//! timer is a zero-sized no-op and every duration reads as zero.

use serde::{Deserialize, Serialize};
use std::time::Duration;
#[cfg(feature = "profiling")]
use std::time::Instant;

/// Breakdown of one filter update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateTiming {
    pub total_ms: f64,
    /// Normalization, resampling and prediction
    pub resample_ms: f64,
    /// Draining the event queue into the window
    pub drain_ms: f64,
    /// Likelihood pass
    pub likelihood_ms: f64,
}

/// Running totals over many updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

impl TimingStats {
    pub fn add(&mut self, timing: &UpdateTiming) {
        self.count += 1;
        self.total_ms += timing.total_ms;
        self.max_ms = self.max_ms.max(timing.total_ms);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

#[cfg(feature = "profiling")]
pub struct Timer {
    start: Instant,
}

#[cfg(feature = "profiling")]
impl Timer {
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(not(feature = "profiling"))]
pub struct Timer;

#[cfg(not(feature = "profiling"))]
impl Timer {
    #[inline(always)]
    pub fn start() -> Self {
        Self
    }

    #[inline(always)]
    pub fn elapsed_ms(&self) -> f64 {
        0.0
    }

    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let mut stats = TimingStats::default();
        assert_eq!(stats.mean_ms(), 0.0);
        stats.add(&UpdateTiming {
            total_ms: 2.0,
            ..UpdateTiming::default()
        });
        stats.add(&UpdateTiming {
            total_ms: 4.0,
            ..UpdateTiming::default()
        });
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean_ms(), 3.0);
        assert_eq!(stats.max_ms, 4.0);
    }

    #[test]
    fn test_timer_is_monotonic() {
        let timer = Timer::start();
        assert!(timer.elapsed_ms() >= 0.0);
        assert!(timer.elapsed() >= Duration::ZERO);
    }
}
