//! Timer-tick bookkeeping: simulation length, pause/resume and the
//! once-per-second rate report cadence.

use serde::{Deserialize, Serialize};

/// Microseconds between rate reports.
const RATE_PERIOD_US: u64 = 1_000_000;

/// Run-time parameters handed down by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Timer period in microseconds
    pub timer_period_us: u32,
    /// Ticks to run before pausing; `None` runs forever
    pub ticks: Option<u32>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            timer_period_us: 1_000,
            ticks: None,
        }
    }
}

/// Result of advancing the clock by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Normal tick at the given time
    Running(u32),
    /// The simulation length was just reached; the node must flush and pause
    Completed,
    /// Paused; nothing to do until resumed
    Paused,
}

#[derive(Debug, Clone)]
pub struct SimClock {
    config: SimulationConfig,
    time: u32,
    paused: bool,
    next_report_us: u64,
}

impl SimClock {
    /// Starts one tick before zero so the first tick is tick 0.
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            time: u32::MAX,
            paused: false,
            next_report_us: 0,
        }
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn tick(&mut self) -> TickOutcome {
        if self.paused {
            return TickOutcome::Paused;
        }
        self.time = self.time.wrapping_add(1);
        if let Some(limit) = self.config.ticks {
            if self.time >= limit {
                self.paused = true;
                return TickOutcome::Completed;
            }
        }
        TickOutcome::Running(self.time)
    }

    /// Restart at tick 0 on the next tick, optionally with a new length.
    pub fn resume(&mut self, ticks: Option<u32>) {
        self.config.ticks = ticks;
        self.time = u32::MAX;
        self.paused = false;
        self.next_report_us = 0;
    }

    /// True once per simulated second.
    pub fn report_due(&mut self) -> bool {
        let now_us = u64::from(self.time) * u64::from(self.config.timer_period_us);
        if now_us >= self.next_report_us {
            self.next_report_us += RATE_PERIOD_US;
            true
        } else {
            false
        }
    }
}
