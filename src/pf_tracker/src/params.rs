//! Tracker parameters
//!
//! Everything the host needs in one TOML file: the fleet (topology, particle
//! count, filter tunables, simulation length) plus input and output options.
//! Every field has a default, so an empty file is a valid configuration.

use anyhow::{ensure, Context, Result};
use pf_engine::{FleetSpec, InitialHypothesis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Synthetic input: a circle moving at constant velocity plus noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticParams {
    /// Starting circle
    pub start: InitialHypothesis,
    /// Velocity in pixels per tick
    pub vx: f32,
    pub vy: f32,
    /// Edge events per tick
    pub events_per_tick: usize,
    /// Background events per tick
    pub noise_per_tick: usize,
    /// Radial jitter of edge events (pixels)
    pub jitter: f32,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            start: InitialHypothesis {
                x: 152.0,
                y: 120.0,
                r: 20.0,
            },
            vx: 0.05,
            vy: 0.03,
            events_per_tick: 16,
            noise_per_tick: 2,
            jitter: 0.5,
        }
    }
}

/// Where events come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputParams {
    /// Spike-train file (`x;y;t1,t2,...` per line, times in ms). When unset
    /// the synthetic source is used.
    pub dataset: Option<PathBuf>,
    pub synthetic: SyntheticParams,
}

/// What the tracker writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputParams {
    /// JSON-lines file for the recorded `[x, y, r]` per tick
    pub recording: Option<PathBuf>,
    /// Pace ticks to the timer period instead of running flat out
    pub realtime: bool,
}

/// All tracker parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    pub fleet: FleetSpec,
    pub input: InputParams,
    pub output: OutputParams,
}

impl TrackerParams {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let params = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.fleet.n_particles > 0, "fleet.n_particles must be at least 1");
        ensure!(
            self.fleet.sim.timer_period_us > 0,
            "fleet.sim.timer_period_us must be positive"
        );
        self.fleet.params.validate()?;
        Ok(())
    }
}
