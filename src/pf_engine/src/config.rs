//! Node configuration blob and filter tunables.
//!
//! The bring-up layer hands each node a [`NodeConfig`] (identity, role, keys,
//! initial hypothesis) and a shared [`FilterParams`]. Both deserialize with
//! defaults for every field so a host can supply only what differs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::codec::{FIELD_MASK, X_MASK, Y_MASK};
use crate::error::ConfigError;
use crate::particle::{SensorGeometry, R_MAX, R_MIN};

/// What a node does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Hosts one particle hypothesis
    Particle,
    /// Collects all particles and returns a resample target to its partner
    Aggregator,
    /// Gates one sensor row by the broadcast region of interest
    RoiFilter,
}

/// How particles obtain the rest of the population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeMode {
    /// Every particle broadcasts to every other, in turn order
    PeerToPeer,
    /// Particles report to aggregators and resample from their partner
    Aggregated,
}

/// What to do with in-flight exchange state when resuming after a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Keep packet counters, rendezvous flags and the partially filled work
    /// buffer. A generation interrupted by the pause may then complete with
    /// stale rows.
    Retain,
    /// Clear counters, flags and the work buffer before the first tick.
    Reset,
}

/// Bounded retry for the outbound packet path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before the send is abandoned
    pub max_attempts: u32,
    /// Delay between attempts in microseconds (0 = spin hint only)
    pub backoff_us: u64,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_micros(self.backoff_us)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1_000,
            backoff_us: 1,
        }
    }
}

/// Tunables shared by every particle in a fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Width of the linear confidence ramp outside the unit band (pixels)
    pub inlier_par: f32,
    /// Likelihood floor
    pub min_like: f32,
    /// Outlier penalty, scaled by `ANG_BUCKETS / (π r²)`
    pub negative_bias: f32,
    /// Random walk half-width for x and y (pixels)
    pub sigma: f32,
    /// Fraction of `sigma` applied to the radius
    pub radius_sigma_scale: f32,
    /// Aggregated particles scale their walk by support: `sigma_scaler * n / ANG_BUCKETS`
    pub sigma_scaler: f32,
    /// Events kept in the sliding window
    pub window_capacity: usize,
    /// Events buffered between packet handler and update
    pub queue_capacity: usize,
    /// Events scored per pass, as a multiple of `π r`
    pub batch_scale: f32,
    /// Lower bound on a particle's reported support count
    pub min_support: f32,
    /// Window is shrunk to the weighted support when it exceeds it by this much
    pub window_slack: f32,
    /// Skip resampling while `Σw² · N` stays at or below this
    pub diversity_threshold: f32,
    /// Skip resampling while the weighted support is below this
    pub min_mean_support: f32,
    pub resume_policy: ResumePolicy,
    pub retry: RetryPolicy,
    pub geometry: SensorGeometry,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            inlier_par: 1.0,
            min_like: 0.2,
            negative_bias: 0.2,
            sigma: 1.0,
            radius_sigma_scale: 0.5,
            sigma_scaler: 4.0,
            window_capacity: 500,
            queue_capacity: 512,
            batch_scale: 1.0,
            min_support: 100.0,
            window_slack: 50.0,
            diversity_threshold: 2.0,
            min_mean_support: 0.0,
            resume_policy: ResumePolicy::Retain,
            retry: RetryPolicy::default(),
            geometry: SensorGeometry::default(),
        }
    }
}

impl FilterParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("inlier_par", self.inlier_par),
            ("min_like", self.min_like),
            ("batch_scale", self.batch_scale),
            ("window_capacity", self.window_capacity as f32),
            ("queue_capacity", self.queue_capacity as f32),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        let SensorGeometry { width, height } = self.geometry;
        if !(1..=X_MASK + 1).contains(&width) || !(1..=Y_MASK + 1).contains(&height) {
            return Err(ConfigError::SensorSize { width, height });
        }
        Ok(())
    }
}

/// Starting hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialHypothesis {
    pub x: f32,
    pub y: f32,
    pub r: f32,
}

impl Default for InitialHypothesis {
    fn default() -> Self {
        Self {
            x: 64.0,
            y: 64.0,
            r: 30.0,
        }
    }
}

/// Routing keys known to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeKeys {
    /// Own transmission base key; `None` means the node may not send
    pub own: Option<u32>,
    /// Base keys of every particle, indexed by ordinal (own key included)
    pub peers: Vec<u32>,
    /// Partner key: the aggregator's resample key for an aggregated particle,
    /// the partner particle's state key for an aggregator
    pub partner: Option<u32>,
    /// Region-of-interest broadcast key
    pub filter_update: Option<u32>,
    /// Base key for position output
    pub output: Option<u32>,
}

/// Per-node configuration blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Turn order within the particle population (0..N-1)
    pub ordinal: usize,
    pub role: Role,
    pub mode: ExchangeMode,
    /// The main particle drives the filters and owns recording
    pub main: bool,
    pub n_particles: usize,
    pub initial: InitialHypothesis,
    pub keys: NodeKeys,
    /// Hand a state vector to the recorder once per tick
    pub record: bool,
    /// Sensor row gated by a filter node
    pub filter_row: u32,
    /// Ticks between position outputs (0 disables)
    pub output_period_ticks: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ordinal: 0,
            role: Role::Particle,
            mode: ExchangeMode::PeerToPeer,
            main: false,
            n_particles: 1,
            initial: InitialHypothesis::default(),
            keys: NodeKeys::default(),
            record: false,
            filter_row: 0,
            output_period_ticks: 0,
        }
    }
}

impl NodeConfig {
    /// Check the blob before any allocation. Any failure here halts the node
    /// before it enters the scheduler.
    pub fn validate(&self, params: &FilterParams) -> Result<(), ConfigError> {
        params.validate()?;

        match self.role {
            Role::Particle => self.validate_particle(),
            Role::Aggregator => self.validate_aggregator(),
            Role::RoiFilter => {
                if self.keys.filter_update.is_none() {
                    return Err(ConfigError::MissingKey("filter update"));
                }
                if self.filter_row >= params.geometry.height {
                    return Err(ConfigError::RowOutOfRange {
                        row: self.filter_row,
                        height: params.geometry.height,
                    });
                }
                Ok(())
            }
        }
    }

    fn validate_particle(&self) -> Result<(), ConfigError> {
        if self.n_particles == 0 {
            return Err(ConfigError::NoParticles(0));
        }
        if self.ordinal >= self.n_particles {
            return Err(ConfigError::OrdinalOutOfRange {
                ordinal: self.ordinal,
                n_particles: self.n_particles,
            });
        }
        let r = self.initial.r;
        if !(R_MIN..=R_MAX).contains(&r) {
            return Err(ConfigError::RadiusOutOfRange(r));
        }
        let own = self.keys.own.ok_or(ConfigError::MissingOwnKey)?;
        check_aligned(own)?;

        match self.mode {
            ExchangeMode::PeerToPeer => {
                check_sender_table(&self.keys.peers, self.n_particles)?;
                if self.keys.peers[self.ordinal] != own {
                    return Err(ConfigError::OwnKeyNotInTable(own));
                }
            }
            ExchangeMode::Aggregated => {
                let partner = self.keys.partner.ok_or(ConfigError::MissingPartner)?;
                check_aligned(partner)?;
            }
        }
        Ok(())
    }

    fn validate_aggregator(&self) -> Result<(), ConfigError> {
        if self.n_particles == 0 {
            return Err(ConfigError::NoParticles(0));
        }
        let own = self.keys.own.ok_or(ConfigError::MissingOwnKey)?;
        check_aligned(own)?;
        check_sender_table(&self.keys.peers, self.n_particles)?;
        let partner = self.keys.partner.ok_or(ConfigError::MissingPartner)?;
        if !self.keys.peers.contains(&partner) {
            return Err(ConfigError::UnknownPartner(partner));
        }
        Ok(())
    }
}

fn check_aligned(key: u32) -> Result<(), ConfigError> {
    if key & FIELD_MASK != 0 {
        return Err(ConfigError::MisalignedKey(key));
    }
    Ok(())
}

fn check_sender_table(keys: &[u32], expected: usize) -> Result<(), ConfigError> {
    if keys.len() != expected {
        return Err(ConfigError::PeerCount {
            expected,
            got: keys.len(),
        });
    }
    let mut seen = HashSet::with_capacity(keys.len());
    for &key in keys {
        check_aligned(key)?;
        if !seen.insert(key) {
            return Err(ConfigError::DuplicateKey(key));
        }
    }
    Ok(())
}
