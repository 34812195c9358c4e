//! Distributed event-based particle filter for tracking a circular target.
//!
//! Every particle lives on its own node of a message-passing fabric. Nodes
//! exchange their weighted hypotheses as broadcast packets (32-bit key plus an
//! optional 32-bit payload), resample from the whole population once a
//! generation is complete, and score the next hypothesis against a sliding
//! window of sensor events.
//!
//! # Architecture
//!
//! - [`codec`]: key-space packing of coordinates, fields and regions
//! - [`event_queue`]: bounded event buffer between packet handler and update
//! - [`state_table`]: double-buffered table of every particle's state
//! - [`likelihood`]: sliding event window and angular-coverage scoring
//! - [`resample`]: normalization, roulette-wheel resampling, random walk
//! - [`exchange`]: turn-ordered state exchange and the send rendezvous
//! - [`roles`]: particle, aggregator and row-filter behaviour
//! - [`node`]: per-node context driven by packets, ticks and deferred tasks
//! - [`fabric`]: in-process router and fleet runtime
//!
//! # Usage
//!
//! ```ignore
//! use pf_engine::{Fleet, FleetSpec};
//!
//! let mut fleet = Fleet::build(&FleetSpec::default(), None)?;
//! fleet.inject_event(120, 80);
//! fleet.tick();
//! println!("target: {:?}", fleet.target());
//! ```

pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event_queue;
pub mod exchange;
pub mod fabric;
pub mod likelihood;
pub mod node;
pub mod particle;
pub mod peers;
pub mod recording;
pub mod resample;
pub mod roles;
pub mod scheduler;
pub mod simulation;
pub mod state_table;
pub mod test_utils;
pub mod timing;
pub mod transport;

pub use codec::{decode_xy, encode_xy, Field, FieldSet, Packet};
pub use config::{
    ExchangeMode, FilterParams, InitialHypothesis, NodeConfig, NodeKeys, ResumePolicy,
    RetryPolicy, Role,
};
pub use error::{CodecError, ConfigError, EngineError, SendError};
pub use event_queue::EventQueue;
pub use exchange::{Collector, TurnExchange};
pub use fabric::{Endpoint, Fleet, FleetSpec, Router};
pub use likelihood::{LikelihoodEngine, ANG_BUCKETS};
pub use node::{NodeContext, RoleState};
pub use particle::{ParticleState, SensorGeometry, R_MAX, R_MIN};
pub use recording::{MemoryRecorder, Record, Recorder};
pub use resample::{normalize, predict, resample, select_index};
pub use simulation::{SimulationConfig, TickOutcome};
pub use state_table::StateTable;
pub use timing::{TimingStats, UpdateTiming};
pub use transport::{send_with_backoff, Burst, Transport};
