//! Error types for node construction and the packet codec.
//!
//! Steady-state anomalies (queue drops, unknown senders, failed sends) are
//! counted rather than propagated; the errors here either abort a node before
//! it is scheduled or are handed back to the caller to decide.

use thiserror::Error;

/// Invalid configuration blob.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("particle count must be at least 1 (got {0})")]
    NoParticles(usize),

    #[error("ordinal {ordinal} is out of range for {n_particles} particles")]
    OrdinalOutOfRange { ordinal: usize, n_particles: usize },

    #[error("initial radius {0} is outside [{min}, {max}]", min = crate::particle::R_MIN, max = crate::particle::R_MAX)]
    RadiusOutOfRange(f32),

    #[error("node has no transmission key")]
    MissingOwnKey,

    #[error("base key {0:#010x} is not aligned to the field block")]
    MisalignedKey(u32),

    #[error("expected {expected} peer keys, got {got}")]
    PeerCount { expected: usize, got: usize },

    #[error("base key {0:#010x} is assigned to more than one sender")]
    DuplicateKey(u32),

    #[error("own key {0:#010x} is not present in the peer table")]
    OwnKeyNotInTable(u32),

    #[error("node has no {0} key")]
    MissingKey(&'static str),

    #[error("aggregated particle has no partner aggregator key")]
    MissingPartner,

    #[error("partner key {0:#010x} is not among the known senders")]
    UnknownPartner(u32),

    #[error("filter row {row} is outside the sensor height {height}")]
    RowOutOfRange { row: u32, height: u32 },

    #[error("{name} must be positive (got {value})")]
    NonPositive { name: &'static str, value: f32 },

    #[error("sensor {width}x{height} does not fit the 9-bit x / 8-bit y key encoding")]
    SensorSize { width: u32, height: u32 },
}

/// Errors from decoding a field packet.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("key {key:#010x} is below base key {base:#010x}")]
    KeyBelowBase { key: u32, base: u32 },

    #[error("field offset {0} does not name a particle field")]
    BadFieldOffset(u32),

    #[error("field packet {0:#010x} carries no payload")]
    MissingPayload(u32),
}

/// Outbound send gave up after the retry budget.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("send of key {key:#010x} abandoned after {attempts} attempts")]
pub struct SendError {
    pub key: u32,
    pub attempts: u32,
}

/// Fatal initialization failures. A node that returns one of these is never
/// scheduled.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not allocate {rows} state rows: {reason}")]
    Allocation { rows: usize, reason: String },

    #[error("protocol desync: {0}")]
    Desync(String),
}
