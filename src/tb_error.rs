//! Error taxonomy for the testbed
//!
//! - [`ConfigError`]: raised while validating parameters, always before the first barrier
//! - [`CoordinationError`]: publish/subscribe/barrier failures, fatal to the instance
//! - [`NodeError`]: failures reported by a transfer backend
//! - [`TestbedError`]: what a whole instance run returns
//!
//! Fetch errors are the only backend errors that never become a [`TestbedError`]:
//! the run loop counts them as a measured outcome.

use std::io;

use thiserror::Error;

use crate::tb_interface::ContentId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid seed fraction {0}")]
    InvalidSeedFraction(String),

    #[error("could not convert '{0}' to integer(s)")]
    InvalidIntList(String),

    #[error("unsupported dialer: {0}")]
    UnsupportedDialer(String),

    #[error("unsupported exchange interface: {0}")]
    UnsupportedExchange(String),

    #[error("unsupported node type: {0}")]
    UnsupportedBackend(String),

    /// Backend cannot run with the configured swarm shape.
    #[error("{backend} transfer {reason}")]
    UnsupportedTopology {
        backend: &'static str,
        reason: &'static str,
    },

    #[error("input data type {0} not implemented")]
    UnsupportedInputData(String),

    #[error("leech count {leech} plus passive count {passive} exceeds {instances} instances")]
    RoleCountsExceedInstances {
        leech: usize,
        passive: usize,
        instances: usize,
    },

    #[error("leech count {leech} leaves no seed among {instances} instances")]
    NoSeeds { leech: usize, instances: usize },

    #[error("number of waves must be at least 1")]
    ZeroWaves,

    #[error("seeder rate must be at least 1 percent")]
    ZeroSeederRate,

    #[error("no test permutations configured")]
    NoPermutations,

    #[error("failed to read data directory {path}: {source}")]
    DataDir {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Deadline passed while waiting on a barrier state or topic.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("subscription to {0} closed")]
    SubscriptionClosed(String),

    #[error("failed to encode payload for {topic}: {reason}")]
    Encode { topic: String, reason: String },

    #[error("failed to decode payload from {topic}: {reason}")]
    Decode { topic: String, reason: String },
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("block {0} not found")]
    NotFound(ContentId),

    #[error("no provider for block {0}")]
    NoProvider(ContentId),

    #[error("peer {0} unreachable")]
    Unreachable(String),

    #[error("error while dialing peer {peer}: {reason}")]
    Dial { peer: String, reason: String },

    #[error("malformed block {0}")]
    Malformed(ContentId),

    #[error("no seed in peer roster")]
    NoSeed,

    #[error("size mismatch: expected {expected}, got {got} bytes")]
    SizeMismatch { expected: u64, got: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TestbedError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("failed to set up network: {0}")]
    Network(#[source] NodeError),

    #[error("failed to add file: {0}")]
    Add(#[source] NodeError),

    #[error("failed to dial peers: {0}")]
    Dial(#[source] NodeError),

    #[error("tcp side channel failed: {0}")]
    Tcp(#[source] NodeError),

    #[error("failed to emit metrics: {0}")]
    Metrics(#[source] NodeError),

    #[error("cleanup failed: {0}")]
    Cleanup(#[source] NodeError),

    #[error("failed to write fetched file: {0}")]
    Scratch(#[source] io::Error),

    #[error("test timed out")]
    Timeout,

    #[error("instance task aborted: {0}")]
    Aborted(String),
}
