//! # tb_rust - Transfer Testbed
//!
//! A harness that benchmarks content transfer between many instances of a
//! peer-to-peer node. Every instance runs the same program; a shared sync
//! service assigns each one a role (seed, leech or passive) and keeps the
//! swarm in lock-step through named barriers while seeds publish a file,
//! leeches fetch it in waves, and every instance records metrics.
//!
//! ## Core Components
//!
//! - **Coordination**: [`tb_sync`] client trait, typed topics and barriers,
//!   with an in-process service in [`tb_sync_memory`]
//! - **Roles**: [`tb_roles`] bands sequence numbers into node types
//! - **Dialing**: [`tb_dialer`] full and sparse connection strategies
//! - **Seeding**: [`tb_fraction`] deterministic partial seeding of a file's
//!   block tree
//! - **Lifecycle**: [`tb_transfer`] drives one instance through every test
//!   permutation and run
//! - **Backends**: [`tb_backend`] selects a block-exchange node
//!   ([`tb_dag_node`]) or a direct-stream node ([`tb_stream_node`]), both on
//!   the in-memory swarm of [`tb_swarm`]
//! - **Metrics**: [`tb_metrics`] run identifiers, recorders and sinks
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tb_rust::{run_local, InstanceEnv, MemoryMetricsSink, TestParams, TestVars};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let params = TestParams { leech_count: 2, ..TestParams::default() };
//! let vars = Arc::new(TestVars::from_params(&params)?);
//! let envs = (0..4).map(|i| InstanceEnv::new(i, 4)).collect();
//!
//! let sink = MemoryMetricsSink::new();
//! let run = run_local(vars, envs, Arc::new(sink.clone()), 42).await?;
//! println!("{} metric points from {} instances", sink.len(), run.reports.len());
//! # Ok(())
//! # }
//! ```
//!
//! The `scenario_runner` binary in `simulator/` runs the same swarm from
//! YAML scenario files.

// Coordination
pub mod tb_error;
pub mod tb_interface;
pub mod tb_sync;
pub mod tb_sync_memory;

// Roles, topology and test matrix
pub mod tb_dialer;
pub mod tb_files;
pub mod tb_fraction;
pub mod tb_identity;
pub mod tb_network;
pub mod tb_params;
pub mod tb_roles;

// Nodes
pub mod tb_backend;
pub mod tb_blockstore;
pub mod tb_dag_node;
pub mod tb_stream_node;
pub mod tb_swarm;
pub mod tb_tcp;

// Lifecycle and reporting
pub mod tb_metrics;
pub mod tb_transfer;

// Re-export commonly used types
pub use tb_backend::{BackendKind, ExchangeKind, NodeBuilder, TransferNode};
pub use tb_dialer::Dialer;
pub use tb_error::{ConfigError, CoordinationError, NodeError, TestbedError};
pub use tb_interface::{AddrInfo, ContentId, Host, Node, NodeType, PeerInfo};
pub use tb_metrics::{
    CsvMetricsSink, LogMetricsSink, MemoryMetricsSink, MetricPoint, MetricsSink, MultiMetricsSink, RunIdentifier,
};
pub use tb_params::{TestParams, TestVars};
pub use tb_roles::{RoleAssignment, RoleCounts};
pub use tb_sync::{InstanceOutcome, SyncClient, Topic};
pub use tb_sync_memory::MemorySyncService;
pub use tb_transfer::{run_instance, run_local, InstanceEnv, InstanceReport, LocalRun, RunReport};
