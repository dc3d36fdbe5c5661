//! Transfer Backends
//!
//! The backends are a closed set: [`TransferNode`] wraps each one and
//! implements [`Node`] by delegation, so the run lifecycle never names a
//! concrete backend. [`NodeBuilder`] checks that the backend can run with
//! the swarm's shape and constructs it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::tb_dag_node::{DagNode, DagNodeConfig};
use crate::tb_error::{ConfigError, NodeError};
use crate::tb_identity::HostKey;
use crate::tb_interface::{
    ContentId, DagService, FetchedFile, Host, MessageRecorder, MetricsRecorder, Node, PeerInfo,
};
use crate::tb_params::TestVars;
use crate::tb_roles::RoleCounts;
use crate::tb_stream_node::StreamNode;
use crate::tb_swarm::MemorySwarm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Dag,
    Stream,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dag" => Ok(BackendKind::Dag),
            "stream" => Ok(BackendKind::Stream),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Dag => write!(f, "dag"),
            BackendKind::Stream => write!(f, "stream"),
        }
    }
}

impl BackendKind {
    /// Reject swarm shapes the backend cannot run
    pub fn validate_topology(&self, instances: usize, counts: RoleCounts) -> Result<(), ConfigError> {
        match self {
            BackendKind::Dag => Ok(()),
            BackendKind::Stream => {
                let reason = if instances != 2 {
                    "requires exactly 2 instances"
                } else if counts.leech != 1 {
                    "requires exactly 1 leech"
                } else if counts.passive != 0 {
                    "does not support passive nodes"
                } else {
                    return Ok(());
                };
                Err(ConfigError::UnsupportedTopology {
                    backend: "stream",
                    reason,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    #[default]
    Session,
    Sequential,
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "session" => Ok(ExchangeKind::Session),
            "sequential" => Ok(ExchangeKind::Sequential),
            other => Err(ConfigError::UnsupportedExchange(other.to_string())),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Session => write!(f, "session"),
            ExchangeKind::Sequential => write!(f, "sequential"),
        }
    }
}

// ============================================================================
// Node Variants
// ============================================================================

pub enum TransferNode {
    Dag(DagNode),
    Stream(StreamNode),
}

impl TransferNode {
    pub fn kind(&self) -> BackendKind {
        match self {
            TransferNode::Dag(_) => BackendKind::Dag,
            TransferNode::Stream(_) => BackendKind::Stream,
        }
    }

    fn inner(&self) -> &dyn Node {
        match self {
            TransferNode::Dag(node) => node,
            TransferNode::Stream(node) => node,
        }
    }
}

#[async_trait]
impl Node for TransferNode {
    async fn add(&self, file: &[u8]) -> Result<ContentId, NodeError> {
        self.inner().add(file).await
    }

    async fn fetch(&self, cid: &ContentId, peers: &[PeerInfo]) -> Result<FetchedFile, NodeError> {
        self.inner().fetch(cid, peers).await
    }

    async fn clear_datastore(&self, root: Option<&ContentId>) -> Result<(), NodeError> {
        self.inner().clear_datastore(root).await
    }

    fn emit_metrics(&self, recorder: &dyn MetricsRecorder) -> Result<(), NodeError> {
        self.inner().emit_metrics(recorder)
    }

    fn emit_keep_alive(&self, recorder: &dyn MessageRecorder) -> Result<(), NodeError> {
        self.inner().emit_keep_alive(recorder)
    }

    fn host(&self) -> Arc<dyn Host> {
        self.inner().host()
    }

    fn dag_service(&self) -> Option<&dyn DagService> {
        self.inner().dag_service()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Constructs the transfer stack for one instance in a fixed order:
/// identity, blockstore, host registration, backend.
pub struct NodeBuilder {
    backend: BackendKind,
    dag: DagNodeConfig,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self {
            backend: BackendKind::Dag,
            dag: DagNodeConfig::default(),
        }
    }
}

impl NodeBuilder {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn from_vars(vars: &TestVars) -> Self {
        Self::new(vars.backend)
            .exchange(vars.exchange)
            .routing(vars.dht_enabled)
            .chunk_size(vars.chunk_size)
    }

    pub fn exchange(mut self, exchange: ExchangeKind) -> Self {
        self.dag.exchange = exchange;
        self
    }

    pub fn routing(mut self, enabled: bool) -> Self {
        self.dag.routing = enabled;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.dag.chunk_size = chunk_size;
        self
    }

    pub fn max_links(mut self, max_links: usize) -> Self {
        self.dag.max_links = max_links;
        self
    }

    pub fn build(
        &self,
        swarm: &MemorySwarm,
        key: &HostKey,
        instances: usize,
        counts: RoleCounts,
    ) -> Result<TransferNode, ConfigError> {
        self.backend.validate_topology(instances, counts)?;
        log::debug!("Building {} node ({} exchange)", self.backend, self.dag.exchange);

        Ok(match self.backend {
            BackendKind::Dag => TransferNode::Dag(DagNode::new(swarm, key, self.dag)),
            BackendKind::Stream => TransferNode::Stream(StreamNode::new(swarm, key)),
        })
    }
}
