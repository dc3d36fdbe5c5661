use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tb_error::NodeError;

// identity bytes are the x25519 public key of the host
pub type HostId = [u8; 32];

/// Shorthand for logs, first 4 bytes of the id
pub fn short_id(id: &HostId) -> String {
    hex::encode(&id[..4])
}

// ============================================================================
// Roles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Holds content and serves it
    Seed,
    /// Fetches content, the unit of measurement
    Leech,
    /// Connects and idles
    Passive,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Seed => write!(f, "Seed"),
            NodeType::Leech => write!(f, "Leech"),
            NodeType::Passive => write!(f, "Passive"),
        }
    }
}

// ============================================================================
// Addressing
// ============================================================================

/// Address info published by every instance on the `peers` topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    pub id: HostId,
    pub addrs: Vec<String>,
}

/// Roster entry collected before dialing begins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub addr: AddrInfo,
    pub node_type: NodeType,
}

// ============================================================================
// Content
// ============================================================================

/// Content identifier: blake3 digest of an encoded block
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", hex::encode(&self.0[..8]))
    }
}

/// File handle returned by a fetch
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub root: ContentId,
    pub data: Vec<u8>,
}

impl FetchedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

// ============================================================================
// Recorders
// ============================================================================

pub trait MetricsRecorder: Send + Sync {
    fn record(&self, key: &str, value: f64);
}

pub trait MessageRecorder: Send + Sync {
    fn record_message(&self, msg: &str);
}

// ============================================================================
// Node Capabilities
// ============================================================================

/// Connection side of a node
#[async_trait]
pub trait Host: Send + Sync {
    fn id(&self) -> HostId;

    fn addr_info(&self) -> AddrInfo;

    async fn connect(&self, peer: &AddrInfo) -> Result<(), NodeError>;

    /// Currently connected peers, sorted by id
    fn connected_peers(&self) -> Vec<HostId>;

    async fn close_connections(&self) -> Result<(), NodeError>;
}

/// Backend-specific access to the content DAG
#[async_trait]
pub trait DagService: Send + Sync {
    /// Outgoing links of a block, empty for leaves
    async fn links(&self, cid: &ContentId) -> Result<Vec<ContentId>, NodeError>;

    async fn remove_many(&self, cids: &[ContentId]) -> Result<(), NodeError>;
}

/// Uniform interface over the transfer backends.
///
/// The run lifecycle only ever talks to this trait.
#[async_trait]
pub trait Node: Send + Sync {
    async fn add(&self, file: &[u8]) -> Result<ContentId, NodeError>;

    async fn fetch(&self, cid: &ContentId, peers: &[PeerInfo]) -> Result<FetchedFile, NodeError>;

    async fn clear_datastore(&self, root: Option<&ContentId>) -> Result<(), NodeError>;

    fn emit_metrics(&self, recorder: &dyn MetricsRecorder) -> Result<(), NodeError>;

    fn emit_keep_alive(&self, recorder: &dyn MessageRecorder) -> Result<(), NodeError>;

    fn host(&self) -> Arc<dyn Host>;

    /// `None` for backends that do not expose a DAG
    fn dag_service(&self) -> Option<&dyn DagService>;
}
