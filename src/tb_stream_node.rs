//! Stream Transfer Backend
//!
//! Whole-file transfer over a direct stream to the seed, the baseline for a
//! single seed/leech pair. There is no block tree and no exchange protocol,
//! so the backend exposes no DAG and records no protocol counters.

use std::sync::Arc;

use async_trait::async_trait;

use crate::tb_blockstore::{block_id, Block, MemoryBlockstore};
use crate::tb_error::NodeError;
use crate::tb_identity::HostKey;
use crate::tb_interface::{
    short_id, ContentId, DagService, FetchedFile, Host, MessageRecorder, MetricsRecorder, Node, NodeType, PeerInfo,
};
use crate::tb_swarm::{MemoryHost, MemorySwarm};

pub struct StreamNode {
    host: Arc<MemoryHost>,
    store: MemoryBlockstore,
    swarm: MemorySwarm,
}

impl StreamNode {
    pub fn new(swarm: &MemorySwarm, key: &HostKey) -> Self {
        let store = MemoryBlockstore::new();
        let host = Arc::new(swarm.join(key, store.clone()));
        Self {
            host,
            store,
            swarm: swarm.clone(),
        }
    }
}

#[async_trait]
impl Node for StreamNode {
    async fn add(&self, file: &[u8]) -> Result<ContentId, NodeError> {
        let encoded = Block::Raw(file.to_vec()).encode();
        let id = block_id(&encoded);
        self.store.put(id, encoded);
        Ok(id)
    }

    async fn fetch(&self, cid: &ContentId, peers: &[PeerInfo]) -> Result<FetchedFile, NodeError> {
        let seed = peers
            .iter()
            .find(|p| p.node_type == NodeType::Seed)
            .ok_or(NodeError::NoSeed)?;

        let me = self.host.id();
        if !self.host.connected_peers().contains(&seed.addr.id) {
            self.host.connect(&seed.addr).await?;
        }

        let served = self
            .swarm
            .serve(&seed.addr.id, &me, cid)?
            .ok_or(NodeError::NotFound(*cid))?;
        tokio::time::sleep(served.delay).await;
        log::debug!("{} streamed {} bytes from {}", short_id(&me), served.bytes.len(), short_id(&seed.addr.id));

        match Block::decode(&served.bytes) {
            Some(Block::Raw(data)) => Ok(FetchedFile { root: *cid, data }),
            _ => Err(NodeError::Malformed(*cid)),
        }
    }

    async fn clear_datastore(&self, _root: Option<&ContentId>) -> Result<(), NodeError> {
        self.store.clear();
        Ok(())
    }

    fn emit_metrics(&self, _recorder: &dyn MetricsRecorder) -> Result<(), NodeError> {
        Ok(())
    }

    fn emit_keep_alive(&self, recorder: &dyn MessageRecorder) -> Result<(), NodeError> {
        recorder.record_message("I am still alive!");
        Ok(())
    }

    fn host(&self) -> Arc<dyn Host> {
        self.host.clone()
    }

    fn dag_service(&self) -> Option<&dyn DagService> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tb_interface::AddrInfo;

    fn info(node: &StreamNode, node_type: NodeType) -> PeerInfo {
        PeerInfo {
            addr: node.host().addr_info(),
            node_type,
        }
    }

    #[tokio::test]
    async fn test_stream_fetch_from_seed() {
        let swarm = MemorySwarm::new(0);
        let seed = StreamNode::new(&swarm, &HostKey::from_seed(1));
        let leech = StreamNode::new(&swarm, &HostKey::from_seed(2));

        let data = vec![42u8; 4096];
        let root = seed.add(&data).await.unwrap();
        let roster = vec![info(&leech, NodeType::Leech), info(&seed, NodeType::Seed)];

        let fetched = leech.fetch(&root, &roster).await.unwrap();
        assert_eq!(fetched.data, data);
        assert!(leech.host().connected_peers().contains(&seed.host().id()));
        assert!(leech.dag_service().is_none());
    }

    #[tokio::test]
    async fn test_stream_without_seed() {
        let swarm = MemorySwarm::new(0);
        let leech = StreamNode::new(&swarm, &HostKey::from_seed(2));
        let roster = vec![info(&leech, NodeType::Leech)];
        assert!(matches!(
            leech.fetch(&ContentId([0; 32]), &roster).await,
            Err(NodeError::NoSeed)
        ));
    }

    #[tokio::test]
    async fn test_stream_unknown_content() {
        let swarm = MemorySwarm::new(0);
        let seed = StreamNode::new(&swarm, &HostKey::from_seed(1));
        let leech = StreamNode::new(&swarm, &HostKey::from_seed(2));
        let roster = vec![PeerInfo {
            addr: AddrInfo {
                id: seed.host().id(),
                addrs: vec![],
            },
            node_type: NodeType::Seed,
        }];
        assert!(matches!(
            leech.fetch(&ContentId([1; 32]), &roster).await,
            Err(NodeError::NotFound(_))
        ));
    }
}
