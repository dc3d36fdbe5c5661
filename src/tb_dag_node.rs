//! DAG Transfer Backend
//!
//! Content is chunked into a block tree ([`build_dag`]) and fetched block by
//! block from other hosts of the swarm. Two exchange strategies:
//!
//! - `Session`: each tree level is requested concurrently, and every
//!   candidate provider is asked for each block. The fastest copy wins and
//!   the others are counted as duplicates.
//! - `Sequential`: one block at a time, providers tried in order until one
//!   has the block.
//!
//! Candidate providers are the connected peers. With provider routing
//! enabled, any host in the swarm holding the block is a candidate.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::tb_backend::ExchangeKind;
use crate::tb_blockstore::{build_dag, Block, MemoryBlockstore, MAX_LINKS};
use crate::tb_error::NodeError;
use crate::tb_identity::HostKey;
use crate::tb_interface::{
    short_id, ContentId, DagService, FetchedFile, Host, HostId, MessageRecorder, MetricsRecorder, Node, PeerInfo,
};
use crate::tb_params::DEFAULT_CHUNK_SIZE;
use crate::tb_swarm::{MemoryHost, MemorySwarm, Served};

#[derive(Debug, Clone, Copy)]
pub struct DagNodeConfig {
    pub exchange: ExchangeKind,
    /// Find providers anywhere in the swarm, not only among connected peers
    pub routing: bool,
    pub chunk_size: usize,
    pub max_links: usize,
}

impl Default for DagNodeConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeKind::Session,
            routing: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_links: MAX_LINKS,
        }
    }
}

pub struct DagNode {
    host: Arc<MemoryHost>,
    store: MemoryBlockstore,
    swarm: MemorySwarm,
    config: DagNodeConfig,
}

impl DagNode {
    pub fn new(swarm: &MemorySwarm, key: &HostKey, config: DagNodeConfig) -> Self {
        let store = MemoryBlockstore::new();
        let host = Arc::new(swarm.join(key, store.clone()));
        Self {
            host,
            store,
            swarm: swarm.clone(),
            config,
        }
    }

    pub fn blockstore(&self) -> &MemoryBlockstore {
        &self.store
    }

    fn id(&self) -> HostId {
        self.host.id()
    }

    fn providers(&self, cid: &ContentId) -> Vec<HostId> {
        if self.config.routing {
            self.swarm.holders(cid, &self.id())
        } else {
            self.host.connected_peers()
        }
    }

    /// Store a block that arrived and decode it
    fn accept(&self, cid: &ContentId, bytes: &[u8]) -> Result<Block, NodeError> {
        // a concurrent fetch of identical content may have stored it first
        let fresh = self.store.put(*cid, bytes.to_vec());
        self.swarm.record_received(&self.id(), bytes.len(), !fresh);
        Block::decode(bytes).ok_or(NodeError::Malformed(*cid))
    }

    async fn fetch_block(&self, cid: ContentId) -> Result<Block, NodeError> {
        if self.store.has(&cid) {
            return self.store.block(&cid);
        }

        let me = self.id();
        match self.config.exchange {
            ExchangeKind::Sequential => {
                for provider in self.providers(&cid) {
                    if let Some(served) = self.swarm.serve(&provider, &me, &cid)? {
                        tokio::time::sleep(served.delay).await;
                        return self.accept(&cid, &served.bytes);
                    }
                }
                Err(NodeError::NoProvider(cid))
            }
            ExchangeKind::Session => {
                let mut served: Vec<Served> = Vec::new();
                for provider in self.providers(&cid) {
                    if let Some(s) = self.swarm.serve(&provider, &me, &cid)? {
                        served.push(s);
                    }
                }
                served.sort_by_key(|s| s.delay);

                let Some(first) = served.first() else {
                    return Err(NodeError::NoProvider(cid));
                };
                tokio::time::sleep(first.delay).await;
                log::trace!("{} got {:?} from {}", short_id(&me), cid, short_id(&first.provider));

                let block = self.accept(&cid, &first.bytes)?;
                for dup in &served[1..] {
                    self.swarm.record_received(&me, dup.bytes.len(), true);
                }
                Ok(block)
            }
        }
    }

    async fn fetch_tree(&self, root: &ContentId) -> Result<(), NodeError> {
        match self.config.exchange {
            ExchangeKind::Sequential => {
                let mut stack = vec![*root];
                while let Some(cid) = stack.pop() {
                    let block = self.fetch_block(cid).await?;
                    stack.extend(block.links().iter().rev());
                }
            }
            ExchangeKind::Session => {
                let mut level = vec![*root];
                while !level.is_empty() {
                    let blocks = try_join_all(level.iter().map(|cid| self.fetch_block(*cid))).await?;
                    level = blocks.iter().flat_map(|b| b.links().to_vec()).collect();
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Node for DagNode {
    async fn add(&self, file: &[u8]) -> Result<ContentId, NodeError> {
        let dag = build_dag(file, self.config.chunk_size, self.config.max_links);
        log::debug!(
            "{} added {} bytes as {} leaves under {:?}",
            short_id(&self.id()),
            file.len(),
            dag.leaves,
            dag.root
        );
        self.store.put_all(dag.blocks);
        Ok(dag.root)
    }

    async fn fetch(&self, cid: &ContentId, _peers: &[PeerInfo]) -> Result<FetchedFile, NodeError> {
        self.fetch_tree(cid).await?;
        let data = self.store.read_file(cid)?;
        Ok(FetchedFile { root: *cid, data })
    }

    async fn clear_datastore(&self, _root: Option<&ContentId>) -> Result<(), NodeError> {
        self.store.clear();
        Ok(())
    }

    fn emit_metrics(&self, recorder: &dyn MetricsRecorder) -> Result<(), NodeError> {
        self.swarm.stats(&self.id()).emit(recorder);
        Ok(())
    }

    fn emit_keep_alive(&self, recorder: &dyn MessageRecorder) -> Result<(), NodeError> {
        let stats = self.swarm.stats(&self.id());
        recorder.record_message(&format!(
            "I am still alive! Total In: {} - TotalOut: {}",
            stats.data_rcvd, stats.data_sent
        ));
        Ok(())
    }

    fn host(&self) -> Arc<dyn Host> {
        self.host.clone()
    }

    fn dag_service(&self) -> Option<&dyn DagService> {
        Some(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tb_fraction::{apply_seed_fraction, SeedFraction};
    use crate::tb_metrics::{MemoryMetricsSink, MetricsSink};
    use crate::tb_network::{LinkShape, NetworkShaper};
    use std::time::Duration;

    struct KeyRecorder(MemoryMetricsSink);

    impl MetricsRecorder for KeyRecorder {
        fn record(&self, key: &str, value: f64) {
            self.0.record_point(key, value);
        }
    }

    fn config(exchange: ExchangeKind, routing: bool) -> DagNodeConfig {
        DagNodeConfig {
            exchange,
            routing,
            chunk_size: 64,
            max_links: 4,
        }
    }

    fn file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[tokio::test]
    async fn test_fetch_from_connected_seed() {
        for exchange in [ExchangeKind::Session, ExchangeKind::Sequential] {
            let swarm = MemorySwarm::new(1);
            let seed = DagNode::new(&swarm, &HostKey::from_seed(1), config(exchange, false));
            let leech = DagNode::new(&swarm, &HostKey::from_seed(2), config(exchange, false));

            let data = file(1000);
            let root = seed.add(&data).await.unwrap();

            // not connected yet
            assert!(matches!(leech.fetch(&root, &[]).await, Err(NodeError::NoProvider(_))));

            leech.host().connect(&seed.host().addr_info()).await.unwrap();
            let fetched = leech.fetch(&root, &[]).await.unwrap();
            assert_eq!(fetched.data, data);
            assert_eq!(fetched.size(), 1000);

            let stats = swarm.stats(&leech.id());
            assert_eq!(stats.blks_rcvd as usize, leech.blockstore().len());
            assert_eq!(stats.dup_blks_rcvd, 0);
            assert_eq!(swarm.stats(&seed.id()).blks_sent, stats.blks_rcvd);
        }
    }

    #[tokio::test]
    async fn test_session_counts_duplicates() {
        let swarm = MemorySwarm::new(1);
        let a = DagNode::new(&swarm, &HostKey::from_seed(1), config(ExchangeKind::Session, false));
        let b = DagNode::new(&swarm, &HostKey::from_seed(2), config(ExchangeKind::Session, false));
        let leech = DagNode::new(&swarm, &HostKey::from_seed(3), config(ExchangeKind::Session, false));

        let data = file(300);
        let root = a.add(&data).await.unwrap();
        assert_eq!(b.add(&data).await.unwrap(), root);

        leech.host().connect(&a.host().addr_info()).await.unwrap();
        leech.host().connect(&b.host().addr_info()).await.unwrap();
        leech.fetch(&root, &[]).await.unwrap();

        let stats = swarm.stats(&leech.id());
        assert_eq!(stats.dup_blks_rcvd, stats.blks_rcvd);
        assert_eq!(stats.msgs_rcvd, 2 * stats.blks_rcvd);
    }

    #[tokio::test]
    async fn test_partial_seeds_cover_file() {
        let swarm = MemorySwarm::new(1);
        let fraction = SeedFraction {
            numerator: 1,
            denominator: 2,
        };
        let data = file(64 * 9);

        let mut seeds = Vec::new();
        for index in 0..2u64 {
            let seed = DagNode::new(&swarm, &HostKey::from_seed(10 + index), config(ExchangeKind::Session, false));
            let root = seed.add(&data).await.unwrap();
            let dag = seed.dag_service().unwrap();
            apply_seed_fraction(dag, &root, fraction, index).await.unwrap();
            assert!(seed.blockstore().read_file(&root).is_err());
            seeds.push((seed, root));
        }

        let leech = DagNode::new(&swarm, &HostKey::from_seed(3), config(ExchangeKind::Session, false));
        for (seed, _) in &seeds {
            leech.host().connect(&seed.host().addr_info()).await.unwrap();
        }
        let fetched = leech.fetch(&seeds[0].1, &[]).await.unwrap();
        assert_eq!(fetched.data, data);
    }

    #[tokio::test]
    async fn test_routing_finds_unconnected_holder() {
        let swarm = MemorySwarm::new(1);
        let seed = DagNode::new(&swarm, &HostKey::from_seed(1), config(ExchangeKind::Sequential, true));
        let leech = DagNode::new(&swarm, &HostKey::from_seed(2), config(ExchangeKind::Sequential, true));

        let data = file(500);
        let root = seed.add(&data).await.unwrap();
        assert!(leech.host().connected_peers().is_empty());
        assert_eq!(leech.fetch(&root, &[]).await.unwrap().data, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_time_follows_latency() {
        let swarm = MemorySwarm::new(1);
        let seed = DagNode::new(&swarm, &HostKey::from_seed(1), config(ExchangeKind::Sequential, false));
        let leech = DagNode::new(&swarm, &HostKey::from_seed(2), config(ExchangeKind::Sequential, false));
        swarm
            .shaper(seed.id())
            .configure_network(LinkShape::new(Duration::from_millis(20), 0, 0))
            .await
            .unwrap();

        // one leaf, fetched in one round trip
        let root = seed.add(&file(10)).await.unwrap();
        leech.host().connect(&seed.host().addr_info()).await.unwrap();

        let start = tokio::time::Instant::now();
        leech.fetch(&root, &[]).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(25), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_emit_metrics_and_clear() {
        let swarm = MemorySwarm::new(1);
        let seed = DagNode::new(&swarm, &HostKey::from_seed(1), config(ExchangeKind::Session, false));
        let leech = DagNode::new(&swarm, &HostKey::from_seed(2), config(ExchangeKind::Session, false));
        let root = seed.add(&file(200)).await.unwrap();
        leech.host().connect(&seed.host().addr_info()).await.unwrap();
        leech.fetch(&root, &[]).await.unwrap();

        let sink = MemoryMetricsSink::new();
        leech.emit_metrics(&KeyRecorder(sink.clone())).unwrap();
        let keys: Vec<String> = sink.points().into_iter().map(|p| p.name).collect();
        assert_eq!(
            keys,
            vec!["msgs_rcvd", "data_sent", "data_rcvd", "dup_data_rcvd", "blks_sent", "blks_rcvd", "dup_blks_rcvd"]
        );
        assert!(sink.with_key("data_rcvd")[0].value > 0.0);

        leech.clear_datastore(Some(&root)).await.unwrap();
        assert!(leech.blockstore().is_empty());
    }
}
