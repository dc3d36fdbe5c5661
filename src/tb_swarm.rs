//! In-memory Swarm
//!
//! Hosts of an in-process swarm share a [`MemorySwarm`] registry that tracks
//! who is connected to whom, the link shape each instance configured, and
//! per-host exchange counters. Block transfers are served straight out of
//! the provider's blockstore and delayed according to both ends' shapes:
//!
//! ```text
//! delay = latency(req) + jitter(req) + latency(prov) + jitter(prov) + size / bandwidth
//! ```
//!
//! where bandwidth is the slower of the two shaped links.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tb_blockstore::MemoryBlockstore;
use crate::tb_error::NodeError;
use crate::tb_identity::HostKey;
use crate::tb_interface::{short_id, AddrInfo, ContentId, Host, HostId, MetricsRecorder};
use crate::tb_network::{LinkShape, NetworkShaper};

/// Counters a host accumulates while exchanging blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub msgs_rcvd: u64,
    pub data_sent: u64,
    pub data_rcvd: u64,
    pub dup_data_rcvd: u64,
    pub blks_sent: u64,
    pub blks_rcvd: u64,
    pub dup_blks_rcvd: u64,
}

impl ExchangeStats {
    pub fn emit(&self, recorder: &dyn MetricsRecorder) {
        recorder.record("msgs_rcvd", self.msgs_rcvd as f64);
        recorder.record("data_sent", self.data_sent as f64);
        recorder.record("data_rcvd", self.data_rcvd as f64);
        recorder.record("dup_data_rcvd", self.dup_data_rcvd as f64);
        recorder.record("blks_sent", self.blks_sent as f64);
        recorder.record("blks_rcvd", self.blks_rcvd as f64);
        recorder.record("dup_blks_rcvd", self.dup_blks_rcvd as f64);
    }
}

struct SwarmPeer {
    addrs: Vec<String>,
    blockstore: MemoryBlockstore,
    connections: BTreeSet<HostId>,
    shape: LinkShape,
    stats: ExchangeStats,
}

struct SwarmState {
    peers: HashMap<HostId, SwarmPeer>,
    rng: StdRng,
}

impl SwarmState {
    fn peer(&self, id: &HostId) -> Result<&SwarmPeer, NodeError> {
        self.peers
            .get(id)
            .ok_or_else(|| NodeError::Unreachable(short_id(id)))
    }

    fn peer_mut(&mut self, id: &HostId) -> Result<&mut SwarmPeer, NodeError> {
        self.peers
            .get_mut(id)
            .ok_or_else(|| NodeError::Unreachable(short_id(id)))
    }

    fn jitter(&mut self, max: Duration) -> Duration {
        if max.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.gen_range(0..=max.as_nanos() as u64))
    }
}

/// A block handed out by a provider, to be delivered after `delay`
#[derive(Debug, Clone)]
pub struct Served {
    pub provider: HostId,
    pub bytes: Arc<Vec<u8>>,
    pub delay: Duration,
}

#[derive(Clone)]
pub struct MemorySwarm {
    inner: Arc<Mutex<SwarmState>>,
}

impl MemorySwarm {
    /// `seed` drives jitter sampling
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SwarmState {
                peers: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SwarmState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a host whose blocks are served from `blockstore`
    pub fn join(&self, key: &HostKey, blockstore: MemoryBlockstore) -> MemoryHost {
        let id = key.host_id();
        let addrs = vec![format!("/memory/{}", hex::encode(id))];
        self.lock().peers.insert(
            id,
            SwarmPeer {
                addrs: addrs.clone(),
                blockstore,
                connections: BTreeSet::new(),
                shape: LinkShape::unshaped(),
                stats: ExchangeStats::default(),
            },
        );
        MemoryHost {
            id,
            addrs,
            swarm: self.clone(),
        }
    }

    pub fn shaper(&self, id: HostId) -> SwarmShaper {
        SwarmShaper {
            id,
            swarm: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn connect(&self, from: &HostId, to: &AddrInfo) -> Result<(), NodeError> {
        let mut st = self.lock();
        let target = st.peer_mut(&to.id)?;
        if !to.addrs.is_empty() && !to.addrs.iter().any(|a| target.addrs.contains(a)) {
            return Err(NodeError::Unreachable(format!("{:?}", to.addrs)));
        }
        target.connections.insert(*from);
        st.peer_mut(from)?.connections.insert(to.id);
        Ok(())
    }

    fn disconnect_all(&self, id: &HostId) -> Result<(), NodeError> {
        let mut st = self.lock();
        let peers: Vec<HostId> = std::mem::take(&mut st.peer_mut(id)?.connections)
            .into_iter()
            .collect();
        for peer in peers {
            if let Some(p) = st.peers.get_mut(&peer) {
                p.connections.remove(id);
            }
        }
        Ok(())
    }

    pub fn connected(&self, id: &HostId) -> Vec<HostId> {
        self.lock()
            .peers
            .get(id)
            .map(|p| p.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every host other than `except` holding `cid`, sorted by id
    pub fn holders(&self, cid: &ContentId, except: &HostId) -> Vec<HostId> {
        let st = self.lock();
        let mut holders: Vec<HostId> = st
            .peers
            .iter()
            .filter(|(id, p)| *id != except && p.blockstore.has(cid))
            .map(|(id, _)| *id)
            .collect();
        holders.sort();
        holders
    }

    /// Ask `provider` for `cid` on behalf of `requester`.
    ///
    /// Counts the send on the provider side and a received message on the
    /// requester side. `None` if the provider does not hold the block.
    pub fn serve(&self, provider: &HostId, requester: &HostId, cid: &ContentId) -> Result<Option<Served>, NodeError> {
        let mut st = self.lock();
        let req_shape = st.peer(requester)?.shape;
        let prov = st.peer(provider)?;
        let prov_shape = prov.shape;
        let Some(bytes) = prov.blockstore.get(cid) else {
            return Ok(None);
        };

        let bandwidth = match (req_shape.bandwidth, prov_shape.bandwidth) {
            (0, b) | (b, 0) => b,
            (a, b) => a.min(b),
        };
        let transmit = if bandwidth == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((bytes.len() as u128 * 1_000_000_000 / bandwidth as u128) as u64)
        };
        let delay = req_shape.latency
            + st.jitter(req_shape.jitter)
            + prov_shape.latency
            + st.jitter(prov_shape.jitter)
            + transmit;

        let prov = st.peer_mut(provider)?;
        prov.stats.blks_sent += 1;
        prov.stats.data_sent += bytes.len() as u64;
        st.peer_mut(requester)?.stats.msgs_rcvd += 1;

        Ok(Some(Served {
            provider: *provider,
            bytes,
            delay,
        }))
    }

    /// Account a block arriving at `id`
    pub fn record_received(&self, id: &HostId, len: usize, duplicate: bool) {
        if let Some(peer) = self.lock().peers.get_mut(id) {
            if duplicate {
                peer.stats.dup_blks_rcvd += 1;
                peer.stats.dup_data_rcvd += len as u64;
            } else {
                peer.stats.blks_rcvd += 1;
                peer.stats.data_rcvd += len as u64;
            }
        }
    }

    pub fn stats(&self, id: &HostId) -> ExchangeStats {
        self.lock()
            .peers
            .get(id)
            .map(|p| p.stats)
            .unwrap_or_default()
    }

    pub fn shape(&self, id: &HostId) -> Option<LinkShape> {
        self.lock().peers.get(id).map(|p| p.shape)
    }
}

// ============================================================================
// Host
// ============================================================================

pub struct MemoryHost {
    id: HostId,
    addrs: Vec<String>,
    swarm: MemorySwarm,
}

impl MemoryHost {
    pub fn swarm(&self) -> &MemorySwarm {
        &self.swarm
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn id(&self) -> HostId {
        self.id
    }

    fn addr_info(&self) -> AddrInfo {
        AddrInfo {
            id: self.id,
            addrs: self.addrs.clone(),
        }
    }

    async fn connect(&self, peer: &AddrInfo) -> Result<(), NodeError> {
        self.swarm.connect(&self.id, peer)?;
        log::debug!("{} connected to {}", short_id(&self.id), short_id(&peer.id));
        Ok(())
    }

    fn connected_peers(&self) -> Vec<HostId> {
        self.swarm.connected(&self.id)
    }

    async fn close_connections(&self) -> Result<(), NodeError> {
        self.swarm.disconnect_all(&self.id)
    }
}

/// Applies link shapes to one host of the swarm
pub struct SwarmShaper {
    id: HostId,
    swarm: MemorySwarm,
}

#[async_trait]
impl NetworkShaper for SwarmShaper {
    async fn configure_network(&self, shape: LinkShape) -> Result<(), NodeError> {
        self.swarm.lock().peer_mut(&self.id)?.shape = shape;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tb_blockstore::build_dag;

    fn host(swarm: &MemorySwarm, seed: u64) -> (MemoryHost, MemoryBlockstore) {
        let store = MemoryBlockstore::new();
        let host = swarm.join(&HostKey::from_seed(seed), store.clone());
        (host, store)
    }

    #[tokio::test]
    async fn test_connections_are_symmetric() {
        let swarm = MemorySwarm::new(0);
        let (a, _) = host(&swarm, 1);
        let (b, _) = host(&swarm, 2);
        let (c, _) = host(&swarm, 3);

        a.connect(&b.addr_info()).await.unwrap();
        c.connect(&a.addr_info()).await.unwrap();
        assert_eq!(b.connected_peers(), vec![a.id()]);
        assert_eq!(a.connected_peers().len(), 2);

        a.close_connections().await.unwrap();
        assert!(a.connected_peers().is_empty());
        assert!(b.connected_peers().is_empty());
        assert!(c.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_peer_unreachable() {
        let swarm = MemorySwarm::new(0);
        let (a, _) = host(&swarm, 1);
        let stranger = HostKey::from_seed(99).addr_info(vec![]);
        assert!(matches!(
            a.connect(&stranger).await,
            Err(NodeError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_accounts_and_delays() {
        let swarm = MemorySwarm::new(0);
        let (seed, seed_store) = host(&swarm, 1);
        let (leech, _) = host(&swarm, 2);

        let dag = build_dag(&vec![7u8; 1023], 2048, 4);
        seed_store.put_all(dag.blocks);

        swarm
            .shaper(seed.id())
            .configure_network(LinkShape::new(Duration::from_millis(10), 1, 0))
            .await
            .unwrap();
        swarm
            .shaper(leech.id())
            .configure_network(LinkShape::new(Duration::from_millis(5), 0, 0))
            .await
            .unwrap();

        let served = swarm.serve(&seed.id(), &leech.id(), &dag.root).unwrap().unwrap();
        // 1024 encoded bytes at 1 MiB/s
        let transmit = Duration::from_nanos(1024 * 1_000_000_000 / (1024 * 1024));
        assert_eq!(served.delay, Duration::from_millis(15) + transmit);

        assert_eq!(swarm.stats(&seed.id()).blks_sent, 1);
        assert_eq!(swarm.stats(&seed.id()).data_sent, 1024);
        assert_eq!(swarm.stats(&leech.id()).msgs_rcvd, 1);

        assert!(swarm.serve(&leech.id(), &seed.id(), &dag.root).unwrap().is_none());
        assert_eq!(swarm.holders(&dag.root, &leech.id()), vec![seed.id()]);
        assert!(swarm.holders(&dag.root, &seed.id()).is_empty());
    }

    #[test]
    fn test_received_accounting() {
        let swarm = MemorySwarm::new(0);
        let (a, _) = host(&swarm, 1);
        swarm.record_received(&a.id(), 100, false);
        swarm.record_received(&a.id(), 100, true);
        let stats = swarm.stats(&a.id());
        assert_eq!((stats.blks_rcvd, stats.data_rcvd), (1, 100));
        assert_eq!((stats.dup_blks_rcvd, stats.dup_data_rcvd), (1, 100));
    }
}
