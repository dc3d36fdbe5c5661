//! Host Identity
//!
//! Every test instance derives an X25519 key pair before it joins the swarm.
//! The public key bytes double as the host id:
//! - published in [`AddrInfo`] on the `peers` topic
//! - compared bytewise by the dialers to decide which side of a pair initiates
//!
//! Keys derive from a seed so a simulated swarm is reproducible.

use rand::rngs::StdRng;
use rand::SeedableRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::tb_interface::{AddrInfo, HostId};

pub struct HostKey {
    public_key: PublicKey,
}

impl std::fmt::Debug for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKey")
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .finish()
    }
}

impl HostKey {
    /// Deterministic key pair; only the public half is kept
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let static_secret = StaticSecret::random_from_rng(&mut rng);
        let public_key = PublicKey::from(&static_secret);
        log::debug!("Derived X25519 host identity from seed {}", seed);
        Self { public_key }
    }

    pub fn host_id(&self) -> HostId {
        *self.public_key.as_bytes()
    }

    /// Address info for a host listening on `addrs`
    pub fn addr_info(&self, addrs: Vec<String>) -> AddrInfo {
        AddrInfo {
            id: self.host_id(),
            addrs,
        }
    }
}
