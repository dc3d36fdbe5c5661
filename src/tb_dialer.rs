//! Dialing Strategies
//!
//! Both strategies only dial peers whose host id sorts below our own, so each
//! pair is dialed from exactly one side and simultaneous connects never race.
//! The candidate list is then cut to `ceil(rate% * len)` entries in roster
//! order, and the survivors are dialed concurrently.

use std::fmt;
use std::str::FromStr;

use futures::future::try_join_all;

use crate::tb_error::{ConfigError, NodeError};
use crate::tb_interface::{AddrInfo, Host, HostId, NodeType, PeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialer {
    /// Dial every lower peer
    #[default]
    Full,
    /// Like `Full`, but seeds and leeches never dial each other
    Sparse,
}

impl FromStr for Dialer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" | "full" => Ok(Dialer::Full),
            "sparse" => Ok(Dialer::Sparse),
            other => Err(ConfigError::UnsupportedDialer(other.to_string())),
        }
    }
}

impl fmt::Display for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialer::Full => write!(f, "full"),
            Dialer::Sparse => write!(f, "sparse"),
        }
    }
}

/// Seed and leech are never linked directly under sparse dialing
fn sparse_allows(self_type: NodeType, other: NodeType) -> bool {
    !matches!(
        (self_type, other),
        (NodeType::Seed, NodeType::Leech) | (NodeType::Leech, NodeType::Seed)
    )
}

/// `ceil(rate/100 * len)`, rate clamped to 0..=100
pub fn rate_limit(len: usize, max_connection_rate: u32) -> usize {
    let rate = max_connection_rate.min(100) as usize;
    (len * rate + 99) / 100
}

impl Dialer {
    /// Peers this host should dial, in roster order
    pub fn select(
        &self,
        self_id: &HostId,
        self_type: NodeType,
        roster: &[PeerInfo],
        max_connection_rate: u32,
    ) -> Vec<AddrInfo> {
        let mut to_dial: Vec<AddrInfo> = roster
            .iter()
            // skips ourselves as well
            .filter(|info| info.addr.id < *self_id)
            .filter(|info| match self {
                Dialer::Full => true,
                Dialer::Sparse => sparse_allows(self_type, info.node_type),
            })
            .map(|info| info.addr.clone())
            .collect();

        to_dial.truncate(rate_limit(to_dial.len(), max_connection_rate));
        to_dial
    }

    /// Select and connect. The first failed dial aborts the others.
    pub async fn dial(
        &self,
        host: &dyn Host,
        self_type: NodeType,
        roster: &[PeerInfo],
        max_connection_rate: u32,
    ) -> Result<Vec<AddrInfo>, NodeError> {
        let to_dial = self.select(&host.id(), self_type, roster, max_connection_rate);

        try_join_all(to_dial.iter().map(|addr| async move {
            host.connect(addr).await.map_err(|e| NodeError::Dial {
                peer: format!("{:?}", addr.addrs),
                reason: e.to_string(),
            })
        }))
        .await?;

        Ok(to_dial)
    }
}
