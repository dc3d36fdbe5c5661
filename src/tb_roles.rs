//! Role Assignment
//!
//! Instances are partitioned into contiguous bands of their sequence number:
//!
//! ```text
//! seq:   1 .. L | L+1 .. L+P | L+P+1 .. N
//! role:  Leech  | Passive    | Seed
//! ```
//!
//! The type index is the zero-based position inside the band. When a group
//! label has its own leech/passive counts, a second sequence number scoped to
//! the group is obtained and banded instead.

use tokio::time::Instant;

use crate::tb_error::{ConfigError, CoordinationError};
use crate::tb_interface::{AddrInfo, NodeType};
use crate::tb_sync::{SyncClient, Topic};

/// Leech and passive counts that apply to one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleCounts {
    pub leech: usize,
    pub passive: usize,
}

impl RoleCounts {
    /// Counts larger than the instance count would silently turn the
    /// remainder into seeds with nobody left to seed
    pub fn validate(&self, instances: usize) -> Result<(), ConfigError> {
        if self.leech + self.passive > instances {
            return Err(ConfigError::RoleCountsExceedInstances {
                leech: self.leech,
                passive: self.passive,
                instances,
            });
        }
        Ok(())
    }

    /// Leeches block on a root that only a seed publishes
    pub fn validate_has_seed(&self, instances: usize) -> Result<(), ConfigError> {
        if self.leech > 0 && self.seeds(instances) == 0 {
            return Err(ConfigError::NoSeeds {
                leech: self.leech,
                instances,
            });
        }
        Ok(())
    }

    pub fn seeds(&self, instances: usize) -> usize {
        instances.saturating_sub(self.leech + self.passive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    /// Global sequence number, 1-based
    pub seq: u64,
    /// Group sequence number, equal to `seq` without group overrides
    pub grpseq: u64,
    pub node_type: NodeType,
    pub tp_index: usize,
    /// Group whose counts were used, if any
    pub group: Option<String>,
    pub counts: RoleCounts,
}

/// Band a 1-based sequence number into a role and type index
pub fn assign_role(grpseq: u64, counts: RoleCounts) -> (NodeType, usize) {
    let seq = grpseq as usize;
    let leech = counts.leech;
    let passive = counts.passive;

    if seq <= leech {
        (NodeType::Leech, seq.saturating_sub(1))
    } else if seq > leech + passive {
        (NodeType::Seed, seq - 1 - (leech + passive))
    } else {
        (NodeType::Passive, seq.saturating_sub(1 + leech))
    }
}

fn node_set_topic(set_id: &str) -> Topic<AddrInfo> {
    Topic::new(format!("nodes{}", set_id))
}

/// Sequence number scoped to a named set of nodes
pub async fn node_set_seq(
    client: &dyn SyncClient,
    addr: &AddrInfo,
    set_id: &str,
) -> Result<u64, CoordinationError> {
    node_set_topic(set_id).publish(client, addr).await
}

/// Resolve this instance's role.
///
/// `group` carries the group label and its overriding counts; the group
/// sequence is only requested from the sync service when it is present.
pub async fn resolve_role(
    client: &dyn SyncClient,
    addr: &AddrInfo,
    seq: u64,
    counts: RoleCounts,
    group: Option<(&str, RoleCounts)>,
) -> Result<RoleAssignment, CoordinationError> {
    let (grpseq, counts, group) = match group {
        Some((group_id, group_counts)) => {
            let grpseq = node_set_seq(client, addr, group_id).await?;
            (grpseq, group_counts, Some(group_id.to_string()))
        }
        None => (seq, counts, None),
    };

    let (node_type, tp_index) = assign_role(grpseq, counts);

    match &group {
        Some(g) => log::info!("I am {} {} {} - seq {} ({} of {})", g, node_type, tp_index, seq, grpseq, g),
        None => log::info!("I am {} {} - seq {}", node_type, tp_index, seq),
    }

    Ok(RoleAssignment {
        seq,
        grpseq,
        node_type,
        tp_index,
        group,
        counts,
    })
}

/// Zero-based index among seeds.
///
/// Without groups it is arithmetic on `seq`; with groups the seeds of all
/// groups publish to a shared `seeds` set to number themselves.
pub async fn resolve_seed_index(
    client: &dyn SyncClient,
    addr: &AddrInfo,
    role: &RoleAssignment,
    deadline: Instant,
) -> Result<Option<u64>, CoordinationError> {
    if role.node_type != NodeType::Seed {
        return Ok(None);
    }

    let index = match role.group {
        None => role.seq - (role.counts.leech + role.counts.passive) as u64 - 1,
        Some(_) => {
            let seed_seq = tokio::time::timeout_at(deadline, node_set_seq(client, addr, "seeds"))
                .await
                .map_err(|_| CoordinationError::Timeout("nodesseeds".to_string()))??;
            seed_seq - 1
        }
    };

    log::info!("Seed index {}", index);
    Ok(Some(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tb_sync_memory::MemorySyncService;
    use hashbrown::HashMap;
    use std::time::Duration;

    fn counts(leech: usize, passive: usize) -> RoleCounts {
        RoleCounts { leech, passive }
    }

    fn addr(n: u8) -> AddrInfo {
        AddrInfo {
            id: [n; 32],
            addrs: vec![],
        }
    }

    #[test]
    fn test_bands() {
        let c = counts(2, 1);
        assert_eq!(assign_role(1, c), (NodeType::Leech, 0));
        assert_eq!(assign_role(2, c), (NodeType::Leech, 1));
        assert_eq!(assign_role(3, c), (NodeType::Passive, 0));
        assert_eq!(assign_role(4, c), (NodeType::Seed, 0));
        assert_eq!(assign_role(5, c), (NodeType::Seed, 1));
    }

    #[test]
    fn test_partition_is_total_and_contiguous() {
        for n in 1..12usize {
            for leech in 0..=n {
                for passive in 0..=(n - leech) {
                    let c = counts(leech, passive);
                    let mut by_type: HashMap<NodeType, Vec<usize>> = HashMap::new();
                    for seq in 1..=n as u64 {
                        let (tp, idx) = assign_role(seq, c);
                        by_type.entry(tp).or_default().push(idx);
                    }

                    let expected = [
                        (NodeType::Leech, leech),
                        (NodeType::Passive, passive),
                        (NodeType::Seed, n - leech - passive),
                    ];
                    for (tp, count) in expected {
                        let mut idx = by_type.remove(&tp).unwrap_or_default();
                        idx.sort();
                        assert_eq!(idx, (0..count).collect::<Vec<_>>(), "{:?} n={} {:?}", tp, n, c);
                    }
                    assert!(by_type.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_no_seed_band_without_leftover() {
        let c = counts(2, 2);
        assert_eq!(assign_role(4, c), (NodeType::Passive, 1));
        assert_eq!(c.seeds(4), 0);
    }

    #[test]
    fn test_counts_exceeding_instances_rejected() {
        assert!(counts(3, 2).validate(5).is_ok());
        let err = counts(3, 3).validate(5).unwrap_err();
        assert!(matches!(err, ConfigError::RoleCountsExceedInstances { instances: 5, .. }));
    }

    #[test]
    fn test_leeches_need_a_seed() {
        assert!(counts(1, 0).validate_has_seed(2).is_ok());
        assert!(counts(0, 2).validate_has_seed(2).is_ok());
        assert!(matches!(
            counts(1, 1).validate_has_seed(2),
            Err(ConfigError::NoSeeds { leech: 1, instances: 2 })
        ));
    }

    #[tokio::test]
    async fn test_resolve_role_ungrouped_uses_seq() {
        let sync = MemorySyncService::new();
        let role = resolve_role(&sync, &addr(1), 3, counts(1, 1), None).await.unwrap();
        assert_eq!(role.node_type, NodeType::Seed);
        assert_eq!(role.tp_index, 0);
        assert_eq!(role.grpseq, 3);
        assert_eq!(sync.topic_len("nodesa"), 0);
    }

    #[tokio::test]
    async fn test_resolve_role_grouped_uses_group_seq() {
        let sync = MemorySyncService::new();
        // another member of group "a" joined first
        node_set_seq(&sync, &addr(9), "a").await.unwrap();

        let role = resolve_role(&sync, &addr(1), 7, counts(5, 0), Some(("a", counts(1, 0))))
            .await
            .unwrap();
        assert_eq!(role.grpseq, 2);
        assert_eq!(role.node_type, NodeType::Seed);
        assert_eq!(role.tp_index, 0);
        assert_eq!(role.group.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_seed_index_arithmetic_and_grouped() {
        let sync = MemorySyncService::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let global = counts(2, 1);

        let role = resolve_role(&sync, &addr(1), 5, global, None).await.unwrap();
        let idx = resolve_seed_index(&sync, &addr(1), &role, deadline)
            .await
            .unwrap();
        assert_eq!(idx, Some(1));

        let leech = resolve_role(&sync, &addr(2), 1, global, None).await.unwrap();
        assert_eq!(
            resolve_seed_index(&sync, &addr(2), &leech, deadline).await.unwrap(),
            None
        );

        let grouped = resolve_role(&sync, &addr(3), 9, global, Some(("g", counts(0, 0))))
            .await
            .unwrap();
        let first = resolve_seed_index(&sync, &addr(3), &grouped, deadline)
            .await
            .unwrap();
        let second = resolve_seed_index(&sync, &addr(4), &grouped, deadline)
            .await
            .unwrap();
        assert_eq!((first, second), (Some(0), Some(1)));
    }
}
