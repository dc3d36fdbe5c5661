//! Fractional Seeding
//!
//! A seed keeps leaf `i` of a DAG iff `(i + seed_index) % denominator < numerator`.
//! Seeds with consecutive indices therefore keep shifted, overlapping windows
//! of roughly `numerator/denominator` of the leaves, and `denominator` seeds
//! with indices `0..denominator` cover every leaf between them.

use crate::tb_error::{ConfigError, NodeError};
use crate::tb_interface::{ContentId, DagService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedFraction {
    pub numerator: u64,
    pub denominator: u64,
}

impl SeedFraction {
    /// Parse `"num/den"`; unset or empty disables partial seeding
    pub fn parse(value: Option<&str>) -> Result<Option<Self>, ConfigError> {
        let value = match value {
            None => return Ok(None),
            Some(v) if v.trim().is_empty() => return Ok(None),
            Some(v) => v.trim(),
        };

        let invalid = || ConfigError::InvalidSeedFraction(value.to_string());

        let parts: Vec<&str> = value.split('/').collect();
        if parts.len() != 2 {
            return Err(invalid());
        }
        let numerator: u64 = parts[0].trim().parse().map_err(|_| invalid())?;
        let denominator: u64 = parts[1].trim().parse().map_err(|_| invalid())?;
        if denominator == 0 {
            return Err(invalid());
        }

        Ok(Some(Self {
            numerator,
            denominator,
        }))
    }

    pub fn retains(&self, leaf_index: usize, seed_index: u64) -> bool {
        (leaf_index as u64 + seed_index) % self.denominator < self.numerator
    }
}

/// Leaves of the DAG under `root`, in depth-first order
pub async fn collect_leaves(dag: &dyn DagService, root: &ContentId) -> Result<Vec<ContentId>, NodeError> {
    let mut leaves = Vec::new();
    let mut stack = vec![*root];

    while let Some(cid) = stack.pop() {
        let links = dag.links(&cid).await?;
        if links.is_empty() {
            leaves.push(cid);
        } else {
            // reversed so the first link is visited first
            stack.extend(links.into_iter().rev());
        }
    }

    Ok(leaves)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FractionOutcome {
    pub leaves: usize,
    pub removed: usize,
}

/// Drop the leaves this seed does not retain from local storage
pub async fn apply_seed_fraction(
    dag: &dyn DagService,
    root: &ContentId,
    fraction: SeedFraction,
    seed_index: u64,
) -> Result<FractionOutcome, NodeError> {
    let leaves = collect_leaves(dag, root).await?;

    let remove: Vec<ContentId> = leaves
        .iter()
        .enumerate()
        .filter(|(i, _)| !fraction.retains(*i, seed_index))
        .map(|(_, cid)| *cid)
        .collect();

    dag.remove_many(&remove).await?;

    log::info!(
        "Retained {} / {} of blocks from seed, removed {} / {} blocks",
        fraction.numerator,
        fraction.denominator,
        remove.len(),
        leaves.len()
    );

    Ok(FractionOutcome {
        leaves: leaves.len(),
        removed: remove.len(),
    })
}
