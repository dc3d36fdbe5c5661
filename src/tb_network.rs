//! Network Shaping
//!
//! Each permutation shapes this instance's link before its `start-file`
//! barrier. Seeds and leeches can carry extra latency on top of the
//! permutation's base latency (`seed_latency_ms`, `leech_latency_ms`).

use std::time::Duration;

use async_trait::async_trait;

use crate::tb_error::{ConfigError, NodeError};
use crate::tb_interface::NodeType;
use crate::tb_params::parse_int_list;

/// Extra latency for one node type
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypeLatency {
    #[default]
    Unset,
    /// Same extra latency for every instance of the type
    Uniform(u64),
    /// Extra latency per type index
    PerIndex(Vec<u64>),
}

impl TypeLatency {
    pub fn parse(value: Option<&str>) -> Result<Self, ConfigError> {
        let value = match value {
            None => return Ok(TypeLatency::Unset),
            Some(v) if v.trim().is_empty() => return Ok(TypeLatency::Unset),
            Some(v) => v.trim(),
        };

        if value.contains(',') {
            Ok(TypeLatency::PerIndex(parse_int_list(value)?))
        } else {
            let ms = value
                .parse()
                .map_err(|_| ConfigError::InvalidIntList(value.to_string()))?;
            Ok(TypeLatency::Uniform(ms))
        }
    }

    /// Latency for the instance at `tp_index`. Indexes past the end of a
    /// list get the base latency.
    pub fn resolve(&self, tp_index: usize, base: Duration) -> Duration {
        match self {
            TypeLatency::Unset => base,
            TypeLatency::Uniform(ms) => base + Duration::from_millis(*ms),
            TypeLatency::PerIndex(list) => match list.get(tp_index) {
                Some(ms) => base + Duration::from_millis(*ms),
                None => base,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyOverrides {
    pub seed: TypeLatency,
    pub leech: TypeLatency,
}

impl LatencyOverrides {
    pub fn latency(&self, node_type: NodeType, tp_index: usize, base: Duration) -> Duration {
        match node_type {
            NodeType::Seed => self.seed.resolve(tp_index, base),
            NodeType::Leech => self.leech.resolve(tp_index, base),
            NodeType::Passive => base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkShape {
    pub latency: Duration,
    /// Bytes per second, 0 means unlimited
    pub bandwidth: u64,
    pub jitter: Duration,
}

impl LinkShape {
    pub fn new(latency: Duration, bandwidth_mb: u64, jitter_pct: u64) -> Self {
        Self {
            latency,
            bandwidth: bandwidth_mb * 1024 * 1024,
            jitter: latency * jitter_pct as u32 / 100,
        }
    }

    pub fn unshaped() -> Self {
        Self {
            latency: Duration::ZERO,
            bandwidth: 0,
            jitter: Duration::ZERO,
        }
    }
}

/// Applies a link shape to this instance's traffic
#[async_trait]
pub trait NetworkShaper: Send + Sync {
    async fn configure_network(&self, shape: LinkShape) -> Result<(), NodeError>;
}

/// Shaper for environments without traffic control
pub struct NoopShaper;

#[async_trait]
impl NetworkShaper for NoopShaper {
    async fn configure_network(&self, _shape: LinkShape) -> Result<(), NodeError> {
        Ok(())
    }
}

pub async fn setup_network(
    shaper: &dyn NetworkShaper,
    overrides: &LatencyOverrides,
    node_type: NodeType,
    tp_index: usize,
    base_latency: Duration,
    bandwidth_mb: u64,
    jitter_pct: u64,
) -> Result<LinkShape, NodeError> {
    let latency = overrides.latency(node_type, tp_index, base_latency);
    let shape = LinkShape::new(latency, bandwidth_mb, jitter_pct);

    log::info!(
        "{} {} has {:?} latency ({}% jitter) and {}MB bandwidth",
        node_type,
        tp_index,
        latency,
        jitter_pct,
        bandwidth_mb
    );

    shaper.configure_network(shape).await?;
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const BASE: Duration = Duration::from_millis(100);

    #[test]
    fn test_uniform_latency_adds_to_base() {
        let tl = TypeLatency::parse(Some("50")).unwrap();
        assert_eq!(tl, TypeLatency::Uniform(50));
        assert_eq!(tl.resolve(0, BASE), Duration::from_millis(150));
        assert_eq!(tl.resolve(17, BASE), Duration::from_millis(150));
    }

    #[test]
    fn test_per_index_latency_falls_back_to_base() {
        let tl = TypeLatency::parse(Some("10,20,40")).unwrap();
        assert_eq!(tl.resolve(0, BASE), Duration::from_millis(110));
        assert_eq!(tl.resolve(2, BASE), Duration::from_millis(140));
        // past the end of the list
        assert_eq!(tl.resolve(3, BASE), BASE);
        assert_eq!(tl.resolve(100, BASE), BASE);
    }

    #[test]
    fn test_unset_and_malformed() {
        assert_eq!(TypeLatency::parse(None).unwrap(), TypeLatency::Unset);
        assert_eq!(TypeLatency::parse(Some("")).unwrap().resolve(5, BASE), BASE);
        assert!(TypeLatency::parse(Some("fast")).is_err());
        assert!(TypeLatency::parse(Some("1,x")).is_err());
    }

    #[test]
    fn test_passive_ignores_overrides() {
        let overrides = LatencyOverrides {
            seed: TypeLatency::Uniform(5),
            leech: TypeLatency::Uniform(7),
        };
        assert_eq!(overrides.latency(NodeType::Passive, 0, BASE), BASE);
        assert_eq!(overrides.latency(NodeType::Seed, 0, BASE), Duration::from_millis(105));
        assert_eq!(overrides.latency(NodeType::Leech, 0, BASE), Duration::from_millis(107));
    }

    #[test]
    fn test_link_shape_units() {
        let shape = LinkShape::new(Duration::from_millis(200), 2, 10);
        assert_eq!(shape.bandwidth, 2 * 1024 * 1024);
        assert_eq!(shape.jitter, Duration::from_millis(20));
    }

    struct RecordingShaper(Mutex<Vec<LinkShape>>);

    #[async_trait]
    impl NetworkShaper for RecordingShaper {
        async fn configure_network(&self, shape: LinkShape) -> Result<(), NodeError> {
            self.0.lock().unwrap().push(shape);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_setup_network_applies_type_latency() {
        let shaper = RecordingShaper(Mutex::new(Vec::new()));
        let overrides = LatencyOverrides {
            seed: TypeLatency::PerIndex(vec![30]),
            leech: TypeLatency::Unset,
        };

        let shape = setup_network(&shaper, &overrides, NodeType::Seed, 0, BASE, 1, 50)
            .await
            .unwrap();
        assert_eq!(shape.latency, Duration::from_millis(130));
        assert_eq!(shape.jitter, Duration::from_millis(65));
        assert_eq!(shaper.0.lock().unwrap().as_slice(), &[shape]);
    }
}
