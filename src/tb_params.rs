//! Test Parameters
//!
//! [`TestParams`] is the raw parameter set as it appears in a scenario file.
//! [`TestVars::from_params`] validates it into typed values and expands the
//! permutation cross product. Every configuration error surfaces here,
//! before the instance reaches its first barrier.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::tb_backend::{BackendKind, ExchangeKind};
use crate::tb_dialer::Dialer;
use crate::tb_error::ConfigError;
use crate::tb_files::{file_list, TestFile};
use crate::tb_fraction::SeedFraction;
use crate::tb_network::{LatencyOverrides, TypeLatency};
use crate::tb_roles::RoleCounts;

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Parse a comma-separated list of unsigned integers; one bad entry fails the list
pub fn parse_int_list(value: &str) -> Result<Vec<u64>, ConfigError> {
    value
        .split(',')
        .map(|s| s.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::InvalidIntList(value.to_string()))
}

// Integer list parameters may be written as `1024`, `"1024,2048"` or `[1024, 2048]`
fn int_list_param<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
        List(Vec<u64>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Int(n) => n.to_string(),
        Raw::Text(s) => s,
        Raw::List(v) => v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(","),
    })
}

fn opt_int_list_param<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    int_list_param(deserializer).map(Some)
}

/// Per-group leech/passive overrides, keyed by group id
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GroupCounts {
    pub leech_count: Option<usize>,
    pub passive_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestParams {
    pub leech_count: usize,
    pub passive_count: usize,
    pub run_count: usize,
    pub run_timeout_secs: u64,
    pub timeout_secs: u64,
    /// Milliseconds between consecutive leech starts within a wave
    pub request_stagger: u64,
    pub max_connection_rate: u32,
    /// Percentage of seeds that actually ingest the file
    pub seeder_rate: u32,
    pub enable_tcp: bool,
    pub enable_dht: bool,
    pub long_lasting: bool,
    pub dialer: String,
    pub number_waves: usize,
    pub seed_fraction: Option<String>,
    pub exchange_interface: String,
    pub node_type: String,
    pub input_data: String,
    #[serde(deserialize_with = "int_list_param")]
    pub file_size: String,
    pub data_dir: PathBuf,
    #[serde(deserialize_with = "int_list_param")]
    pub bandwidth_mb: String,
    #[serde(deserialize_with = "int_list_param")]
    pub latency_ms: String,
    #[serde(deserialize_with = "int_list_param")]
    pub jitter_pct: String,
    #[serde(deserialize_with = "opt_int_list_param")]
    pub seed_latency_ms: Option<String>,
    #[serde(deserialize_with = "opt_int_list_param")]
    pub leech_latency_ms: Option<String>,
    pub group_overrides: BTreeMap<String, GroupCounts>,
    pub wave_settle_ms: u64,
    pub keepalive_secs: u64,
    pub scratch_dir: Option<PathBuf>,
    pub chunk_size: usize,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            leech_count: 1,
            passive_count: 0,
            run_count: 1,
            run_timeout_secs: 90,
            timeout_secs: 300,
            request_stagger: 0,
            max_connection_rate: 100,
            seeder_rate: 100,
            enable_tcp: false,
            enable_dht: false,
            long_lasting: false,
            dialer: "default".to_string(),
            number_waves: 1,
            seed_fraction: None,
            exchange_interface: "session".to_string(),
            node_type: "dag".to_string(),
            input_data: "random".to_string(),
            file_size: "1048576".to_string(),
            data_dir: PathBuf::new(),
            bandwidth_mb: "150".to_string(),
            latency_ms: "10".to_string(),
            jitter_pct: "0".to_string(),
            seed_latency_ms: None,
            leech_latency_ms: None,
            group_overrides: BTreeMap::new(),
            wave_settle_ms: 5000,
            keepalive_secs: 15,
            scratch_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl TestParams {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// One combination of file, bandwidth, latency and jitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPermutation {
    pub file: TestFile,
    pub bandwidth_mb: u64,
    pub latency: Duration,
    pub jitter_pct: u64,
}

/// Validated parameters
#[derive(Debug, Clone)]
pub struct TestVars {
    pub exchange: ExchangeKind,
    pub backend: BackendKind,
    pub timeout: Duration,
    pub run_timeout: Duration,
    pub counts: RoleCounts,
    pub request_stagger: Duration,
    pub run_count: usize,
    pub max_connection_rate: u32,
    pub tcp_enabled: bool,
    pub seeder_rate: u32,
    pub dht_enabled: bool,
    pub long_lasting: bool,
    pub dialer: Dialer,
    pub num_waves: usize,
    pub seed_fraction: Option<SeedFraction>,
    pub latency_overrides: LatencyOverrides,
    pub group_overrides: BTreeMap<String, GroupCounts>,
    pub wave_settle: Duration,
    pub keepalive: Duration,
    pub scratch_dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub permutations: Vec<TestPermutation>,
}

impl TestVars {
    pub fn from_params(params: &TestParams) -> Result<Self, ConfigError> {
        let exchange: ExchangeKind = params.exchange_interface.parse()?;
        let backend: BackendKind = params.node_type.parse()?;
        let dialer: Dialer = params.dialer.parse()?;
        let seed_fraction = SeedFraction::parse(params.seed_fraction.as_deref())?;

        if seed_fraction.is_some() && backend == BackendKind::Stream {
            return Err(ConfigError::UnsupportedTopology {
                backend: "stream",
                reason: "has no block tree to split into seed fractions",
            });
        }

        if params.number_waves == 0 {
            return Err(ConfigError::ZeroWaves);
        }
        if params.seeder_rate == 0 {
            return Err(ConfigError::ZeroSeederRate);
        }

        let latency_overrides = LatencyOverrides {
            seed: TypeLatency::parse(params.seed_latency_ms.as_deref())?,
            leech: TypeLatency::parse(params.leech_latency_ms.as_deref())?,
        };

        let bandwidths = parse_int_list(&params.bandwidth_mb)?;
        let latencies = parse_int_list(&params.latency_ms)?;
        let jitters = parse_int_list(&params.jitter_pct)?;
        let file_sizes = if params.input_data == "random" {
            parse_int_list(&params.file_size)?
        } else {
            Vec::new()
        };
        let files = file_list(&params.input_data, &file_sizes, Path::new(&params.data_dir))?;
        log::info!("Got file list: {:?}", files);

        let permutations = permutations(&files, &bandwidths, &latencies, &jitters);
        if permutations.is_empty() {
            return Err(ConfigError::NoPermutations);
        }

        Ok(Self {
            exchange,
            backend,
            timeout: Duration::from_secs(params.timeout_secs),
            run_timeout: Duration::from_secs(params.run_timeout_secs),
            counts: RoleCounts {
                leech: params.leech_count,
                passive: params.passive_count,
            },
            request_stagger: Duration::from_millis(params.request_stagger),
            run_count: params.run_count,
            max_connection_rate: params.max_connection_rate,
            tcp_enabled: params.enable_tcp,
            seeder_rate: params.seeder_rate,
            dht_enabled: params.enable_dht,
            long_lasting: params.long_lasting,
            dialer,
            num_waves: params.number_waves,
            seed_fraction,
            latency_overrides,
            group_overrides: params.group_overrides.clone(),
            wave_settle: Duration::from_millis(params.wave_settle_ms),
            keepalive: Duration::from_secs(params.keepalive_secs),
            scratch_dir: params.scratch_dir.clone(),
            chunk_size: params.chunk_size.max(1),
            permutations,
        })
    }

    /// Counts for a group that overrides at least one of them
    pub fn group_counts(&self, group_id: &str) -> Option<RoleCounts> {
        let overrides = self.group_overrides.get(group_id)?;
        if overrides.leech_count.is_none() && overrides.passive_count.is_none() {
            return None;
        }
        Some(RoleCounts {
            leech: overrides.leech_count.unwrap_or(self.counts.leech),
            passive: overrides.passive_count.unwrap_or(self.counts.passive),
        })
    }
}

fn permutations(files: &[TestFile], bandwidths: &[u64], latencies: &[u64], jitters: &[u64]) -> Vec<TestPermutation> {
    let mut out = Vec::new();
    for file in files {
        for bandwidth in bandwidths {
            for latency in latencies {
                for jitter in jitters {
                    out.push(TestPermutation {
                        file: file.clone(),
                        bandwidth_mb: *bandwidth,
                        latency: Duration::from_millis(*latency),
                        jitter_pct: *jitter,
                    });
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_list() {
        assert_eq!(parse_int_list("1,2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_int_list("42").unwrap(), vec![42]);
        assert!(matches!(parse_int_list("1,,3"), Err(ConfigError::InvalidIntList(_))));
        assert!(parse_int_list("1,-2").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let vars = TestVars::from_params(&TestParams::default()).unwrap();
        assert_eq!(vars.permutations.len(), 1);
        assert_eq!(vars.dialer, Dialer::Full);
        assert_eq!(vars.num_waves, 1);
        assert_eq!(vars.wave_settle, Duration::from_secs(5));
        assert!(vars.seed_fraction.is_none());
    }

    #[test]
    fn test_permutation_order() {
        let params = TestParams {
            file_size: "10,20".into(),
            bandwidth_mb: "1,2".into(),
            latency_ms: "5".into(),
            jitter_pct: "0,10".into(),
            ..TestParams::default()
        };
        let vars = TestVars::from_params(&params).unwrap();
        assert_eq!(vars.permutations.len(), 8);

        let first = &vars.permutations[0];
        assert_eq!((first.file.size(), first.bandwidth_mb, first.jitter_pct), (10, 1, 0));
        let second = &vars.permutations[1];
        assert_eq!((second.file.size(), second.bandwidth_mb, second.jitter_pct), (10, 1, 10));
        let fifth = &vars.permutations[4];
        assert_eq!((fifth.file.size(), fifth.bandwidth_mb), (20, 1));
    }

    #[test]
    fn test_config_errors() {
        let bad = |f: fn(&mut TestParams)| {
            let mut params = TestParams::default();
            f(&mut params);
            TestVars::from_params(&params).unwrap_err()
        };

        assert!(matches!(bad(|p| p.dialer = "ring".into()), ConfigError::UnsupportedDialer(_)));
        assert!(matches!(
            bad(|p| p.exchange_interface = "bitswap".into()),
            ConfigError::UnsupportedExchange(_)
        ));
        assert!(matches!(bad(|p| p.node_type = "ipfs".into()), ConfigError::UnsupportedBackend(_)));
        assert!(matches!(
            bad(|p| p.seed_fraction = Some("1-2".into())),
            ConfigError::InvalidSeedFraction(_)
        ));
        assert!(matches!(bad(|p| p.number_waves = 0), ConfigError::ZeroWaves));
        assert!(matches!(bad(|p| p.seeder_rate = 0), ConfigError::ZeroSeederRate));
        assert!(matches!(
            bad(|p| {
                p.node_type = "stream".into();
                p.seed_fraction = Some("1/2".into());
            }),
            ConfigError::UnsupportedTopology { backend: "stream", .. }
        ));
        assert!(matches!(bad(|p| p.latency_ms = "ten".into()), ConfigError::InvalidIntList(_)));
        assert!(matches!(
            bad(|p| p.input_data = "custom".into()),
            ConfigError::UnsupportedInputData(_)
        ));
    }

    #[test]
    fn test_yaml_accepts_numbers_and_lists() {
        let params = TestParams::from_yaml(
            r#"
leech_count: 3
file_size: 4096
latency_ms: [10, 20]
seed_latency_ms: "5,10"
dialer: sparse
group_overrides:
  east:
    leech_count: 1
"#,
        )
        .unwrap();
        assert_eq!(params.leech_count, 3);
        assert_eq!(params.file_size, "4096");
        assert_eq!(params.latency_ms, "10,20");
        assert_eq!(params.run_count, 1);

        let vars = TestVars::from_params(&params).unwrap();
        assert_eq!(vars.dialer, Dialer::Sparse);
        assert_eq!(vars.latency_overrides.seed, TypeLatency::PerIndex(vec![5, 10]));
        assert_eq!(
            vars.group_counts("east"),
            Some(RoleCounts {
                leech: 1,
                passive: 0
            })
        );
        assert_eq!(vars.group_counts("west"), None);
    }
}
