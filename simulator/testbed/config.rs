//! Scenario file format for the in-process testbed

use std::path::PathBuf;

use tb_rust::{InstanceEnv, TestParams};

/// One scenario: the swarm size, the test parameters, and optional groups
#[derive(Debug, serde::Deserialize)]
pub struct ScenarioFile {
    #[serde(default)]
    pub meta: ScenarioMeta,

    /// Number of instances in the swarm
    pub instances: usize,

    /// Seed for host identities and link jitter (None = random)
    #[serde(default)]
    pub seed: Option<u64>,

    /// Groups take consecutive launch indexes; the rest stay ungrouped
    #[serde(default)]
    pub groups: Vec<GroupSpec>,

    /// Optional CSV file receiving every metric point
    #[serde(default)]
    pub csv: Option<PathBuf>,

    #[serde(default)]
    pub params: TestParams,
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct ScenarioMeta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub hypothesis: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GroupSpec {
    pub id: String,
    pub instances: usize,
}

impl ScenarioFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Runtime environment of every instance, in launch order
    pub fn envs(&self) -> Vec<InstanceEnv> {
        let mut groups = self
            .groups
            .iter()
            .flat_map(|g| std::iter::repeat(g).take(g.instances));

        (0..self.instances as u64)
            .map(|i| {
                let env = InstanceEnv::new(i, self.instances);
                match groups.next() {
                    Some(group) => env.with_group(group.id.as_str(), group.instances),
                    None => env,
                }
            })
            .collect()
    }

    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}
