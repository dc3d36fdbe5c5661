//! Runs a whole scenario in one process

use std::sync::Arc;

use tb_rust::{
    run_local, CsvMetricsSink, InstanceOutcome, MemoryMetricsSink, MetricsSink, MultiMetricsSink, TestVars,
    TestbedError,
};
use tokio::time::Instant;

use super::config::ScenarioFile;
use super::stats::{counter_totals, permutation_stats, ScenarioResult};

pub struct ScenarioRunner {
    scenario: ScenarioFile,
    vars: Arc<TestVars>,
    seed: u64,
}

impl ScenarioRunner {
    pub fn new(scenario: ScenarioFile) -> Result<Self, TestbedError> {
        let vars = TestVars::from_params(&scenario.params)?;
        let seed = scenario.resolve_seed();
        Ok(Self {
            scenario,
            vars: Arc::new(vars),
            seed,
        })
    }

    pub fn vars(&self) -> &TestVars {
        &self.vars
    }

    pub async fn run(&self) -> Result<ScenarioResult, TestbedError> {
        let memory = MemoryMetricsSink::new();
        let mut sinks = MultiMetricsSink::new();
        sinks.add_sink(Arc::new(memory.clone()));
        if let Some(path) = &self.scenario.csv {
            let csv = CsvMetricsSink::new(path).map_err(|e| TestbedError::Metrics(e.into()))?;
            sinks.add_sink(Arc::new(csv));
            log::info!("Writing metric points to {}", path.display());
        }
        let sink: Arc<dyn MetricsSink> = Arc::new(sinks);

        let start = Instant::now();
        let run = run_local(self.vars.clone(), self.scenario.envs(), sink, self.seed).await?;
        let wall_time = start.elapsed();

        let failures: Vec<(u64, String)> = run
            .sync
            .outcomes()
            .into_iter()
            .filter_map(|(instance, outcome)| match outcome {
                InstanceOutcome::Failure(error) => Some((instance, error)),
                InstanceOutcome::Success => None,
            })
            .collect();

        let reports: Vec<_> = run.reports.iter().filter_map(|r| r.as_ref().ok()).collect();
        let points = memory.points();

        Ok(ScenarioResult {
            seed_used: self.seed,
            instances: self.scenario.instances,
            wall_time,
            succeeded: reports.len(),
            failures,
            permutations: permutation_stats(&self.vars, &reports),
            counters: counter_totals(&points),
            metric_points: points.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_small_scenario_runs() {
        let yaml = r#"
instances: 3
seed: 1
params:
  leech_count: 2
  file_size: 2048
  bandwidth_mb: 0
  latency_ms: 0
  chunk_size: 512
"#;
        let runner = ScenarioRunner::new(ScenarioFile::from_yaml(yaml).unwrap()).unwrap();
        let result = runner.run().await.unwrap();

        assert_eq!(result.succeeded, 3);
        assert!(result.failures.is_empty());
        assert_eq!(result.permutations.len(), 1);
        assert_eq!(result.permutations[0].fetch_times.len(), 2);
        assert_eq!(result.permutations[0].fetch_fails, 0);
        assert!(result.counters.get("blks_rcvd").copied().unwrap_or(0.0) > 0.0);
    }
}
