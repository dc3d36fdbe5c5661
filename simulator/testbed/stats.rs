//! Results of an in-process testbed scenario

use std::collections::BTreeMap;
use std::time::Duration;

use tb_rust::{InstanceReport, MetricPoint, NodeType, TestVars};

/// Exchange counters summed in the summary, in print order
const COUNTERS: [&str; 7] = [
    "msgs_rcvd",
    "data_sent",
    "data_rcvd",
    "dup_data_rcvd",
    "blks_sent",
    "blks_rcvd",
    "dup_blks_rcvd",
];

#[derive(Debug)]
pub struct ScenarioResult {
    pub seed_used: u64,
    pub instances: usize,
    pub wall_time: Duration,
    pub succeeded: usize,
    /// Launch index and error text of every failed instance
    pub failures: Vec<(u64, String)>,
    pub permutations: Vec<PermutationStats>,
    /// Final value of each exchange counter, summed over instances
    pub counters: BTreeMap<&'static str, f64>,
    pub metric_points: usize,
}

#[derive(Debug, Default)]
pub struct PermutationStats {
    pub label: String,
    pub fetch_times: Vec<Duration>,
    pub fetch_fails: u64,
    pub tcp_times: Vec<Duration>,
}

impl PermutationStats {
    fn fetch_range(&self) -> Option<(Duration, Duration, Duration)> {
        let min = *self.fetch_times.iter().min()?;
        let max = *self.fetch_times.iter().max()?;
        let avg = self.fetch_times.iter().sum::<Duration>() / self.fetch_times.len() as u32;
        Some((min, max, avg))
    }
}

/// Fold instance reports into per-permutation stats
pub fn permutation_stats(vars: &TestVars, reports: &[&InstanceReport]) -> Vec<PermutationStats> {
    let mut stats: Vec<PermutationStats> = vars
        .permutations
        .iter()
        .map(|p| PermutationStats {
            label: format!(
                "{} bytes, {}MB, {}ms, {}% jitter",
                p.file.size(),
                p.bandwidth_mb,
                p.latency.as_millis(),
                p.jitter_pct
            ),
            ..PermutationStats::default()
        })
        .collect();

    for report in reports.iter().filter(|r| r.node_type == NodeType::Leech) {
        for run in &report.runs {
            let Some(perm) = stats.get_mut(run.permutation) else {
                continue;
            };
            perm.fetch_times.extend(run.time_to_fetch);
            if run.run == 1 {
                perm.tcp_times.extend(run.tcp_fetch);
            }
        }
        // the failure counter is cumulative within a permutation
        for (index, perm) in stats.iter_mut().enumerate() {
            if let Some(last) = report.runs.iter().filter(|r| r.permutation == index).last() {
                perm.fetch_fails += last.leech_fails;
            }
        }
    }
    stats
}

/// Sum the last value each instance recorded for every exchange counter
pub fn counter_totals(points: &[MetricPoint]) -> BTreeMap<&'static str, f64> {
    let mut last: BTreeMap<(&'static str, String), f64> = BTreeMap::new();
    for point in points {
        if let Some(counter) = COUNTERS.iter().find(|c| **c == point.key()) {
            let seq = point.field("seq").unwrap_or_default().to_string();
            last.insert((*counter, seq), point.value);
        }
    }

    let mut totals = BTreeMap::new();
    for ((counter, _), value) in last {
        *totals.entry(counter).or_insert(0.0) += value;
    }
    totals
}

impl ScenarioResult {
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        Transfer Testbed Results                        ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Configuration:");
        println!("  Seed: {:#x}", self.seed_used);
        println!("  Instances: {}", self.instances);
        println!("  Wall time: {:.2?}\n", self.wall_time);

        println!("Outcomes:");
        println!("  Succeeded: {}", self.succeeded);
        println!("  Failed: {}", self.failures.len());
        for (instance, error) in &self.failures {
            println!("    instance {}: {}", instance, error);
        }
        println!();

        for (index, perm) in self.permutations.iter().enumerate() {
            println!("Permutation {} ({}):", index, perm.label);
            match perm.fetch_range() {
                Some((min, max, avg)) => println!(
                    "  Time to fetch: min={:.2?}, max={:.2?}, avg={:.2?} ({} fetches)",
                    min,
                    max,
                    avg,
                    perm.fetch_times.len()
                ),
                None => println!("  Time to fetch: no successful fetch"),
            }
            println!("  Fetch failures: {}", perm.fetch_fails);
            if !perm.tcp_times.is_empty() {
                let avg = perm.tcp_times.iter().sum::<Duration>() / perm.tcp_times.len() as u32;
                println!("  TCP baseline: avg={:.2?}", avg);
            }
            println!();
        }

        if !self.counters.is_empty() {
            println!("Exchange Counters:");
            for name in COUNTERS {
                if let Some(value) = self.counters.get(name) {
                    println!("  {}: {}", name, value);
                }
            }
            println!();
        }

        println!("Metric points recorded: {}", self.metric_points);
    }
}
