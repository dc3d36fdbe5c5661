//! Metrics Recorder and Sinks
//!
//! Every point is emitted raw, keyed by a structured run identifier:
//!
//! ```text
//! topology:(S-L-P)/maxConnectionRate:R/latencyMS:L/bandwidthMB:B/run:N/seq:Q/
//!     groupName:G/groupSeq:GQ/fileSize:F/nodeType:T/nodeTypeIndex:I/name:<key>
//! ```
//!
//! Downstream analysis splits the key on `/` and pivots on any field. No
//! aggregation happens in-process.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::tb_interface::{MessageRecorder, MetricsRecorder, NodeType};

// ============================================================================
// Run Identifier
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentifier {
    pub seeds: usize,
    pub leech: usize,
    pub passive: usize,
    pub max_connection_rate: u32,
    pub latency_ms: u128,
    pub bandwidth_mb: u64,
    pub run: usize,
    pub seq: u64,
    pub group_name: String,
    pub grpseq: u64,
    pub file_size: u64,
    pub node_type: NodeType,
    pub tp_index: usize,
}

impl fmt::Display for RunIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "topology:({}-{}-{})/maxConnectionRate:{}/latencyMS:{}/bandwidthMB:{}/run:{}/seq:{}/groupName:{}/groupSeq:{}/fileSize:{}/nodeType:{}/nodeTypeIndex:{}",
            self.seeds,
            self.leech,
            self.passive,
            self.max_connection_rate,
            self.latency_ms,
            self.bandwidth_mb,
            self.run,
            self.seq,
            self.group_name,
            self.grpseq,
            self.file_size,
            self.node_type,
            self.tp_index
        )
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Destination for raw metric points
pub trait MetricsSink: Send + Sync {
    fn record_point(&self, name: &str, value: f64);
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
}

impl MetricPoint {
    /// Metric key, the part after the final `/name:`
    pub fn key(&self) -> &str {
        self.field("name").unwrap_or(&self.name)
    }

    /// Value of an identifier field, e.g. `field("nodeType")`
    pub fn field(&self, field: &str) -> Option<&str> {
        self.name
            .split('/')
            .filter_map(|part| part.split_once(':'))
            .find(|(k, _)| *k == field)
            .map(|(_, v)| v)
    }
}

/// Collects points in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricsSink {
    points: Arc<Mutex<Vec<MetricPoint>>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Points with the given metric key
    pub fn with_key(&self, key: &str) -> Vec<MetricPoint> {
        self.points()
            .into_iter()
            .filter(|p| p.key() == key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record_point(&self, name: &str, value: f64) {
        if let Ok(mut points) = self.points.lock() {
            points.push(MetricPoint {
                name: name.to_string(),
                value,
            });
        }
    }
}

/// Writes every point to the log at info level
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record_point(&self, name: &str, value: f64) {
        log::info!("metric {} = {}", name, value);
    }
}

/// `name,value` rows
pub struct CsvMetricsSink {
    writer: Mutex<BufWriter<File>>,
}

impl CsvMetricsSink {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "name,value")?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.writer.lock() {
            Ok(mut w) => w.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl MetricsSink for CsvMetricsSink {
    fn record_point(&self, name: &str, value: f64) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        // ids never contain commas, quoting is not needed
        if let Err(e) = writeln!(writer, "{},{}", name, value) {
            log::error!("Error writing metric to CSV: {}", e);
        }
    }
}

impl Drop for CsvMetricsSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Fans points out to several sinks
#[derive(Default)]
pub struct MultiMetricsSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl MultiMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn MetricsSink>) {
        self.sinks.push(sink);
    }
}

impl MetricsSink for MultiMetricsSink {
    fn record_point(&self, name: &str, value: f64) {
        for sink in &self.sinks {
            sink.record_point(name, value);
        }
    }
}

// ============================================================================
// Recorders
// ============================================================================

/// Recorder handed to the orchestrator and to `Node::emit_metrics` for one run
pub struct RunMetricsRecorder {
    id: String,
    sink: Arc<dyn MetricsSink>,
}

impl RunMetricsRecorder {
    pub fn new(id: &RunIdentifier, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            id: id.to_string(),
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl MetricsRecorder for RunMetricsRecorder {
    fn record(&self, key: &str, value: f64) {
        self.sink.record_point(&format!("{}/name:{}", self.id, key), value);
    }
}

/// Routes keep-alive and other instance messages into the log
pub struct LogMessageRecorder {
    prefix: String,
}

impl LogMessageRecorder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl MessageRecorder for LogMessageRecorder {
    fn record_message(&self, msg: &str) {
        log::info!("{}: {}", self.prefix, msg);
    }
}
