//! Metrics export for simulation results.
//!
//! [`InMemoryRecorder`] implements the `metrics` recorder interface and keeps
//! every counter, gauge and histogram in memory. At the end of a run a
//! [`MetricsSnapshot`] aggregates each metric across nodes and breaks it down
//! by node and, for part-labelled metrics, by signal part.

use lrsim_common::SimTime;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Metrics Snapshot Types
// ============================================================================

/// Per-node metric values.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NodeMetrics {
    /// Node type label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Counter metrics for this node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Gauge metrics for this node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    /// Histogram metrics for this node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Collected metric data for export.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    /// Simulation time at which the snapshot was taken, in seconds.
    pub simulation_time_s: f64,
    /// Counter metrics (name -> value), summed across nodes.
    pub counters: BTreeMap<String, u64>,
    /// Gauge metrics (name -> value), summed across nodes.
    pub gauges: BTreeMap<String, f64>,
    /// Histogram metrics (name -> summary stats) over all nodes.
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Counters carrying a `part` label, broken down by part.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub by_part: BTreeMap<String, BTreeMap<String, u64>>,
    /// Per-node breakdown of metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
    /// Units of described metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<String, String>,
}

/// Summary statistics for a histogram metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    /// Number of samples recorded.
    pub count: u64,
    /// Sum of all samples.
    pub sum: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
    /// Mean value.
    pub mean: f64,
    /// 50th percentile (median).
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

impl HistogramSummary {
    fn empty() -> Self {
        HistogramSummary {
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p50: 0.0,
            p90: 0.0,
            p99: 0.0,
        }
    }
}

// ============================================================================
// Export Functions
// ============================================================================

/// Export metrics as JSON.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

/// Export metrics in Prometheus text exposition format.
pub fn export_prometheus<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    for (name, value) in &snapshot.counters {
        let prom_name = name.replace('.', "_");
        writeln!(writer, "# TYPE {} counter", prom_name)?;
        writeln!(writer, "{} {}", prom_name, value)?;
        for (node, metrics) in &snapshot.nodes {
            if let Some(value) = metrics.counters.get(name) {
                writeln!(writer, "{}{{node=\"{}\"}} {}", prom_name, node, value)?;
            }
        }
    }

    for (name, value) in &snapshot.gauges {
        let prom_name = name.replace('.', "_");
        writeln!(writer, "# TYPE {} gauge", prom_name)?;
        writeln!(writer, "{} {}", prom_name, format_float(*value))?;
    }

    for (name, summary) in &snapshot.histograms {
        let prom_name = name.replace('.', "_");
        writeln!(writer, "# TYPE {} summary", prom_name)?;
        for (quantile, value) in [("0.5", summary.p50), ("0.9", summary.p90), ("0.99", summary.p99)] {
            writeln!(writer, "{}{{quantile=\"{}\"}} {}", prom_name, quantile, format_float(value))?;
        }
        writeln!(writer, "{}_sum {}", prom_name, format_float(summary.sum))?;
        writeln!(writer, "{}_count {}", prom_name, summary.count)?;
    }
    Ok(())
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// Maximum number of samples kept per histogram for percentiles.
const HISTOGRAM_RESERVOIR_SIZE: usize = 10_000;

#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

/// Gauge value stored as f64 bits.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Histogram samples with reservoir sampling (Algorithm R) beyond
/// [`HISTOGRAM_RESERVOIR_SIZE`] samples.
#[derive(Debug)]
struct HistogramState {
    reservoir: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// xorshift64 state.
    rng_state: u64,
}

impl Default for HistogramState {
    fn default() -> Self {
        HistogramState {
            reservoir: Vec::new(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            rng_state: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

impl HistogramState {
    fn next_random(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.reservoir.len() < HISTOGRAM_RESERVOIR_SIZE {
            self.reservoir.push(value);
        } else {
            let j = (self.next_random() % self.count) as usize;
            if j < HISTOGRAM_RESERVOIR_SIZE {
                self.reservoir[j] = value;
            }
        }
    }

    fn summary(&self) -> HistogramSummary {
        if self.count == 0 {
            return HistogramSummary::empty();
        }
        let mut summary = summarize(&self.reservoir);
        summary.count = self.count;
        summary.sum = self.sum;
        summary.min = self.min;
        summary.max = self.max;
        summary.mean = self.sum / self.count as f64;
        summary
    }
}

/// Summary of a sample set, with nearest-rank percentiles.
fn summarize(samples: &[f64]) -> HistogramSummary {
    if samples.is_empty() {
        return HistogramSummary::empty();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let count = sorted.len() as u64;
    let sum: f64 = sorted.iter().sum();
    let percentile = |p: f64| -> f64 {
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };

    HistogramSummary {
        count,
        sum,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: sum / count as f64,
        p50: percentile(50.0),
        p90: percentile(90.0),
        p99: percentile(99.0),
    }
}

/// A metric key split into its name and labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct KeyParts {
    name: String,
    labels: Vec<(String, String)>,
}

impl KeyParts {
    fn from_key(key: &Key) -> Self {
        let mut labels: Vec<(String, String)> = key
            .labels()
            .map(|l| (l.key().to_string(), l.value().to_string()))
            .collect();
        labels.sort();
        KeyParts {
            name: key.name().to_string(),
            labels,
        }
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<KeyParts, Arc<CounterState>>>,
    gauges: RwLock<BTreeMap<KeyParts, Arc<GaugeState>>>,
    histograms: RwLock<BTreeMap<KeyParts, Arc<Mutex<HistogramState>>>>,
    units: RwLock<BTreeMap<String, String>>,
}

fn get_or_create<T: Default>(map: &RwLock<BTreeMap<KeyParts, Arc<T>>>, key: &Key) -> Arc<T> {
    let parts = KeyParts::from_key(key);
    if let Some(existing) = map.read().get(&parts) {
        return existing.clone();
    }
    map.write().entry(parts).or_default().clone()
}

fn node_entry<'a>(
    nodes: &'a mut BTreeMap<String, NodeMetrics>,
    key: &KeyParts,
) -> Option<&'a mut NodeMetrics> {
    let node = key.label("node")?;
    let entry = nodes.entry(node.to_string()).or_default();
    if entry.node_type.is_none() {
        entry.node_type = key.label("node_type").map(str::to_string);
    }
    Some(entry)
}

impl RecorderState {
    fn snapshot(&self, now: SimTime) -> MetricsSnapshot {
        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut gauges: BTreeMap<String, f64> = BTreeMap::new();
        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut by_part: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        let mut nodes: BTreeMap<String, NodeMetrics> = BTreeMap::new();

        for (key, counter) in self.counters.read().iter() {
            let value = counter.value.load(Ordering::Relaxed);
            *counters.entry(key.name.clone()).or_insert(0) += value;
            if let Some(part) = key.label("part") {
                *by_part
                    .entry(key.name.clone())
                    .or_default()
                    .entry(part.to_string())
                    .or_insert(0) += value;
            }
            if let Some(node) = node_entry(&mut nodes, key) {
                *node.counters.entry(key.name.clone()).or_insert(0) += value;
            }
        }

        for (key, gauge) in self.gauges.read().iter() {
            let value = gauge.get();
            *gauges.entry(key.name.clone()).or_insert(0.0) += value;
            if let Some(node) = node_entry(&mut nodes, key) {
                *node.gauges.entry(key.name.clone()).or_insert(0.0) += value;
            }
        }

        for (key, histogram) in self.histograms.read().iter() {
            let histogram = histogram.lock();
            samples
                .entry(key.name.clone())
                .or_default()
                .extend_from_slice(&histogram.reservoir);
            if let Some(node) = node_entry(&mut nodes, key) {
                node.histograms.insert(key.name.clone(), histogram.summary());
            }
        }

        MetricsSnapshot {
            simulation_time_s: now.as_secs_f64(),
            counters,
            gauges,
            histograms: samples
                .into_iter()
                .map(|(name, samples)| (name, summarize(&samples)))
                .collect(),
            by_part,
            nodes,
            units: self.units.read().clone(),
        }
    }

    fn describe(&self, key: KeyName, unit: Option<Unit>) {
        if let Some(unit) = unit {
            self.units
                .write()
                .insert(key.as_str().to_string(), unit.as_str().to_string());
        }
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// In-memory metrics recorder that collects metrics for later export.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    /// Create a new in-memory recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of all current metric values.
    pub fn snapshot(&self, now: SimTime) -> MetricsSnapshot {
        self.state.snapshot(now)
    }
}

struct InMemoryCounter(Arc<CounterState>);

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.0.value.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.0.value.fetch_max(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge(Arc<GaugeState>);

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.0.update(|v| v + value);
    }

    fn decrement(&self, value: f64) {
        self.0.update(|v| v - value);
    }

    fn set(&self, value: f64) {
        self.0.update(|_| value);
    }
}

struct InMemoryHistogram(Arc<Mutex<HistogramState>>);

impl metrics::HistogramFn for InMemoryHistogram {
    fn record(&self, value: f64) {
        self.0.lock().record(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, _description: SharedString) {
        self.state.describe(key, unit);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, _description: SharedString) {
        self.state.describe(key, unit);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, _description: SharedString) {
        self.state.describe(key, unit);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(InMemoryCounter(get_or_create(&self.state.counters, key))))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(InMemoryGauge(get_or_create(&self.state.gauges, key))))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(InMemoryHistogram(get_or_create(&self.state.histograms, key))))
    }
}
