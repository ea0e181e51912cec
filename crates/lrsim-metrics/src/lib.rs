//! # lrsim-metrics
//!
//! Metric names, descriptions and label conventions for LRSim.
//!
//! Library crates record through the [`metrics`] facade using the
//! definitions in [`metric_defs`]; the runner decides whether a recorder is
//! installed. Without one every call is a no-op.

pub use metrics;

use metrics::Unit;

// ============================================================================
// Metric Definitions
// ============================================================================

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Value that moves up and down.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => f.write_str("counter"),
            MetricKind::Gauge => f.write_str("gauge"),
            MetricKind::Histogram => f.write_str("histogram"),
        }
    }
}

/// Static description of a metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Full metric name.
    pub name: &'static str,
    /// Metric kind.
    pub kind: MetricKind,
    /// Unit of recorded values.
    pub unit: Option<Unit>,
    /// Human readable description.
    pub description: &'static str,
    /// Labels recorded in addition to the node labels.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit as a display string, empty when unitless.
    pub fn unit_str(&self) -> &'static str {
        self.unit.map(|u| u.as_str()).unwrap_or("")
    }
}

/// All metrics emitted by LRSim.
pub mod metric_defs {
    use super::{MetricDef, MetricKind};
    use metrics::Unit;

    /// Signals put on the air.
    pub const RADIO_TX_SIGNALS: MetricDef = MetricDef {
        name: "lrsim.radio.tx_signals",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Signals transmitted by the radio",
        labels: &[],
    };

    /// Total transmit airtime.
    pub const RADIO_TX_AIRTIME: MetricDef = MetricDef {
        name: "lrsim.radio.tx_airtime",
        kind: MetricKind::Counter,
        unit: Some(Unit::Microseconds),
        description: "Total time spent transmitting",
        labels: &[],
    };

    /// Frames decoded and delivered upward.
    pub const RADIO_RX_FRAMES: MetricDef = MetricDef {
        name: "lrsim.radio.rx_frames",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Frames successfully decoded",
        labels: &["part"],
    };

    /// Receptions addressed to the radio that were lost to a collision.
    pub const RADIO_RX_COLLIDED: MetricDef = MetricDef {
        name: "lrsim.radio.rx_collided",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Receptions addressed to this radio lost to a collision",
        labels: &["part"],
    };

    /// Data-part collisions recorded by gateways.
    pub const RADIO_RX_DATA_COLLISIONS: MetricDef = MetricDef {
        name: "lrsim.radio.rx_data_collisions",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Collisions in the payload part recorded by gateways",
        labels: &[],
    };

    /// Reception parts below sensitivity.
    pub const RADIO_RX_BELOW_SENSITIVITY: MetricDef = MetricDef {
        name: "lrsim.radio.rx_below_sensitivity",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Reception parts whose power was below sensitivity",
        labels: &["part"],
    };

    /// Arrivals not tracked because listening was impossible.
    pub const RADIO_RX_LISTENING_IMPOSSIBLE: MetricDef = MetricDef {
        name: "lrsim.radio.rx_listening_impossible",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Arrivals below the energy detection level",
        labels: &[],
    };

    /// Tracked receptions aborted by invalidation.
    pub const RADIO_RX_ABORTED: MetricDef = MetricDef {
        name: "lrsim.radio.rx_aborted",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Tracked receptions aborted before completion",
        labels: &[],
    };

    /// Arrivals dropped because the in-flight arena was full.
    pub const RADIO_RX_DROPPED: MetricDef = MetricDef {
        name: "lrsim.radio.rx_dropped",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Arrivals dropped because too many receptions were in flight",
        labels: &[],
    };

    /// Receptions currently in flight at the radio.
    pub const RADIO_ACTIVE_RECEPTIONS: MetricDef = MetricDef {
        name: "lrsim.radio.active_receptions",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Count),
        description: "Receptions currently in flight at the radio",
        labels: &[],
    };

    /// Minimum SNIR of decoded frames.
    pub const RADIO_RX_SNIR_MIN: MetricDef = MetricDef {
        name: "lrsim.radio.rx_snir_min",
        kind: MetricKind::Histogram,
        unit: None,
        description: "Minimum SNIR of decoded frames in dB",
        labels: &[],
    };

    /// Received power of decoded frames.
    pub const RADIO_RX_POWER: MetricDef = MetricDef {
        name: "lrsim.radio.rx_power",
        kind: MetricKind::Histogram,
        unit: None,
        description: "Received power of decoded frames in dBm",
        labels: &[],
    };

    /// Frames addressed to the host that reached it.
    pub const HOST_FRAMES_DELIVERED: MetricDef = MetricDef {
        name: "lrsim.host.frames_delivered",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Frames addressed to this host that were delivered",
        labels: &[],
    };

    /// Frames addressed elsewhere that the host decoded anyway.
    pub const HOST_FRAMES_OVERHEARD: MetricDef = MetricDef {
        name: "lrsim.host.frames_overheard",
        kind: MetricKind::Counter,
        unit: Some(Unit::Count),
        description: "Frames addressed to another node that were decoded",
        labels: &[],
    };

    /// Every metric definition, in documentation order.
    pub const ALL: &[MetricDef] = &[
        RADIO_TX_SIGNALS,
        RADIO_TX_AIRTIME,
        RADIO_RX_FRAMES,
        RADIO_RX_COLLIDED,
        RADIO_RX_DATA_COLLISIONS,
        RADIO_RX_BELOW_SENSITIVITY,
        RADIO_RX_LISTENING_IMPOSSIBLE,
        RADIO_RX_ABORTED,
        RADIO_RX_DROPPED,
        RADIO_ACTIVE_RECEPTIONS,
        RADIO_RX_SNIR_MIN,
        RADIO_RX_POWER,
        HOST_FRAMES_DELIVERED,
        HOST_FRAMES_OVERHEARD,
    ];
}

/// Register descriptions of all metrics with the installed recorder.
pub fn describe_metrics() {
    for def in metric_defs::ALL {
        match (def.kind, def.unit) {
            (MetricKind::Counter, Some(unit)) => {
                metrics::describe_counter!(def.name, unit, def.description)
            }
            (MetricKind::Counter, None) => metrics::describe_counter!(def.name, def.description),
            (MetricKind::Gauge, Some(unit)) => metrics::describe_gauge!(def.name, unit, def.description),
            (MetricKind::Gauge, None) => metrics::describe_gauge!(def.name, def.description),
            (MetricKind::Histogram, Some(unit)) => {
                metrics::describe_histogram!(def.name, unit, def.description)
            }
            (MetricKind::Histogram, None) => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

// ============================================================================
// Labels
// ============================================================================

/// Labels identifying the node an entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node name.
    pub node: String,
    /// Node type (role).
    pub node_type: String,
    /// Groups the node belongs to.
    pub groups: Vec<String>,
}

impl MetricLabels {
    /// Create labels for a node.
    pub fn new(node: impl Into<String>, node_type: impl Into<String>) -> Self {
        MetricLabels {
            node: node.into(),
            node_type: node_type.into(),
            groups: Vec::new(),
        }
    }

    /// Attach group memberships.
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    /// Convert to label pairs for the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("node", self.node.clone()), ("node_type", self.node_type.clone())];
        if !self.groups.is_empty() {
            labels.push(("groups", self.groups.join(",")));
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_unique_and_prefixed() {
        let mut names: Vec<&str> = metric_defs::ALL.iter().map(|d| d.name).collect();
        assert!(names.iter().all(|n| n.starts_with("lrsim.")));
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_labels_include_groups_only_when_set() {
        let labels = MetricLabels::new("gw", "gateway");
        assert_eq!(labels.to_labels().len(), 2);

        let labels = labels.with_groups(vec!["north".into(), "core".into()]);
        let pairs = labels.to_labels();
        assert_eq!(pairs[2], ("groups", "north,core".to_string()));
    }

    #[test]
    fn test_unit_str() {
        assert_eq!(metric_defs::RADIO_TX_AIRTIME.unit_str(), "microseconds");
        assert_eq!(metric_defs::RADIO_RX_POWER.unit_str(), "");
    }
}
