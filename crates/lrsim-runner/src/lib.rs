//! # lrsim-runner library
//!
//! Library interface for the LRSim simulation runner.
//!
//! This module re-exports the key types and functions needed for running
//! simulations programmatically and for integration testing. The
//! [`EventLoop`] owns the built simulation, pops events in time order,
//! dispatches them to their target entities and observes every dispatched
//! event to keep run statistics and an optional JSON trace.

pub mod metrics_export;

use lrsim_common::{EntityId, EntityRegistry, Event, EventId, EventPayload, NotificationKind, SimContext};
pub use lrsim_common::SimTime;
use lrsim_model::{BuiltSimulation, Host, NodeInfo};
use lrsim_phy::{Radio, RadioMedium};
use serde::Serialize;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] lrsim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] lrsim_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-node statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Signals this node put on the air.
    pub tx_signals: u64,
    /// Signals whose leading edge reached this node.
    pub rx_arrivals: u64,
    /// Arrivals the radio decided to track.
    pub rx_tracked: u64,
    /// Frames decoded and sent up.
    pub rx_frames: u64,
    /// Tracked receptions that ended unsuccessfully.
    pub rx_failed: u64,
    /// Tracked receptions aborted by invalidation or a transmission.
    pub rx_aborted: u64,
    /// Collisions counted against frames addressed to this node.
    pub collisions: u64,
    /// Collisions recorded in a payload-carrying part (gateways only).
    pub data_collisions: u64,
    /// Decoded frames addressed to this node or broadcast.
    pub frames_delivered: u64,
}

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Signals transmitted.
    pub signals_transmitted: u64,
    /// Signal arrivals at radios.
    pub receptions_started: u64,
    /// Arrivals that were tracked.
    pub receptions_tracked: u64,
    /// Frames decoded.
    pub frames_received: u64,
    /// Tracked receptions that failed.
    pub receptions_failed: u64,
    /// Tracked receptions aborted.
    pub receptions_aborted: u64,
    /// Counted collisions.
    pub collisions: u64,
    /// Gateway data-part collisions.
    pub data_collisions: u64,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Progress information passed to the progress callback during simulation.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current simulation time.
    pub sim_time: SimTime,
    /// Target simulation time, `None` when running until idle.
    pub target_time: Option<SimTime>,
    /// Elapsed wall clock time since start.
    pub wall_elapsed: Duration,
    /// Total events processed so far.
    pub events_processed: u64,
}

// ============================================================================
// Trace Recording
// ============================================================================

/// Payload for a signal put on the air.
#[derive(Debug, Clone, Serialize)]
pub struct TxSignalPayload {
    /// Direction is always "TX" for transmitted signals.
    pub direction: String,
    /// Signal identifier.
    pub signal_id: u64,
    /// Transmit power.
    #[serde(rename = "RSSI")]
    pub rssi: String,
    /// Spreading factor.
    pub spreading_factor: u8,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Destination address.
    pub destination: String,
    /// Raw frame payload (hex-encoded).
    pub frame_hex: String,
    /// Signal start time in seconds.
    pub signal_start_time_s: f64,
    /// Signal end time in seconds.
    pub signal_end_time_s: f64,
}

/// Payload for a decoded frame.
#[derive(Debug, Clone, Serialize)]
pub struct RxFramePayload {
    /// Direction is always "RX" for received frames.
    pub direction: String,
    /// Signal identifier.
    pub signal_id: u64,
    /// Minimum signal to noise-plus-interference ratio.
    #[serde(rename = "SNIR", skip_serializing_if = "Option::is_none")]
    pub snir: Option<String>,
    /// Received signal strength.
    #[serde(rename = "RSSI", skip_serializing_if = "Option::is_none")]
    pub rssi: Option<String>,
    /// Source address.
    pub source: String,
    /// Destination address.
    pub destination: String,
    /// Raw frame payload (hex-encoded).
    pub frame_hex: String,
    /// Packet error rate, when an error model estimated one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_error_rate: Option<f64>,
    /// Reception start time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_start_time_s: Option<f64>,
    /// Reception end time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_end_time_s: Option<f64>,
}

/// Payload for a radio notification.
#[derive(Debug, Clone, Serialize)]
pub struct PhyPayload {
    /// Signal concerned.
    pub signal_id: u64,
    /// What happened.
    #[serde(flatten)]
    pub kind: NotificationKind,
}

/// Payload types for different trace events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TracePayload {
    /// Transmitted signal.
    #[serde(rename = "SIGNAL")]
    TxSignal(TxSignalPayload),
    /// Decoded frame.
    #[serde(rename = "FRAME")]
    RxFrame(RxFramePayload),
    /// Radio notification.
    #[serde(rename = "PHY")]
    Phy(PhyPayload),
}

/// A trace entry for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Origin node name.
    pub origin: String,
    /// Origin entity ID.
    pub origin_id: String,
    /// Timestamp (ISO 8601).
    pub timestamp: String,
    /// Event-specific payload (flattened into this object).
    #[serde(flatten)]
    pub payload: TracePayload,
}

/// Trace recorder for outputting simulation events.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a new trace recorder.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    /// Whether entries are written anywhere.
    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    /// Record an event.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// Recorded entries.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Flush all entries to output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

/// Format a simulation time as an ISO 8601 timestamp on 2025-01-01.
fn trace_timestamp(time: SimTime) -> String {
    let sim_secs = time.as_secs_f64();
    format!(
        "2025-01-01T{:02}:{:02}:{:06.3}Z",
        (sim_secs / 3600.0) as u32 % 24,
        (sim_secs / 60.0) as u32 % 60,
        sim_secs % 60.0
    )
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    event_queue: BinaryHeap<Event>,
    simulation: BuiltSimulation,
    context: SimContext,
    trace: TraceRecorder,
    stats: SimulationStats,
    /// Per-node statistics, keyed by node name.
    node_stats: BTreeMap<String, NodeStats>,
    /// Mapping from radio and host entity IDs to node name.
    entity_to_name: HashMap<u64, String>,
    /// Mapping from host entity ID to index into `node_infos`.
    host_to_node: HashMap<u64, usize>,
}

impl EventLoop {
    /// Create a new event loop.
    ///
    /// Initial events are re-numbered from the loop's own context so their
    /// ids never clash with events posted during the run.
    pub fn new(simulation: BuiltSimulation, seed: u64, trace_output: Option<Box<dyn Write>>) -> Self {
        let mut context = SimContext::new(seed);
        let mut event_queue = BinaryHeap::new();
        for event in simulation.initial_events.iter().cloned() {
            event_queue.push(Event {
                id: EventId(context.next_event_id()),
                ..event
            });
        }

        let mut node_stats = BTreeMap::new();
        let mut entity_to_name = HashMap::new();
        let mut host_to_node = HashMap::new();
        for (index, node_info) in simulation.node_infos.iter().enumerate() {
            node_stats.insert(node_info.name.clone(), NodeStats::default());
            entity_to_name.insert(node_info.radio_entity_id, node_info.name.clone());
            entity_to_name.insert(node_info.host_entity_id, node_info.name.clone());
            host_to_node.insert(node_info.host_entity_id, index);
        }

        EventLoop {
            event_queue,
            simulation,
            context,
            trace: TraceRecorder::new(trace_output),
            stats: SimulationStats::default(),
            node_stats,
            entity_to_name,
            host_to_node,
        }
    }

    /// Run the simulation for the specified duration.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        self.run_with_progress(Some(duration), |_, _, _| {})
    }

    /// Run the simulation until no events remain.
    pub fn run_until_idle(&mut self) -> Result<SimulationStats, RunnerError> {
        self.run_with_progress(None, |_, _, _| {})
    }

    /// Run the simulation with a progress callback.
    ///
    /// The callback is invoked roughly every five seconds of wall time or
    /// every 100k events, and once more at the end with `is_final` set.
    pub fn run_with_progress<F>(&mut self, duration: Option<SimTime>, mut on_progress: F) -> Result<SimulationStats, RunnerError>
    where
        F: FnMut(&Self, ProgressInfo, bool), // bool = is_final
    {
        let start_time = Instant::now();
        let progress_interval = Duration::from_secs(5);
        let event_progress_interval = 100_000u64;
        let mut last_progress = Instant::now();
        let mut last_progress_events = 0u64;

        // Add end-of-simulation event
        if let Some(end_time) = duration {
            self.event_queue.push(Event {
                id: EventId(u64::MAX),
                time: end_time,
                source: EntityId::new(0),
                targets: vec![],
                payload: EventPayload::SimulationEnd,
            });
        }

        while let Some(event) = self.event_queue.pop() {
            if matches!(event.payload, EventPayload::SimulationEnd) {
                // Leave the clock at the requested end
                self.context.set_time(event.time);
                break;
            }

            self.context.set_time(event.time);
            self.simulation.entities.dispatch_event(&event, &mut self.context)?;
            self.event_queue.extend(self.context.take_pending_events());

            self.stats.total_events += 1;
            self.update_stats(&event);
            if self.trace.is_enabled() {
                self.record_trace(&event);
            }

            let events_since_last = self.stats.total_events - last_progress_events;
            if last_progress.elapsed() >= progress_interval || events_since_last >= event_progress_interval {
                let progress = ProgressInfo {
                    sim_time: self.context.time(),
                    target_time: duration,
                    wall_elapsed: start_time.elapsed(),
                    events_processed: self.stats.total_events,
                };
                on_progress(self, progress, false);
                last_progress = Instant::now();
                last_progress_events = self.stats.total_events;
            }
        }

        // Finalize stats
        self.stats.simulation_time_us = self.context.time().as_micros();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;
        info!(
            events = self.stats.total_events,
            sim_time = %self.context.time(),
            wall_ms = self.stats.wall_time_ms,
            "simulation finished"
        );

        let progress = ProgressInfo {
            sim_time: self.context.time(),
            target_time: duration,
            wall_elapsed: start_time.elapsed(),
            events_processed: self.stats.total_events,
        };
        on_progress(self, progress, true);

        self.trace.flush()?;
        Ok(self.stats.clone())
    }

    /// Get the per-node statistics, keyed by node name.
    pub fn node_stats(&self) -> &BTreeMap<String, NodeStats> {
        &self.node_stats
    }

    /// Get the simulation node info.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.simulation.node_infos
    }

    /// Get current statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Get current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Events still queued.
    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }

    /// Entities of the simulation, for inspection after a run.
    pub fn entities(&self) -> &EntityRegistry {
        &self.simulation.entities
    }

    /// Shared radio medium.
    pub fn medium(&self) -> &Arc<RadioMedium> {
        &self.simulation.medium
    }

    /// Recorded trace entries.
    pub fn trace_entries(&self) -> &[TraceEntry] {
        self.trace.entries()
    }

    /// The radio of a node.
    pub fn radio(&self, node: &str) -> Option<&Radio> {
        let info = self.node_info(node)?;
        self.simulation.entities.get_as::<Radio>(EntityId(info.radio_entity_id))
    }

    /// The host of a node.
    pub fn host(&self, node: &str) -> Option<&Host> {
        let info = self.node_info(node)?;
        self.simulation.entities.get_as::<Host>(EntityId(info.host_entity_id))
    }

    fn node_info(&self, node: &str) -> Option<&NodeInfo> {
        self.simulation.node_infos.iter().find(|info| info.name == node)
    }

    fn node_stats_for(&mut self, entity: EntityId) -> Option<&mut NodeStats> {
        let name = self.entity_to_name.get(&entity.0)?;
        self.node_stats.get_mut(name)
    }

    /// Update statistics based on event type.
    fn update_stats(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::TransmitAir(tx) => {
                self.stats.signals_transmitted += 1;
                if let Some(stats) = self.node_stats_for(tx.radio_id) {
                    stats.tx_signals += 1;
                }
            }
            EventPayload::Phy(notification) => {
                let stats = &mut self.stats;
                let Some(name) = self.entity_to_name.get(&notification.radio.0) else {
                    return;
                };
                let Some(node) = self.node_stats.get_mut(name) else {
                    return;
                };
                match notification.kind {
                    NotificationKind::ReceptionStarted { tracked } => {
                        stats.receptions_started += 1;
                        node.rx_arrivals += 1;
                        if tracked {
                            stats.receptions_tracked += 1;
                            node.rx_tracked += 1;
                        }
                    }
                    NotificationKind::ReceptionEnded { successful: true } => {
                        stats.frames_received += 1;
                        node.rx_frames += 1;
                    }
                    NotificationKind::ReceptionEnded { successful: false } => {
                        stats.receptions_failed += 1;
                        node.rx_failed += 1;
                    }
                    NotificationKind::ReceptionAborted => {
                        stats.receptions_aborted += 1;
                        node.rx_aborted += 1;
                    }
                    NotificationKind::CollisionDetected { counted, data_part, .. } => {
                        if counted {
                            stats.collisions += 1;
                            node.collisions += 1;
                        }
                        if data_part {
                            stats.data_collisions += 1;
                            node.data_collisions += 1;
                        }
                    }
                    NotificationKind::TransmissionStarted | NotificationKind::TransmissionEnded => {}
                }
            }
            EventPayload::RadioRxFrame(frame) => {
                for target in &event.targets {
                    let Some(&index) = self.host_to_node.get(&target.0) else {
                        continue;
                    };
                    let info = &self.simulation.node_infos[index];
                    let destination = frame.frame.destination;
                    if destination == info.address || destination.is_broadcast() {
                        if let Some(stats) = self.node_stats.get_mut(&info.name) {
                            stats.frames_delivered += 1;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Record a trace entry for an event.
    fn record_trace(&mut self, event: &Event) {
        let origin = self
            .entity_to_name
            .get(&event.source.0)
            .cloned()
            .unwrap_or_else(|| format!("Entity_{}", event.source.0));

        let payload = match &event.payload {
            EventPayload::TransmitAir(tx) => {
                let signal = &tx.signal;
                TracePayload::TxSignal(TxSignalPayload {
                    direction: "TX".to_string(),
                    signal_id: signal.id.0,
                    rssi: format!("{} dBm", signal.params.tx_power_dbm),
                    spreading_factor: signal.params.spreading_factor,
                    bandwidth_hz: signal.params.bandwidth_hz,
                    destination: signal.frame.destination.to_string(),
                    frame_hex: hex::encode(&signal.frame.payload),
                    signal_start_time_s: signal.start_time().as_secs_f64(),
                    signal_end_time_s: signal.end_time().as_secs_f64(),
                })
            }
            EventPayload::RadioRxFrame(decoded) => {
                let tags = &decoded.tags;
                TracePayload::RxFrame(RxFramePayload {
                    direction: "RX".to_string(),
                    signal_id: decoded.signal_id.0,
                    snir: tags.snir.map(|s| format!("{:.1} dB", s.min_db)),
                    rssi: tags.signal_power.map(|p| format!("{:.1} dBm", p.power_dbm)),
                    source: decoded.frame.source.to_string(),
                    destination: decoded.frame.destination.to_string(),
                    frame_hex: hex::encode(&decoded.frame.payload),
                    packet_error_rate: tags.error_rate.and_then(|e| e.packet_error_rate),
                    signal_start_time_s: tags.time.map(|t| t.start.as_secs_f64()),
                    signal_end_time_s: tags.time.map(|t| t.end.as_secs_f64()),
                })
            }
            EventPayload::Phy(notification) => match notification.kind {
                // Transmissions are already traced as signals
                NotificationKind::TransmissionStarted | NotificationKind::TransmissionEnded => return,
                kind => TracePayload::Phy(PhyPayload {
                    signal_id: notification.signal_id.0,
                    kind,
                }),
            },
            _ => return, // Don't record other event types
        };

        debug!(origin = %origin, time = %event.time, "trace entry");
        self.trace.record(TraceEntry {
            origin,
            origin_id: format!("{}", event.source.0),
            timestamp: trace_timestamp(event.time),
            payload,
        });
    }
}

/// Create a new event loop from a built simulation.
pub fn create_event_loop(simulation: BuiltSimulation, seed: u64) -> EventLoop {
    EventLoop::new(simulation, seed, None)
}

// Re-export key types for convenience
pub use lrsim_model::{build_simulation, load_model, load_model_from_str, load_models, load_models_from_str, Model};
