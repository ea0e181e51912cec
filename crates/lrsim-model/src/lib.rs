//! # lrsim-model
//!
//! YAML model loading and simulation building for LRSim.
//!
//! This crate provides:
//! - YAML schema types for simulation models
//! - Model loading from files and strings, with multi-file merging
//! - Simulation building from loaded models ([`build_simulation`])
//! - The traffic-generating upper layer entity ([`Host`])
//!
//! ## Merging
//!
//! Several model files can be layered. Later files override earlier ones:
//! - `simulation`, `phy`, `medium` and `defaults` fields are overridden one by one
//! - Nodes with the same name are merged field by field; `remove: true` deletes a node
//! - Traffic entries are accumulated
//!
//! Validation (node references, radio parameters) runs on the merged model only.

pub mod host;

pub use host::{Host, HostStats, ScheduledTx};

use lrsim_common::{
    EntityId, EntityRegistry, Event, EventId, EventPayload, MacAddress, Position, SimTime, TxParams,
};
use lrsim_metrics::MetricLabels;
use lrsim_phy::{
    ChannelAccess, EndpointRole, MediumConfig, MediumEntity, PhyConfig, Radio, RadioMedium, Receiver,
    SnrThresholdErrorModel,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// LoRa bandwidths a radio can be configured with.
pub const SUPPORTED_BANDWIDTHS_HZ: [u32; 10] = [
    7_800, 10_400, 15_600, 20_800, 31_250, 41_700, 62_500, 125_000, 250_000, 500_000,
];

/// Largest LoRa payload in bytes.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Destination name in traffic entries that addresses every node.
pub const BROADCAST_DESTINATION: &str = "broadcast";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during model operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Duplicate node name or address.
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// Public Model API
// ============================================================================

/// Error model attached to every receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorModelKind {
    /// No model; decoded frames report zero error rates.
    #[default]
    None,
    /// Step model on the minimum SNIR.
    SnrThreshold,
}

/// Simulation-wide settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationSettings {
    /// Simulated duration in seconds. `None` runs until the event queue drains.
    pub duration_s: Option<f64>,
    /// RNG seed.
    pub seed: Option<u64>,
}

/// A loaded simulation model with resolved parameters.
#[derive(Debug, Clone)]
pub struct Model {
    nodes: BTreeMap<String, Node>,
    simulation: SimulationSettings,
    phy: PhyConfig,
    medium: MediumConfig,
    error_model: ErrorModelKind,
    traffic: Vec<Traffic>,
}

impl Model {
    /// Get the nodes in this model, ordered by name.
    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    /// Find a node by name.
    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Simulation-wide settings.
    pub fn simulation(&self) -> &SimulationSettings {
        &self.simulation
    }

    /// PHY parameters shared by all radios.
    pub fn phy(&self) -> &PhyConfig {
        &self.phy
    }

    /// Medium parameters.
    pub fn medium(&self) -> &MediumConfig {
        &self.medium
    }

    /// Error model attached to receivers.
    pub fn error_model(&self) -> ErrorModelKind {
        self.error_model
    }

    /// Traffic entries in file order.
    pub fn traffic(&self) -> &[Traffic] {
        &self.traffic
    }
}

/// A node with resolved radio parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node name (unique identifier).
    pub name: String,
    /// Endpoint role.
    pub role: EndpointRole,
    /// MAC address.
    pub address: MacAddress,
    /// Position in meters.
    pub position: Position,
    /// Transmission parameters.
    pub radio: TxParams,
    /// Metric groups.
    pub groups: Vec<String>,
}

/// A traffic entry: frames sent by one node to another or to everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Traffic {
    /// Sending node.
    pub from: String,
    /// Receiving node, or `broadcast`.
    pub to: String,
    /// Time of the first frame in seconds.
    pub at_s: f64,
    /// Payload length in bytes.
    #[serde(default = "default_payload_len")]
    pub payload_len: usize,
    /// Number of frames.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Interval between frames in seconds.
    #[serde(default)]
    pub interval_s: f64,
    /// Uniform random offset in `[0, jitter_s]` added to every frame.
    #[serde(default)]
    pub jitter_s: f64,
}

fn default_payload_len() -> usize {
    20
}

fn default_count() -> u32 {
    1
}

// ============================================================================
// YAML Schema Types (Internal)
// ============================================================================

/// Root simulation model structure (YAML schema).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimulationModelYaml {
    #[serde(default)]
    simulation: SimulationYaml,
    #[serde(default)]
    phy: PhyYaml,
    #[serde(default)]
    medium: MediumYaml,
    #[serde(default)]
    defaults: DefaultsYaml,
    #[serde(default)]
    nodes: Vec<NodeConfigYaml>,
    #[serde(default)]
    traffic: Vec<Traffic>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimulationYaml {
    duration_s: Option<f64>,
    seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PhyYaml {
    channel_access: Option<ChannelAccess>,
    energy_detection_dbm: Option<f64>,
    background_noise_dbm: Option<f64>,
    preamble_symbols: Option<u32>,
    separate_parts: Option<bool>,
    max_concurrent_receptions: Option<usize>,
    error_model: Option<ErrorModelKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct MediumYaml {
    path_loss_exponent: Option<f64>,
    reference_loss_db: Option<f64>,
    reference_distance_m: Option<f64>,
    shadowing_sigma_db: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsYaml {
    #[serde(default)]
    radio: RadioYaml,
}

/// Radio parameters; unset fields inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RadioYaml {
    frequency_hz: Option<u32>,
    bandwidth_hz: Option<u32>,
    spreading_factor: Option<u8>,
    code_redundancy: Option<u8>,
    tx_power_dbm: Option<f64>,
    use_header: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigYaml {
    /// Node name (must be unique).
    name: String,
    /// When true, this node will be removed during model merging.
    #[serde(default)]
    remove: bool,
    role: Option<EndpointRole>,
    address: Option<u64>,
    position: Option<Position>,
    #[serde(default)]
    radio: RadioYaml,
    groups: Option<Vec<String>>,
}

/// Replace `target` when `overlay` is set.
fn overlay<T: Clone>(target: &mut Option<T>, overlay: &Option<T>) {
    if overlay.is_some() {
        *target = overlay.clone();
    }
}

impl RadioYaml {
    fn merge(&mut self, other: &RadioYaml) {
        overlay(&mut self.frequency_hz, &other.frequency_hz);
        overlay(&mut self.bandwidth_hz, &other.bandwidth_hz);
        overlay(&mut self.spreading_factor, &other.spreading_factor);
        overlay(&mut self.code_redundancy, &other.code_redundancy);
        overlay(&mut self.tx_power_dbm, &other.tx_power_dbm);
        overlay(&mut self.use_header, &other.use_header);
    }

    fn apply_to(&self, params: &mut TxParams) {
        if let Some(v) = self.frequency_hz {
            params.center_frequency_hz = v;
        }
        if let Some(v) = self.bandwidth_hz {
            params.bandwidth_hz = v;
        }
        if let Some(v) = self.spreading_factor {
            params.spreading_factor = v;
        }
        if let Some(v) = self.code_redundancy {
            params.code_redundancy = v;
        }
        if let Some(v) = self.tx_power_dbm {
            params.tx_power_dbm = v;
        }
        if let Some(v) = self.use_header {
            params.use_header = v;
        }
    }
}

impl NodeConfigYaml {
    fn merge(&mut self, other: &NodeConfigYaml) {
        overlay(&mut self.role, &other.role);
        overlay(&mut self.address, &other.address);
        overlay(&mut self.position, &other.position);
        overlay(&mut self.groups, &other.groups);
        self.radio.merge(&other.radio);
    }
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a simulation model from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    load_models(&[path])
}

/// Parse a simulation model from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    load_models_from_str(&[yaml_str])
}

/// Load and merge multiple simulation models from files. Later files override
/// earlier ones.
pub fn load_models(paths: &[&Path]) -> Result<Model, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No model files provided".to_string()));
    }

    let yaml_strings = paths
        .iter()
        .map(std::fs::read_to_string)
        .collect::<Result<Vec<String>, std::io::Error>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();

    load_models_from_str(&yaml_strs)
}

/// Load and merge multiple simulation models from YAML strings. Later strings
/// override earlier ones.
pub fn load_models_from_str(yaml_strs: &[&str]) -> Result<Model, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig("No model strings provided".to_string()));
    }

    let mut simulation = SimulationYaml::default();
    let mut phy = PhyYaml::default();
    let mut medium = MediumYaml::default();
    let mut radio_defaults = RadioYaml::default();
    let mut nodes: BTreeMap<String, NodeConfigYaml> = BTreeMap::new();
    let mut traffic = Vec::new();

    for yaml_str in yaml_strs {
        // An empty document deserializes to unit, not to an empty mapping
        let yaml: SimulationModelYaml = if yaml_str.trim().is_empty() {
            SimulationModelYaml::default()
        } else {
            serde_yaml::from_str(yaml_str)?
        };

        overlay(&mut simulation.duration_s, &yaml.simulation.duration_s);
        overlay(&mut simulation.seed, &yaml.simulation.seed);

        overlay(&mut phy.channel_access, &yaml.phy.channel_access);
        overlay(&mut phy.energy_detection_dbm, &yaml.phy.energy_detection_dbm);
        overlay(&mut phy.background_noise_dbm, &yaml.phy.background_noise_dbm);
        overlay(&mut phy.preamble_symbols, &yaml.phy.preamble_symbols);
        overlay(&mut phy.separate_parts, &yaml.phy.separate_parts);
        overlay(&mut phy.max_concurrent_receptions, &yaml.phy.max_concurrent_receptions);
        overlay(&mut phy.error_model, &yaml.phy.error_model);

        overlay(&mut medium.path_loss_exponent, &yaml.medium.path_loss_exponent);
        overlay(&mut medium.reference_loss_db, &yaml.medium.reference_loss_db);
        overlay(&mut medium.reference_distance_m, &yaml.medium.reference_distance_m);
        overlay(&mut medium.shadowing_sigma_db, &yaml.medium.shadowing_sigma_db);

        radio_defaults.merge(&yaml.defaults.radio);

        for node in yaml.nodes {
            if node.remove {
                if nodes.remove(&node.name).is_none() {
                    return Err(ModelError::NodeNotFound(node.name));
                }
                traffic.retain(|t: &Traffic| t.from != node.name && t.to != node.name);
            } else if let Some(existing) = nodes.get_mut(&node.name) {
                existing.merge(&node);
            } else {
                nodes.insert(node.name.clone(), node);
            }
        }

        traffic.extend(yaml.traffic);
    }

    resolve(simulation, phy, medium, &radio_defaults, nodes, traffic)
}

/// Turn the merged YAML layers into a validated [`Model`].
fn resolve(
    simulation: SimulationYaml,
    phy: PhyYaml,
    medium: MediumYaml,
    radio_defaults: &RadioYaml,
    nodes: BTreeMap<String, NodeConfigYaml>,
    traffic: Vec<Traffic>,
) -> Result<Model, ModelError> {
    if nodes.is_empty() {
        return Err(ModelError::InvalidConfig("Model has no nodes".to_string()));
    }

    let defaults = PhyConfig::default();
    let phy_config = PhyConfig {
        channel_access: phy.channel_access.unwrap_or(defaults.channel_access),
        energy_detection_dbm: phy.energy_detection_dbm.unwrap_or(defaults.energy_detection_dbm),
        preamble_symbols: phy.preamble_symbols.unwrap_or(defaults.preamble_symbols),
        separate_parts: phy.separate_parts.unwrap_or(defaults.separate_parts),
        max_concurrent_receptions: phy
            .max_concurrent_receptions
            .unwrap_or(defaults.max_concurrent_receptions),
    };
    if phy_config.max_concurrent_receptions == 0
        || phy_config.max_concurrent_receptions > PhyConfig::MAX_CONCURRENT_RECEPTIONS
    {
        return Err(ModelError::InvalidConfig(format!(
            "max_concurrent_receptions must be in 1..={}, got {}",
            PhyConfig::MAX_CONCURRENT_RECEPTIONS,
            phy_config.max_concurrent_receptions
        )));
    }

    let mut medium_config = MediumConfig::default();
    if let Some(v) = phy.background_noise_dbm {
        medium_config.background_noise_dbm = v;
    }
    let path_loss = &mut medium_config.path_loss;
    path_loss.path_loss_exponent = medium.path_loss_exponent.unwrap_or(path_loss.path_loss_exponent);
    path_loss.reference_loss_db = medium.reference_loss_db.unwrap_or(path_loss.reference_loss_db);
    path_loss.reference_distance_m = medium.reference_distance_m.unwrap_or(path_loss.reference_distance_m);
    path_loss.shadowing_sigma_db = medium.shadowing_sigma_db.unwrap_or(path_loss.shadowing_sigma_db);
    if path_loss.reference_distance_m <= 0.0 {
        return Err(ModelError::InvalidConfig(
            "reference_distance_m must be positive".to_string(),
        ));
    }

    let mut resolved = BTreeMap::new();
    let mut addresses: BTreeMap<MacAddress, String> = BTreeMap::new();
    for (index, (name, node)) in nodes.into_iter().enumerate() {
        let mut radio = TxParams::default();
        radio_defaults.apply_to(&mut radio);
        node.radio.apply_to(&mut radio);
        validate_radio(&name, &radio)?;

        // Unaddressed nodes are numbered from 1 in name order
        let address = MacAddress(node.address.unwrap_or(index as u64 + 1));
        if address.is_broadcast() {
            return Err(ModelError::InvalidConfig(format!(
                "Node '{name}' uses the broadcast address"
            )));
        }
        if let Some(other) = addresses.insert(address, name.clone()) {
            return Err(ModelError::DuplicateNode(format!(
                "address {address} used by '{other}' and '{name}'"
            )));
        }

        let node = Node {
            name: name.clone(),
            role: node.role.unwrap_or(EndpointRole::EndDevice),
            address,
            position: node.position.unwrap_or_default(),
            radio,
            groups: node.groups.unwrap_or_default(),
        };
        resolved.insert(name, node);
    }

    for entry in &traffic {
        if !resolved.contains_key(&entry.from) {
            return Err(ModelError::NodeNotFound(entry.from.clone()));
        }
        if entry.to != BROADCAST_DESTINATION && !resolved.contains_key(&entry.to) {
            return Err(ModelError::NodeNotFound(entry.to.clone()));
        }
        if entry.payload_len > MAX_PAYLOAD_LEN {
            return Err(ModelError::InvalidConfig(format!(
                "Traffic from '{}' has payload_len {} (max {MAX_PAYLOAD_LEN})",
                entry.from, entry.payload_len
            )));
        }
        if entry.at_s < 0.0 || entry.interval_s < 0.0 || entry.jitter_s < 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "Traffic from '{}' has a negative time",
                entry.from
            )));
        }
    }

    Ok(Model {
        nodes: resolved,
        simulation: SimulationSettings {
            duration_s: simulation.duration_s,
            seed: simulation.seed,
        },
        phy: phy_config,
        medium: medium_config,
        error_model: phy.error_model.unwrap_or_default(),
        traffic,
    })
}

fn validate_radio(name: &str, radio: &TxParams) -> Result<(), ModelError> {
    if !(6..=12).contains(&radio.spreading_factor) {
        return Err(ModelError::InvalidConfig(format!(
            "Node '{name}' has spreading factor {} (expected 6-12)",
            radio.spreading_factor
        )));
    }
    if !SUPPORTED_BANDWIDTHS_HZ.contains(&radio.bandwidth_hz) {
        return Err(ModelError::InvalidConfig(format!(
            "Node '{name}' has unsupported bandwidth {} Hz",
            radio.bandwidth_hz
        )));
    }
    if !(1..=4).contains(&radio.code_redundancy) {
        return Err(ModelError::InvalidConfig(format!(
            "Node '{name}' has code redundancy {} (expected 1-4)",
            radio.code_redundancy
        )));
    }
    Ok(())
}

// ============================================================================
// Model Building
// ============================================================================

/// Entity id of the medium entity in a built simulation.
pub const MEDIUM_ENTITY_ID: EntityId = EntityId(0);

/// Information about a node for display and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Node name from the model.
    pub name: String,
    /// Role label.
    pub role: String,
    /// MAC address.
    pub address: MacAddress,
    /// Entity ID of the radio entity.
    pub radio_entity_id: u64,
    /// Entity ID of the host entity.
    pub host_entity_id: u64,
    /// Position of the node.
    pub position: Position,
}

/// Result of building a simulation from a model.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Shared radio medium.
    pub medium: Arc<RadioMedium>,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each node, ordered by name.
    pub node_infos: Vec<NodeInfo>,
}

/// Build a simulation from a model.
///
/// Entity ids are allocated deterministically: the medium is 0, then each
/// node in name order gets a radio and a host id. The seed drives traffic
/// jitter only; propagation randomness comes from the event loop's context.
pub fn build_simulation(model: &Model, seed: u64) -> Result<BuiltSimulation, ModelError> {
    let mut entities = EntityRegistry::new();
    let mut initial_events = Vec::new();
    let mut node_infos = Vec::new();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let medium = Arc::new(RadioMedium::new(model.medium().clone()));
    entities.register(Box::new(MediumEntity::new(MEDIUM_ENTITY_ID, medium.clone())));

    let mut next_entity_id: u64 = 1;
    let mut ids: BTreeMap<&str, (EntityId, EntityId)> = BTreeMap::new();
    for name in model.nodes().keys() {
        let radio_id = EntityId::new(next_entity_id);
        let host_id = EntityId::new(next_entity_id + 1);
        next_entity_id += 2;
        ids.insert(name.as_str(), (radio_id, host_id));
    }

    // Schedule per host before creating hosts, so each gets its own table
    let mut schedules: BTreeMap<&str, Vec<(SimTime, ScheduledTx)>> = BTreeMap::new();
    for entry in model.traffic() {
        let sender = model
            .find_node(&entry.from)
            .ok_or_else(|| ModelError::NodeNotFound(entry.from.clone()))?;
        let destination = if entry.to == BROADCAST_DESTINATION {
            MacAddress::BROADCAST
        } else {
            model
                .find_node(&entry.to)
                .map(|n| n.address)
                .ok_or_else(|| ModelError::NodeNotFound(entry.to.clone()))?
        };
        for i in 0..entry.count {
            let jitter = if entry.jitter_s > 0.0 {
                rng.gen_range(0.0..=entry.jitter_s)
            } else {
                0.0
            };
            let at = SimTime::from_secs(entry.at_s + entry.interval_s * i as f64 + jitter);
            schedules.entry(sender.name.as_str()).or_default().push((
                at,
                ScheduledTx {
                    destination,
                    payload_len: entry.payload_len,
                    params: sender.radio.clone(),
                },
            ));
        }
    }

    let error_model: Option<Arc<dyn lrsim_phy::ErrorModel>> = match model.error_model() {
        ErrorModelKind::None => None,
        ErrorModelKind::SnrThreshold => Some(Arc::new(SnrThresholdErrorModel::default())),
    };

    let mut event_id_counter: u64 = 0;
    for (name, node) in model.nodes() {
        let (radio_id, host_id) = ids[name.as_str()];
        let label = node.role.policy().label;
        let metric_labels = MetricLabels::new(node.name.clone(), label).with_groups(node.groups.clone());

        medium.add_radio(radio_id, node.position);

        let mut receiver = Receiver::new(node.role, node.address, model.phy());
        if let Some(error_model) = &error_model {
            receiver = receiver.with_error_model(error_model.clone());
        }
        let radio = Radio::new(
            radio_id,
            node.address,
            model.phy().clone(),
            receiver,
            medium.clone(),
            MEDIUM_ENTITY_ID,
            host_id,
            metric_labels.clone(),
        );
        entities.register(Box::new(radio));

        let mut schedule = schedules.remove(name.as_str()).unwrap_or_default();
        schedule.sort_by_key(|(at, _)| *at);
        for (index, (at, _)) in schedule.iter().enumerate() {
            initial_events.push(Event {
                id: EventId(event_id_counter),
                time: *at,
                source: host_id,
                targets: vec![host_id],
                payload: EventPayload::Timer {
                    timer_id: index as u64,
                },
            });
            event_id_counter += 1;
        }
        debug!(
            node = %node.name,
            radio = radio_id.0,
            host = host_id.0,
            address = %node.address,
            frames = schedule.len(),
            "built node"
        );

        let host = Host::new(
            host_id,
            radio_id,
            node.address,
            schedule.into_iter().map(|(_, tx)| tx).collect(),
            metric_labels,
        );
        entities.register(Box::new(host));

        node_infos.push(NodeInfo {
            name: node.name.clone(),
            role: label.to_string(),
            address: node.address,
            radio_entity_id: radio_id.0,
            host_entity_id: host_id.0,
            position: node.position,
        });
    }

    Ok(BuiltSimulation {
        entities,
        medium,
        initial_events,
        node_infos,
    })
}
