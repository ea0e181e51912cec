//! Radio medium: propagation, interference and noise.
//!
//! [`RadioMedium`] holds the in-flight transmissions and derives a
//! [`Reception`] per receiving radio. Radios query it read-only through the
//! [`Medium`] trait; [`MediumEntity`] is the simulation entity that feeds it
//! and fans signals out to receivers.

use crate::tables::{dbm_to_mw, mw_to_dbm};
use lrsim_common::{
    Entity, EntityId, Event, EventPayload, Position, Reception, Signal, SignalArrivalEvent,
    SignalId, SimContext, SimError, SimTime, SnirInd,
};
use parking_lot::RwLock;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Speed of light in m/s.
const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

// ============================================================================
// Medium Query Interface
// ============================================================================

/// Aggregate noise and interference power over a time window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Noise {
    /// Minimum power over the window in mW.
    pub min_power_mw: f64,
    /// Maximum power over the window in mW.
    pub max_power_mw: f64,
}

impl Noise {
    /// Minimum power in dBm.
    pub fn min_power_dbm(&self) -> f64 {
        mw_to_dbm(self.min_power_mw)
    }

    /// Maximum power in dBm.
    pub fn max_power_dbm(&self) -> f64 {
        mw_to_dbm(self.max_power_mw)
    }
}

/// Read-only view of the medium used by receivers.
pub trait Medium: Send + Sync {
    /// Receptions at `receiver` of other signals whose window intersects `reception`.
    fn interfering_receptions(&self, receiver: EntityId, reception: &Reception) -> Vec<Reception>;

    /// Background noise plus all receptions at `receiver` over `[start, end)`,
    /// optionally leaving one signal out.
    fn compute_noise(
        &self,
        receiver: EntityId,
        start: SimTime,
        end: SimTime,
        exclude: Option<SignalId>,
    ) -> Noise;

    /// SNIR range of `reception` over its window.
    fn compute_snir(&self, receiver: EntityId, reception: &Reception) -> SnirInd {
        let noise = self.compute_noise(
            receiver,
            reception.start_time(),
            reception.end_time(),
            Some(reception.signal_id),
        );
        let signal_mw = dbm_to_mw(reception.power_dbm);
        SnirInd {
            min_db: mw_to_dbm(signal_mw / noise.max_power_mw),
            max_db: mw_to_dbm(signal_mw / noise.min_power_mw),
        }
    }

    /// Whether a transmission is still registered (not invalidated).
    fn contains_transmission(&self, signal_id: SignalId) -> bool;
}

// ============================================================================
// Path Loss
// ============================================================================

/// Log-distance path loss with optional log-normal shadowing.
///
/// `PL(d) = PL(d0) + 10 * n * log10(d / d0) + X_sigma`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLossModel {
    /// Path loss exponent `n`.
    pub path_loss_exponent: f64,
    /// Loss at the reference distance in dB.
    pub reference_loss_db: f64,
    /// Reference distance `d0` in meters.
    pub reference_distance_m: f64,
    /// Standard deviation of shadowing in dB. Zero disables shadowing.
    pub shadowing_sigma_db: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        PathLossModel {
            path_loss_exponent: 2.7,
            reference_loss_db: 40.0,
            reference_distance_m: 1.0,
            shadowing_sigma_db: 0.0,
        }
    }
}

impl PathLossModel {
    /// Deterministic mean path loss at `distance_m`.
    pub fn mean_path_loss_db(&self, distance_m: f64) -> f64 {
        let d = distance_m.max(self.reference_distance_m);
        self.reference_loss_db + 10.0 * self.path_loss_exponent * (d / self.reference_distance_m).log10()
    }

    /// Path loss at `distance_m` with a shadowing sample drawn from `rng`.
    pub fn path_loss_db<R: Rng + ?Sized>(&self, distance_m: f64, rng: &mut R) -> f64 {
        let mean = self.mean_path_loss_db(distance_m);
        if self.shadowing_sigma_db <= 0.0 {
            return mean;
        }
        match Normal::new(0.0, self.shadowing_sigma_db) {
            Ok(normal) => mean + normal.sample(rng),
            Err(_) => mean,
        }
    }
}

/// Medium configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    /// Propagation loss model.
    #[serde(flatten)]
    pub path_loss: PathLossModel,
    /// Constant background noise power in dBm.
    pub background_noise_dbm: f64,
}

impl Default for MediumConfig {
    fn default() -> Self {
        MediumConfig {
            path_loss: PathLossModel::default(),
            background_noise_dbm: -120.0,
        }
    }
}

// ============================================================================
// Radio Medium
// ============================================================================

/// A registered transmission and its receptions, keyed by receiver.
#[derive(Debug)]
struct Transmission {
    signal: Arc<Signal>,
    receptions: BTreeMap<EntityId, Reception>,
}

impl Transmission {
    /// Latest trailing edge over all receivers.
    fn last_end(&self) -> SimTime {
        self.receptions
            .values()
            .map(|r| r.end_time())
            .max()
            .unwrap_or_else(|| self.signal.end_time())
    }
}

#[derive(Debug, Default)]
struct MediumState {
    /// BTreeMaps keep fan-out order deterministic.
    radios: BTreeMap<EntityId, Position>,
    transmissions: BTreeMap<SignalId, Transmission>,
    longest_signal: SimTime,
}

/// Shared radio medium.
#[derive(Debug)]
pub struct RadioMedium {
    config: MediumConfig,
    state: RwLock<MediumState>,
}

impl RadioMedium {
    /// Create an empty medium.
    pub fn new(config: MediumConfig) -> Self {
        RadioMedium {
            config,
            state: RwLock::new(MediumState::default()),
        }
    }

    /// Medium configuration.
    pub fn config(&self) -> &MediumConfig {
        &self.config
    }

    /// Attach a radio at a fixed position.
    pub fn add_radio(&self, radio: EntityId, position: Position) {
        self.state.write().radios.insert(radio, position);
    }

    /// Position of an attached radio.
    pub fn radio_position(&self, radio: EntityId) -> Option<Position> {
        self.state.read().radios.get(&radio).copied()
    }

    /// Number of transmissions currently held.
    pub fn transmission_count(&self) -> usize {
        self.state.read().transmissions.len()
    }

    /// Reception of `signal_id` at `receiver`, if registered.
    pub fn reception(&self, signal_id: SignalId, receiver: EntityId) -> Option<Reception> {
        self.state
            .read()
            .transmissions
            .get(&signal_id)
            .and_then(|t| t.receptions.get(&receiver).cloned())
    }

    /// Register a transmission and derive its reception at every other radio.
    ///
    /// Returns the receptions ordered by receiver id.
    pub fn register_transmission<R: Rng + ?Sized>(&self, signal: Arc<Signal>, rng: &mut R) -> Vec<Reception> {
        let mut state = self.state.write();
        let Some(tx_position) = state.radios.get(&signal.transmitter).copied() else {
            debug!(signal = %signal.id, "transmitter not attached to medium, signal not propagated");
            return Vec::new();
        };

        let mut receptions = BTreeMap::new();
        for (&receiver, position) in state.radios.iter() {
            if receiver == signal.transmitter {
                continue;
            }
            let distance = tx_position.distance_to(position);
            let delay = SimTime::from_micros_f64(distance / SPEED_OF_LIGHT_M_S * 1_000_000.0);
            let path_loss = self.config.path_loss.path_loss_db(distance, rng);
            let reception = Reception {
                signal_id: signal.id,
                transmitter: signal.transmitter,
                receiver,
                timing: signal.timing.shifted(delay),
                power_dbm: signal.params.tx_power_dbm - path_loss,
                center_frequency_hz: signal.params.center_frequency_hz,
                bandwidth_hz: signal.params.bandwidth_hz,
                spreading_factor: signal.params.spreading_factor,
                destination: signal.frame.destination,
            };
            trace!(
                signal = %signal.id,
                receiver = receiver.0,
                distance_m = distance,
                power_dbm = reception.power_dbm,
                "derived reception"
            );
            receptions.insert(receiver, reception);
        }

        let duration = signal.timing.duration();
        if duration > state.longest_signal {
            state.longest_signal = duration;
        }
        let ordered: Vec<Reception> = receptions.values().cloned().collect();
        state.transmissions.insert(signal.id, Transmission { signal, receptions });
        ordered
    }

    /// Remove a transmission. Returns the radios that held a reception of it.
    pub fn invalidate_transmission(&self, signal_id: SignalId) -> Option<Vec<EntityId>> {
        self.state
            .write()
            .transmissions
            .remove(&signal_id)
            .map(|t| t.receptions.into_keys().collect())
    }

    /// Drop transmissions that can no longer overlap any live reception.
    pub fn purge(&self, now: SimTime) {
        let mut state = self.state.write();
        let horizon = now - state.longest_signal;
        let before = state.transmissions.len();
        state.transmissions.retain(|_, t| t.last_end() >= horizon);
        let purged = before - state.transmissions.len();
        if purged > 0 {
            trace!(purged, "purged old transmissions");
        }
    }
}

impl Medium for RadioMedium {
    fn interfering_receptions(&self, receiver: EntityId, reception: &Reception) -> Vec<Reception> {
        let state = self.state.read();
        state
            .transmissions
            .iter()
            .filter(|(id, _)| **id != reception.signal_id)
            .filter_map(|(_, t)| t.receptions.get(&receiver))
            .filter(|other| {
                other.start_time() < reception.end_time() && other.end_time() > reception.start_time()
            })
            .cloned()
            .collect()
    }

    fn compute_noise(
        &self,
        receiver: EntityId,
        start: SimTime,
        end: SimTime,
        exclude: Option<SignalId>,
    ) -> Noise {
        let background_mw = dbm_to_mw(self.config.background_noise_dbm);
        let state = self.state.read();
        let active: Vec<&Reception> = state
            .transmissions
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .filter_map(|(_, t)| t.receptions.get(&receiver))
            .filter(|r| r.start_time() < end && r.end_time() > start)
            .collect();

        // Power is piecewise constant between reception edges
        let mut change_points = vec![start];
        for r in &active {
            for edge in [r.start_time(), r.end_time()] {
                if edge > start && edge < end {
                    change_points.push(edge);
                }
            }
        }
        change_points.sort_unstable();
        change_points.dedup();

        let mut min_power_mw = f64::INFINITY;
        let mut max_power_mw = f64::NEG_INFINITY;
        for t in change_points {
            let power = background_mw
                + active
                    .iter()
                    .filter(|r| r.start_time() <= t && t < r.end_time())
                    .map(|r| dbm_to_mw(r.power_dbm))
                    .sum::<f64>();
            min_power_mw = min_power_mw.min(power);
            max_power_mw = max_power_mw.max(power);
        }
        Noise {
            min_power_mw,
            max_power_mw,
        }
    }

    fn contains_transmission(&self, signal_id: SignalId) -> bool {
        self.state.read().transmissions.contains_key(&signal_id)
    }
}

// ============================================================================
// Medium Entity - fans transmissions out to receivers
// ============================================================================

/// The medium entity receives `TransmitAir` events from radios, registers
/// them with the [`RadioMedium`] and schedules a `SignalArrival` at each
/// receiver when the leading edge reaches it.
pub struct MediumEntity {
    id: EntityId,
    medium: Arc<RadioMedium>,
}

impl MediumEntity {
    /// Create a medium entity over a shared medium.
    pub fn new(id: EntityId, medium: Arc<RadioMedium>) -> Self {
        MediumEntity { id, medium }
    }

    /// The shared medium.
    pub fn medium(&self) -> &Arc<RadioMedium> {
        &self.medium
    }
}

impl Entity for MediumEntity {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx_event) => {
                self.medium.purge(ctx.time());
                let receptions = self
                    .medium
                    .register_transmission(tx_event.signal.clone(), ctx.rng());
                for reception in receptions {
                    ctx.post_at(
                        reception.start_time(),
                        vec![reception.receiver],
                        EventPayload::SignalArrival(SignalArrivalEvent {
                            signal: tx_event.signal.clone(),
                            reception,
                        }),
                    );
                }
            }
            EventPayload::InvalidateTransmission { signal_id } => {
                if let Some(receivers) = self.medium.invalidate_transmission(*signal_id) {
                    debug!(signal = %signal_id, receivers = receivers.len(), "transmission invalidated");
                    if !receivers.is_empty() {
                        ctx.post_immediate(
                            receivers,
                            EventPayload::ReceptionAborted {
                                signal_id: *signal_id,
                            },
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
