//! Radio entity: the per-endpoint signal timing state machine.
//!
//! A radio owns at most one outgoing transmission and a fixed-size arena of
//! in-flight receptions. At most one reception in the arena is *tracked*
//! (being decoded); the others only run their boundary timers. Part
//! boundaries are driven by `Timer` events whose ids encode the arena slot,
//! the slot generation and the signal part, so timers of released slots are
//! recognised as stale and ignored.

use crate::decision::{ReceptionDecision, Receiver};
use crate::error::PhyError;
use crate::medium::Medium;
use crate::timing::signal_timing;
use crate::PhyConfig;
use lrsim_common::{
    DecodedFrame, Entity, EntityId, Event, EventPayload, MacAddress, NotificationKind,
    PhyNotification, Reception, Signal, SignalArrivalEvent, SignalId, SignalKind, SignalPart,
    SimContext, SimError, TransmitAirEvent, TxRequest,
};
use lrsim_metrics::{metric_defs, metrics, MetricLabels};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Timer Encoding
// ============================================================================

/// Transmission boundary timers: base plus part code.
const TIMER_TX_BASE: u64 = 0x10;
/// Reception boundary timers: base plus `generation << 12 | slot << 4 | part code`.
const TIMER_RX_BASE: u64 = 0x1_0000;

const PART_BITS: u64 = 4;
const SLOT_BITS: u64 = 8;

/// A decoded radio timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadioTimer {
    Transmission(SignalPart),
    Reception {
        slot: usize,
        generation: u64,
        part: SignalPart,
    },
}

fn tx_timer_id(part: SignalPart) -> u64 {
    TIMER_TX_BASE + part.code() as u64
}

fn rx_timer_id(slot: usize, generation: u64, part: SignalPart) -> u64 {
    TIMER_RX_BASE + (generation << (SLOT_BITS + PART_BITS)) + ((slot as u64) << PART_BITS) + part.code() as u64
}

fn decode_part(code: u64) -> Result<SignalPart, PhyError> {
    let code = code as u8;
    SignalPart::from_code(code).ok_or(PhyError::UnknownSignalPart(code))
}

/// Decode a timer id. Ids outside the radio's ranges yield `None`.
fn decode_timer(timer_id: u64) -> Result<Option<RadioTimer>, PhyError> {
    if timer_id >= TIMER_RX_BASE {
        let raw = timer_id - TIMER_RX_BASE;
        let part = decode_part(raw & ((1 << PART_BITS) - 1))?;
        let slot = ((raw >> PART_BITS) & ((1 << SLOT_BITS) - 1)) as usize;
        let generation = raw >> (SLOT_BITS + PART_BITS);
        Ok(Some(RadioTimer::Reception {
            slot,
            generation,
            part,
        }))
    } else if (TIMER_TX_BASE..TIMER_TX_BASE + (1 << PART_BITS)).contains(&timer_id) {
        Ok(Some(RadioTimer::Transmission(decode_part(timer_id - TIMER_TX_BASE)?)))
    } else {
        Ok(None)
    }
}

// ============================================================================
// Reception Arena
// ============================================================================

/// A reception in flight at the radio.
#[derive(Debug, Clone)]
struct InFlight {
    signal: Arc<Signal>,
    reception: Reception,
    /// Part whose end boundary is scheduled next.
    part: SignalPart,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    entry: Option<InFlight>,
}

/// Fixed-capacity set of in-flight receptions with generation-checked slots.
#[derive(Debug)]
struct ReceptionArena {
    slots: Vec<Slot>,
}

impl ReceptionArena {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, PhyConfig::MAX_CONCURRENT_RECEPTIONS);
        ReceptionArena {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
        }
    }

    /// Insert into a free slot, returning `(slot, generation)`.
    fn insert(&mut self, entry: InFlight) -> Option<(usize, u64)> {
        let index = self.slots.iter().position(|s| s.entry.is_none())?;
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.entry = Some(entry);
        Some((index, slot.generation))
    }

    fn get_mut(&mut self, index: usize, generation: u64) -> Option<&mut InFlight> {
        self.slots
            .get_mut(index)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.entry.as_mut())
    }

    fn get(&self, index: usize) -> Option<&InFlight> {
        self.slots.get(index).and_then(|s| s.entry.as_ref())
    }

    fn remove(&mut self, index: usize) -> Option<InFlight> {
        self.slots.get_mut(index).and_then(|s| s.entry.take())
    }

    fn find(&self, signal_id: SignalId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.entry.as_ref().is_some_and(|e| e.signal.id == signal_id))
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}

// ============================================================================
// Radio Entity
// ============================================================================

/// Observable mode of a radio endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "part", rename_all = "snake_case")]
pub enum RadioState {
    /// Neither transmitting nor tracking a reception.
    Idle,
    /// Transmitting the given part.
    Transmitting(SignalPart),
    /// Tracking a reception currently in the given part.
    Receiving(SignalPart),
}

/// Counters kept by a radio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RadioStats {
    /// Signals transmitted.
    pub tx_signals: u64,
    /// Arrivals seen.
    pub rx_arrivals: u64,
    /// Arrivals that became the tracked reception.
    pub rx_tracked: u64,
    /// Frames delivered upward.
    pub rx_frames: u64,
    /// Tracked receptions abandoned at a boundary.
    pub rx_failed: u64,
    /// Tracked receptions aborted by invalidation or a transmission.
    pub rx_aborted: u64,
    /// Arrivals dropped because the arena was full.
    pub rx_dropped: u64,
}

/// An outgoing transmission.
#[derive(Debug, Clone)]
struct ActiveTransmission {
    signal: Arc<Signal>,
    part: SignalPart,
}

/// LoRa radio entity.
///
/// The radio is responsible for:
/// 1. Transmission - builds the [`Signal`], sends `TransmitAir` to the medium
///    entity and walks its part boundaries
/// 2. Reception tracking - records arrivals in the arena and tracks the first
///    one that is detectable and collision-free
/// 3. Decisions - asks its [`Receiver`] at every boundary whether to continue
/// 4. Delivery - sends decoded frames and notifications to its host
pub struct Radio {
    id: EntityId,
    address: MacAddress,
    config: PhyConfig,
    medium: Arc<dyn Medium>,
    medium_entity: EntityId,
    host: EntityId,
    receiver: Receiver,

    transmission: Option<ActiveTransmission>,
    next_signal_seq: u64,

    arena: ReceptionArena,
    /// Arena slot of the tracked reception.
    tracked: Option<usize>,

    stats: RadioStats,
    metric_labels: MetricLabels,
}

impl Radio {
    /// Create a new radio entity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: EntityId,
        address: MacAddress,
        config: PhyConfig,
        receiver: Receiver,
        medium: Arc<dyn Medium>,
        medium_entity: EntityId,
        host: EntityId,
        metric_labels: MetricLabels,
    ) -> Self {
        let arena = ReceptionArena::with_capacity(config.max_concurrent_receptions);
        Radio {
            id,
            address,
            config,
            medium,
            medium_entity,
            host,
            receiver,
            transmission: None,
            next_signal_seq: 0,
            arena,
            tracked: None,
            stats: RadioStats::default(),
            metric_labels,
        }
    }

    /// Local MAC address.
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// PHY configuration.
    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// Current mode, derived from the transmission and the tracked slot.
    pub fn state(&self) -> RadioState {
        if let Some(tx) = &self.transmission {
            return RadioState::Transmitting(tx.part);
        }
        match self.tracked.and_then(|slot| self.arena.get(slot)) {
            Some(entry) => RadioState::Receiving(entry.part),
            None => RadioState::Idle,
        }
    }

    /// Whether a transmission is in progress.
    pub fn is_transmitting(&self) -> bool {
        self.transmission.is_some()
    }

    /// Signal of the tracked reception, if any.
    pub fn tracked_signal(&self) -> Option<SignalId> {
        self.tracked
            .and_then(|slot| self.arena.get(slot))
            .map(|entry| entry.signal.id)
    }

    /// Number of receptions in flight.
    pub fn active_receptions(&self) -> usize {
        self.arena.len()
    }

    /// Radio counters.
    pub fn stats(&self) -> &RadioStats {
        &self.stats
    }

    /// Decision engine, including its counters.
    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Get the metric labels for this radio.
    pub fn metric_labels(&self) -> &MetricLabels {
        &self.metric_labels
    }

    fn notify(&self, ctx: &mut SimContext, signal_id: SignalId, kind: NotificationKind) {
        ctx.post_immediate(
            vec![self.host],
            EventPayload::Phy(PhyNotification {
                radio: self.id,
                signal_id,
                time: ctx.time(),
                kind,
            }),
        );
    }

    fn part_labels(&self, part: SignalPart) -> Vec<(&'static str, String)> {
        let mut labels = self.metric_labels.to_labels();
        labels.push(("part", part.as_label().to_string()));
        labels
    }

    // ------------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------------

    /// Handle a TX request from the upper layer.
    fn handle_tx_request(&mut self, request: &TxRequest, ctx: &mut SimContext) -> Result<(), PhyError> {
        if let Some(tx) = &self.transmission {
            return Err(PhyError::TransmitWhileBusy(tx.signal.id));
        }

        // Half-duplex: going on air abandons the tracked reception
        if let Some(slot) = self.tracked.take() {
            if let Some(entry) = self.arena.get(slot) {
                let signal_id = entry.signal.id;
                info!(radio = self.id.0, signal = %signal_id, "reception abandoned for transmission");
                self.stats.rx_aborted += 1;
                metrics::counter!(metric_defs::RADIO_RX_ABORTED.name, &self.metric_labels.to_labels()).increment(1);
                self.notify(ctx, signal_id, NotificationKind::ReceptionAborted);
            }
        }

        let kind = if self.config.separate_parts {
            SignalKind::Separated
        } else {
            SignalKind::Whole
        };
        let timing = signal_timing(
            &request.params,
            request.frame.payload.len(),
            self.config.preamble_symbols,
            ctx.time(),
        );
        let signal = Arc::new(Signal {
            id: SignalId((self.id.0 << 32) | self.next_signal_seq),
            transmitter: self.id,
            kind,
            timing,
            params: request.params.clone(),
            frame: request.frame.clone(),
        });
        self.next_signal_seq += 1;

        let part = kind.first_part();
        self.transmission = Some(ActiveTransmission {
            signal: signal.clone(),
            part,
        });
        self.stats.tx_signals += 1;

        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::RADIO_TX_SIGNALS.name, &labels).increment(1);
        metrics::counter!(metric_defs::RADIO_TX_AIRTIME.name, &labels).increment(timing.duration().as_micros());

        info!(
            radio = self.id.0,
            signal = %signal.id,
            %part,
            end = %timing.end,
            "transmission started"
        );

        ctx.post_immediate(
            vec![self.medium_entity],
            EventPayload::TransmitAir(TransmitAirEvent {
                radio_id: self.id,
                signal: signal.clone(),
            }),
        );
        ctx.post_at(
            timing.end_of(part),
            vec![self.id],
            EventPayload::Timer {
                timer_id: tx_timer_id(part),
            },
        );
        self.notify(ctx, signal.id, NotificationKind::TransmissionStarted);
        Ok(())
    }

    /// Handle a transmission part boundary.
    fn handle_tx_boundary(&mut self, part: SignalPart, ctx: &mut SimContext) {
        let Some(tx) = self.transmission.as_mut() else {
            trace!(radio = self.id.0, %part, "stale transmission timer");
            return;
        };
        if tx.part != part {
            trace!(radio = self.id.0, %part, "stale transmission timer");
            return;
        }

        match part.next() {
            Some(next) => {
                trace!(radio = self.id.0, signal = %tx.signal.id, from = %part, to = %next, "transmission part");
                tx.part = next;
                let end = tx.signal.timing.end_of(next);
                ctx.post_at(
                    end,
                    vec![self.id],
                    EventPayload::Timer {
                        timer_id: tx_timer_id(next),
                    },
                );
            }
            None => {
                let signal_id = tx.signal.id;
                self.transmission = None;
                info!(radio = self.id.0, signal = %signal_id, "transmission ended");
                self.notify(ctx, signal_id, NotificationKind::TransmissionEnded);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------------

    fn first_reception_part(&self) -> SignalPart {
        if self.config.separate_parts {
            SignalPart::Preamble
        } else {
            SignalPart::Whole
        }
    }

    /// Run the decision chain for one part and record its side effects.
    fn evaluate(&mut self, reception: &Reception, part: SignalPart, ctx: &mut SimContext) -> ReceptionDecision {
        let interference = self.medium.interfering_receptions(self.id, reception);
        let decision = self
            .receiver
            .compute_reception_decision(reception, part, &interference);

        if !decision.possible {
            metrics::counter!(metric_defs::RADIO_RX_BELOW_SENSITIVITY.name, &self.part_labels(part)).increment(1);
        }
        if let Some(collision) = decision.collision {
            if collision.counted {
                metrics::counter!(metric_defs::RADIO_RX_COLLIDED.name, &self.part_labels(part)).increment(1);
            }
            if collision.data_collision {
                metrics::counter!(metric_defs::RADIO_RX_DATA_COLLISIONS.name, &self.metric_labels.to_labels())
                    .increment(1);
            }
            if collision.counted || collision.data_collision {
                self.notify(
                    ctx,
                    reception.signal_id,
                    NotificationKind::CollisionDetected {
                        interferer: collision.interferer,
                        counted: collision.counted,
                        data_part: collision.data_collision,
                    },
                );
            }
        }
        decision
    }

    /// Handle a signal whose leading edge reaches this radio.
    fn handle_arrival(&mut self, arrival: &SignalArrivalEvent, ctx: &mut SimContext) {
        let reception = &arrival.reception;
        if !self.medium.contains_transmission(reception.signal_id) {
            debug!(radio = self.id.0, signal = %reception.signal_id, "arrival of invalidated transmission ignored");
            return;
        }
        self.stats.rx_arrivals += 1;

        let part = self.first_reception_part();
        let entry = InFlight {
            signal: arrival.signal.clone(),
            reception: reception.clone(),
            part,
        };
        let Some((slot, generation)) = self.arena.insert(entry) else {
            warn!(
                radio = self.id.0,
                signal = %reception.signal_id,
                capacity = self.config.max_concurrent_receptions,
                "too many receptions in flight, arrival dropped"
            );
            self.stats.rx_dropped += 1;
            metrics::counter!(metric_defs::RADIO_RX_DROPPED.name, &self.metric_labels.to_labels()).increment(1);
            return;
        };
        metrics::gauge!(metric_defs::RADIO_ACTIVE_RECEPTIONS.name, &self.metric_labels.to_labels()).increment(1.0);

        let mut tracked = false;
        if self.transmission.is_some() {
            debug!(radio = self.id.0, signal = %reception.signal_id, "arrival while transmitting, not tracked");
        } else if reception.start_time() == ctx.time() && self.tracked.is_none() {
            let noise = self
                .medium
                .compute_noise(self.id, reception.start_time(), reception.end_time(), None);
            if self.receiver.compute_listening_decision(&noise) {
                let decision = self.evaluate(reception, part, ctx);
                if decision.attempted {
                    self.tracked = Some(slot);
                    self.stats.rx_tracked += 1;
                    tracked = true;
                }
            } else {
                metrics::counter!(
                    metric_defs::RADIO_RX_LISTENING_IMPOSSIBLE.name,
                    &self.metric_labels.to_labels()
                )
                .increment(1);
            }
        }

        info!(
            radio = self.id.0,
            signal = %reception.signal_id,
            power_dbm = reception.power_dbm,
            tracked,
            "reception started"
        );
        self.notify(ctx, reception.signal_id, NotificationKind::ReceptionStarted { tracked });
        ctx.post_at(
            reception.timing.end_of(part),
            vec![self.id],
            EventPayload::Timer {
                timer_id: rx_timer_id(slot, generation, part),
            },
        );
    }

    /// Release the tracked reception after a failed boundary evaluation.
    fn release_failed(&mut self, signal_id: SignalId, part: SignalPart, ctx: &mut SimContext) {
        self.tracked = None;
        self.stats.rx_failed += 1;
        info!(radio = self.id.0, signal = %signal_id, %part, "reception ended unsuccessfully");
        self.notify(ctx, signal_id, NotificationKind::ReceptionEnded { successful: false });
    }

    /// Handle a reception part boundary.
    fn handle_rx_boundary(
        &mut self,
        slot: usize,
        generation: u64,
        part: SignalPart,
        ctx: &mut SimContext,
    ) -> Result<(), PhyError> {
        let Some(entry) = self.arena.get_mut(slot, generation) else {
            trace!(radio = self.id.0, slot, generation, "stale reception timer");
            return Ok(());
        };
        if entry.part != part {
            trace!(radio = self.id.0, slot, %part, "stale reception timer");
            return Ok(());
        }
        let signal = entry.signal.clone();
        let reception = entry.reception.clone();
        let is_tracked = self.tracked == Some(slot) && self.transmission.is_none();

        match part.next() {
            Some(next) => {
                if is_tracked {
                    let decision = self.evaluate(&reception, part, ctx);
                    if !decision.successful {
                        self.release_failed(signal.id, part, ctx);
                    } else if !self.evaluate(&reception, next, ctx).attempted {
                        self.release_failed(signal.id, next, ctx);
                    } else {
                        trace!(radio = self.id.0, signal = %signal.id, from = %part, to = %next, "reception part");
                    }
                }
                if let Some(entry) = self.arena.get_mut(slot, generation) {
                    entry.part = next;
                }
                ctx.post_at(
                    reception.timing.end_of(next),
                    vec![self.id],
                    EventPayload::Timer {
                        timer_id: rx_timer_id(slot, generation, next),
                    },
                );
            }
            None => {
                if is_tracked {
                    let decision = self.evaluate(&reception, part, ctx);
                    if decision.successful {
                        let snir = self.medium.compute_snir(self.id, &reception);
                        let decoded = self.receiver.compute_reception_result(&signal, &reception, snir);
                        self.send_up(decoded, part, ctx)?;
                        self.stats.rx_frames += 1;
                        info!(radio = self.id.0, signal = %signal.id, "reception ended successfully");
                        self.notify(ctx, signal.id, NotificationKind::ReceptionEnded { successful: true });
                        self.tracked = None;
                    } else {
                        self.release_failed(signal.id, part, ctx);
                    }
                } else {
                    trace!(radio = self.id.0, signal = %signal.id, "untracked reception ended");
                }
                self.arena.remove(slot);
                metrics::gauge!(metric_defs::RADIO_ACTIVE_RECEPTIONS.name, &self.metric_labels.to_labels())
                    .decrement(1.0);
            }
        }
        Ok(())
    }

    /// Deliver a decoded frame upward. Frames must carry power and SNIR tags.
    fn send_up(&self, decoded: DecodedFrame, part: SignalPart, ctx: &mut SimContext) -> Result<(), PhyError> {
        let power = decoded
            .tags
            .signal_power
            .ok_or(PhyError::MissingTag("signal power"))?;
        let snir = decoded.tags.snir.ok_or(PhyError::MissingTag("SNIR"))?;

        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::RADIO_RX_FRAMES.name, &self.part_labels(part)).increment(1);
        metrics::histogram!(metric_defs::RADIO_RX_SNIR_MIN.name, &labels).record(snir.min_db);
        metrics::histogram!(metric_defs::RADIO_RX_POWER.name, &labels).record(power.power_dbm);

        debug!(
            radio = self.id.0,
            signal = %decoded.signal_id,
            power_dbm = power.power_dbm,
            snir_min_db = snir.min_db,
            "sending up"
        );
        ctx.post_immediate(vec![self.host], EventPayload::RadioRxFrame(decoded));
        Ok(())
    }

    /// Handle invalidation of a transmission this radio may be receiving.
    fn handle_abort(&mut self, signal_id: SignalId, ctx: &mut SimContext) {
        let Some(slot) = self.arena.find(signal_id) else {
            return;
        };
        if self.tracked == Some(slot) {
            self.tracked = None;
            self.stats.rx_aborted += 1;
            metrics::counter!(metric_defs::RADIO_RX_ABORTED.name, &self.metric_labels.to_labels()).increment(1);
            info!(radio = self.id.0, signal = %signal_id, "reception aborted");
            self.notify(ctx, signal_id, NotificationKind::ReceptionAborted);
        }
        self.arena.remove(slot);
        metrics::gauge!(metric_defs::RADIO_ACTIVE_RECEPTIONS.name, &self.metric_labels.to_labels()).decrement(1.0);
    }

    fn handle_timer(&mut self, timer_id: u64, ctx: &mut SimContext) -> Result<(), PhyError> {
        match decode_timer(timer_id)? {
            Some(RadioTimer::Transmission(part)) => {
                self.handle_tx_boundary(part, ctx);
                Ok(())
            }
            Some(RadioTimer::Reception {
                slot,
                generation,
                part,
            }) => self.handle_rx_boundary(slot, generation, part, ctx),
            None => Ok(()),
        }
    }
}

impl Entity for Radio {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        let result = match &event.payload {
            EventPayload::RadioTxRequest(request) => self.handle_tx_request(request, ctx),
            EventPayload::SignalArrival(arrival) => {
                self.handle_arrival(arrival, ctx);
                Ok(())
            }
            EventPayload::ReceptionAborted { signal_id } => {
                self.handle_abort(*signal_id, ctx);
                Ok(())
            }
            EventPayload::Timer { timer_id } => self.handle_timer(*timer_id, ctx),
            _ => Ok(()),
        };
        result.map_err(|e| e.into_sim_error(self.id))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{ChannelAccess, EndpointRole};
    use crate::medium::{MediumConfig, MediumEntity, RadioMedium};
    use lrsim_common::{EntityRegistry, Frame, Position, SignalTiming, SimTime, TxParams};
    use std::collections::BinaryHeap;

    const MEDIUM: EntityId = EntityId(0);
    const HOST: EntityId = EntityId(100);

    /// Host stand-in that accepts every event.
    struct Sink;

    impl Entity for Sink {
        fn entity_id(&self) -> EntityId {
            HOST
        }

        fn handle_event(&mut self, _event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Bench {
        registry: EntityRegistry,
        ctx: SimContext,
        queue: BinaryHeap<Event>,
        log: Vec<Event>,
    }

    impl Bench {
        /// Radios as (entity id, position); radio `n` has MAC address `n`.
        fn new(config: PhyConfig, radios: &[(u64, Position)]) -> Self {
            let medium = Arc::new(RadioMedium::new(MediumConfig::default()));
            let mut registry = EntityRegistry::new();
            registry.register(Box::new(MediumEntity::new(MEDIUM, medium.clone())));
            registry.register(Box::new(Sink));
            for (id, position) in radios {
                let id = EntityId(*id);
                medium.add_radio(id, *position);
                let receiver = Receiver::new(EndpointRole::Relay, MacAddress(id.0), &config);
                registry.register(Box::new(Radio::new(
                    id,
                    MacAddress(id.0),
                    config.clone(),
                    receiver,
                    medium.clone(),
                    MEDIUM,
                    HOST,
                    MetricLabels::new(format!("radio_{}", id.0), "relay"),
                )));
            }
            Bench {
                registry,
                ctx: SimContext::new(7),
                queue: BinaryHeap::new(),
                log: Vec::new(),
            }
        }

        fn post(&mut self, at: SimTime, target: EntityId, payload: EventPayload) {
            self.ctx.post_at(at, vec![target], payload);
            self.queue.extend(self.ctx.take_pending_events());
        }

        fn send(&mut self, at: SimTime, from: u64, to: u64, power_dbm: f64, sf: u8) {
            let request = TxRequest {
                frame: Frame {
                    source: MacAddress(from),
                    destination: MacAddress(to),
                    payload: vec![0xAB; 20],
                },
                params: TxParams {
                    tx_power_dbm: power_dbm,
                    spreading_factor: sf,
                    ..TxParams::default()
                },
            };
            self.post(at, EntityId(from), EventPayload::RadioTxRequest(request));
        }

        fn step(&mut self, event: Event) -> Result<(), SimError> {
            self.ctx.set_time(event.time);
            self.registry.dispatch_event(&event, &mut self.ctx)?;
            self.queue.extend(self.ctx.take_pending_events());
            self.log.push(event);
            Ok(())
        }

        fn run(&mut self) -> Result<(), SimError> {
            while let Some(event) = self.queue.pop() {
                self.step(event)?;
            }
            Ok(())
        }

        /// Process every event due at or before `until`.
        fn run_until(&mut self, until: SimTime) -> Result<(), SimError> {
            while self.queue.peek().is_some_and(|e| e.time <= until) {
                if let Some(event) = self.queue.pop() {
                    self.step(event)?;
                }
            }
            Ok(())
        }

        fn radio(&self, id: u64) -> &Radio {
            self.registry.get_as::<Radio>(EntityId(id)).unwrap()
        }

        fn frames(&self) -> Vec<(SimTime, DecodedFrame)> {
            self.log
                .iter()
                .filter_map(|e| match &e.payload {
                    EventPayload::RadioRxFrame(frame) => Some((e.time, frame.clone())),
                    _ => None,
                })
                .collect()
        }

        fn notifications(&self, radio: u64) -> Vec<NotificationKind> {
            self.log
                .iter()
                .filter_map(|e| match &e.payload {
                    EventPayload::Phy(n) if n.radio == EntityId(radio) => Some(n.kind),
                    _ => None,
                })
                .collect()
        }
    }

    fn two_radios() -> Bench {
        Bench::new(
            PhyConfig::default(),
            &[(1, Position::new(0.0, 0.0)), (2, Position::new(1000.0, 0.0))],
        )
    }

    fn midpoint(timing: &SignalTiming, part: SignalPart) -> SimTime {
        let start = timing.start_of(part).as_micros();
        let end = timing.end_of(part).as_micros();
        SimTime::from_micros((start + end) / 2)
    }

    #[test]
    fn test_state_follows_part_boundaries() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        let timing = signal_timing(&TxParams::default(), 20, PhyConfig::DEFAULT_PREAMBLE_SYMBOLS, SimTime::ZERO);
        let signal_id = SignalId(1 << 32);

        for part in [SignalPart::Preamble, SignalPart::Header, SignalPart::Data] {
            bench.run_until(midpoint(&timing, part)).unwrap();
            assert_eq!(bench.radio(1).state(), RadioState::Transmitting(part), "{part}");
            assert_eq!(bench.radio(2).state(), RadioState::Receiving(part), "{part}");
            assert_eq!(bench.radio(2).tracked_signal(), Some(signal_id));
            assert_eq!(bench.radio(1).tracked_signal(), None);
        }

        bench.run().unwrap();
        assert_eq!(bench.radio(1).state(), RadioState::Idle);
        assert_eq!(bench.radio(2).state(), RadioState::Idle);
        assert_eq!(bench.radio(2).tracked_signal(), None);
    }

    #[test]
    fn test_whole_mode_state() {
        let config = PhyConfig {
            separate_parts: false,
            ..PhyConfig::default()
        };
        let mut bench = Bench::new(config, &[(1, Position::new(0.0, 0.0)), (2, Position::new(1000.0, 0.0))]);
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.run_until(SimTime::from_millis(10)).unwrap();
        assert_eq!(bench.radio(1).state(), RadioState::Transmitting(SignalPart::Whole));
        assert_eq!(bench.radio(2).state(), RadioState::Receiving(SignalPart::Whole));
    }

    #[test]
    fn test_state_returns_to_idle_after_abort() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.run_until(SimTime::from_millis(5)).unwrap();
        assert_eq!(bench.radio(2).state(), RadioState::Receiving(SignalPart::Preamble));

        let signal_id = SignalId(1 << 32);
        bench.post(
            SimTime::from_millis(6),
            MEDIUM,
            EventPayload::InvalidateTransmission { signal_id },
        );
        bench.run_until(SimTime::from_millis(7)).unwrap();
        let radio = bench.radio(2);
        assert_eq!(radio.state(), RadioState::Idle);
        assert_eq!(radio.tracked_signal(), None);
        assert_eq!(radio.active_receptions(), 0);
        assert_eq!(radio.stats().rx_aborted, 1);

        // Stale boundary timers of the released slot change nothing
        bench.run().unwrap();
        assert_eq!(bench.radio(2).state(), RadioState::Idle);
        assert!(bench.frames().iter().all(|(_, f)| f.receiver != EntityId(2)));
    }

    #[test]
    fn test_transmitting_replaces_receiving_state() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::from_millis(20), 2, 1, 14.0, 7);
        bench.run_until(SimTime::from_millis(19)).unwrap();
        assert!(matches!(bench.radio(2).state(), RadioState::Receiving(_)));

        bench.run_until(SimTime::from_millis(21)).unwrap();
        let radio = bench.radio(2);
        assert_eq!(radio.state(), RadioState::Transmitting(SignalPart::Preamble));
        assert!(radio.is_transmitting());
        assert_eq!(radio.tracked_signal(), None);
        // The abandoned arrival stays in flight until its trailing edge
        assert_eq!(radio.active_receptions(), 1);
    }

    #[test]
    fn test_timer_encoding() {
        let id = rx_timer_id(37, 9, SignalPart::Header);
        assert_eq!(
            decode_timer(id),
            Ok(Some(RadioTimer::Reception {
                slot: 37,
                generation: 9,
                part: SignalPart::Header
            }))
        );
        assert_eq!(
            decode_timer(tx_timer_id(SignalPart::Data)),
            Ok(Some(RadioTimer::Transmission(SignalPart::Data)))
        );
        assert_eq!(decode_timer(1), Ok(None));
        assert_eq!(decode_timer(TIMER_TX_BASE + 9), Err(PhyError::UnknownSignalPart(9)));
        assert_eq!(decode_timer(TIMER_RX_BASE + 0xF), Err(PhyError::UnknownSignalPart(15)));
    }

    #[test]
    fn test_arena_generations() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.run().unwrap();
        let radio = bench.radio(2);
        assert_eq!(radio.active_receptions(), 0);
        assert_eq!(radio.arena.slots[0].generation, 1);
    }

    #[test]
    fn test_clean_reception_decodes_at_end_time() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.run().unwrap();

        let frames = bench.frames();
        assert_eq!(frames.len(), 1);
        let (time, frame) = &frames[0];
        // Preamble, header and payload at SF7/125 kHz plus 3 us propagation
        assert_eq!(*time, SimTime::from_micros(12_544 + 43 * 1024 + 3));
        assert_eq!(frame.frame.destination, MacAddress(2));
        assert!((frame.tags.signal_power.unwrap().power_dbm + 107.0).abs() < 1e-9);

        let radio = bench.radio(2);
        assert_eq!(radio.stats().rx_frames, 1);
        assert_eq!(radio.state(), RadioState::Idle);
        assert_eq!(bench.radio(1).stats().tx_signals, 1);
        assert!(!bench.radio(1).is_transmitting());
        assert_eq!(
            bench.notifications(1),
            vec![NotificationKind::TransmissionStarted, NotificationKind::TransmissionEnded]
        );
    }

    #[test]
    fn test_whole_part_mode() {
        let config = PhyConfig {
            separate_parts: false,
            ..PhyConfig::default()
        };
        let mut bench = Bench::new(config, &[(1, Position::new(0.0, 0.0)), (2, Position::new(100.0, 0.0))]);
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.run().unwrap();
        assert_eq!(bench.frames().len(), 1);
    }

    #[test]
    fn test_below_sensitivity_not_tracked() {
        let mut bench = Bench::new(
            PhyConfig::default(),
            &[(1, Position::new(0.0, 0.0)), (2, Position::new(20_000.0, 0.0))],
        );
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.run().unwrap();
        assert!(bench.frames().is_empty());
        let radio = bench.radio(2);
        assert_eq!(radio.stats().rx_tracked, 0);
        assert_eq!(radio.receiver().stats().below_sensitivity, 1);
        assert_eq!(
            bench.notifications(2),
            vec![NotificationKind::ReceptionStarted { tracked: false }]
        );
    }

    #[test]
    fn test_transmit_while_busy_is_fatal() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::from_millis(10), 1, 2, 14.0, 7);
        let err = bench.run().unwrap_err();
        match err {
            SimError::HandlerError { entity, message } => {
                assert_eq!(entity, EntityId(1));
                assert!(message.contains("while transmitting"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_transmit_after_previous_ended() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::from_millis(100), 1, 2, 14.0, 7);
        bench.run().unwrap();
        assert_eq!(bench.frames().len(), 2);
        assert_ne!(bench.frames()[0].1.signal_id, bench.frames()[1].1.signal_id);
    }

    #[test]
    fn test_first_detected_first_tracked() {
        // Radio 3 is much closer to 2 and its signal starts later: it is never
        // tracked, but it still destroys the tracked frame at the data boundary
        let mut bench = Bench::new(
            PhyConfig::default(),
            &[
                (1, Position::new(0.0, 0.0)),
                (2, Position::new(1000.0, 0.0)),
                (3, Position::new(1100.0, 0.0)),
            ],
        );
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::from_millis(30), 3, 2, 14.0, 9);
        bench.run().unwrap();

        let frames = bench.frames();
        assert!(frames.iter().all(|(_, f)| f.receiver != EntityId(2)));
        let radio = bench.radio(2);
        assert_eq!(radio.stats().rx_arrivals, 2);
        assert_eq!(radio.stats().rx_tracked, 1);
        assert_eq!(radio.stats().rx_failed, 1);
        assert_eq!(radio.receiver().stats().collisions, 1);
    }

    #[test]
    fn test_transmission_suppresses_tracking() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::ZERO, 2, 1, 14.0, 7);
        bench.run().unwrap();
        assert!(bench.frames().is_empty());
        assert_eq!(bench.radio(2).stats().rx_tracked, 0);
        assert_eq!(bench.radio(1).stats().rx_tracked, 0);
    }

    #[test]
    fn test_transmitting_abandons_tracked_reception() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::from_millis(20), 2, 1, 14.0, 7);
        bench.run().unwrap();
        let radio = bench.radio(2);
        assert_eq!(radio.stats().rx_tracked, 1);
        assert_eq!(radio.stats().rx_aborted, 1);
        assert!(bench
            .frames()
            .iter()
            .all(|(_, f)| f.receiver != EntityId(2)));
    }

    #[test]
    fn test_abort_releases_tracked_slot() {
        let mut bench = two_radios();
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        let signal_id = SignalId(1 << 32);
        bench.post(
            SimTime::from_millis(20),
            MEDIUM,
            EventPayload::InvalidateTransmission { signal_id },
        );
        // A later signal can be tracked once the slot is free
        bench.send(SimTime::from_millis(100), 1, 2, 14.0, 7);
        bench.run().unwrap();

        let radio = bench.radio(2);
        assert_eq!(radio.stats().rx_aborted, 1);
        assert_eq!(radio.stats().rx_tracked, 2);
        let frames = bench.frames();
        assert_eq!(frames.len(), 1);
        assert_ne!(frames[0].1.signal_id, signal_id);
        assert!(bench.notifications(2).contains(&NotificationKind::ReceptionAborted));
    }

    #[test]
    fn test_same_sf_collision_counts_once() {
        let mut bench = Bench::new(
            PhyConfig::default(),
            &[
                (1, Position::new(0.0, 0.0)),
                (2, Position::new(1000.0, 0.0)),
                (3, Position::new(2000.0, 0.0)),
            ],
        );
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::from_millis(5), 3, 2, 14.0, 7);
        bench.run().unwrap();

        let radio = bench.radio(2);
        assert!(bench.frames().iter().all(|(_, f)| f.receiver != EntityId(2)));
        assert_eq!(radio.receiver().stats().collisions, 1);
        assert_eq!(radio.stats().rx_failed, 1);
        assert!(bench
            .notifications(2)
            .iter()
            .any(|k| matches!(k, NotificationKind::CollisionDetected { .. })));
    }

    #[test]
    fn test_simple_contention_loses_captured_frame() {
        let config = PhyConfig {
            channel_access: ChannelAccess::SimpleContention,
            ..PhyConfig::default()
        };
        let mut bench = Bench::new(
            config,
            &[
                (1, Position::new(0.0, 0.0)),
                (2, Position::new(100.0, 0.0)),
                (3, Position::new(3000.0, 0.0)),
            ],
        );
        bench.send(SimTime::ZERO, 1, 2, 14.0, 7);
        bench.send(SimTime::from_millis(5), 3, 2, 14.0, 9);
        bench.run().unwrap();
        assert!(bench.frames().iter().all(|(_, f)| f.receiver != EntityId(2)));
        assert_eq!(bench.radio(2).receiver().stats().collisions, 1);
    }
}
