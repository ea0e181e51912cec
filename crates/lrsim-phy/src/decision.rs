//! Reception decisions: sensitivity, collisions and capture.
//!
//! A [`Receiver`] evaluates one (reception, part) pair at a time in three
//! stages: possible, attempted and successful. Each stage only runs when
//! the previous one passed.

use crate::error_model::{annotate_error_rates, ErrorModel};
use crate::medium::Noise;
use crate::tables::{non_orth_delta_db, sensitivity_dbm};
use crate::timing::symbol_time_us;
use crate::PhyConfig;
use lrsim_common::{
    DecodedFrame, FrameTags, MacAddress, Reception, Signal, SignalId, SignalPart, SignalPowerInd,
    SignalTimeInd, SimTime, SnirInd,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Symbols before the end of the programmed preamble where the critical section starts.
const CRITICAL_SECTION_GUARD_SYMBOLS: u32 = 6;

// ============================================================================
// Policies
// ============================================================================

/// How overlapping same-frequency signals are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAccess {
    /// Any time and frequency overlap is a collision.
    SimpleContention,
    /// Overlaps collide only without capture and with a timing collision.
    #[default]
    CaptureAware,
}

/// Role of a radio endpoint in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    /// Relay node.
    Relay,
    /// Gateway.
    Gateway,
    /// End device.
    EndDevice,
}

/// Behavior selected by an endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePolicy {
    /// Record collisions in payload-carrying parts regardless of destination.
    pub records_data_collisions: bool,
    /// Node type label for metrics and traces.
    pub label: &'static str,
}

static ROLE_POLICIES: [RolePolicy; 3] = [
    RolePolicy {
        records_data_collisions: false,
        label: "relay",
    },
    RolePolicy {
        records_data_collisions: true,
        label: "gateway",
    },
    RolePolicy {
        records_data_collisions: false,
        label: "end_device",
    },
];

impl EndpointRole {
    /// Policy table entry for this role.
    pub fn policy(&self) -> &'static RolePolicy {
        match self {
            EndpointRole::Relay => &ROLE_POLICIES[0],
            EndpointRole::Gateway => &ROLE_POLICIES[1],
            EndpointRole::EndDevice => &ROLE_POLICIES[2],
        }
    }
}

// ============================================================================
// Decision Types
// ============================================================================

/// A collision found while evaluating a reception part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collision {
    /// The interferer that caused the collision.
    pub interferer: SignalId,
    /// The lost frame was addressed to this endpoint and was counted.
    pub counted: bool,
    /// A gateway recorded this as a payload collision.
    pub data_collision: bool,
}

/// Three-stage verdict for one reception part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceptionDecision {
    /// Evaluated part.
    pub part: SignalPart,
    /// Power was at or above sensitivity.
    pub possible: bool,
    /// No collision under the active channel access policy.
    pub attempted: bool,
    /// The part was received.
    pub successful: bool,
    /// Collision that failed the attempt, if any.
    pub collision: Option<Collision>,
}

/// Counters kept by a receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    /// Collisions on frames addressed to this endpoint.
    pub collisions: u64,
    /// Payload collisions recorded by gateways.
    pub data_collisions: u64,
    /// Part evaluations below sensitivity.
    pub below_sensitivity: u64,
    /// Arrivals rejected by the listening decision.
    pub listening_impossible: u64,
}

// ============================================================================
// Collision Tests
// ============================================================================

/// Window overlap test: midpoints closer than the sum of half-widths.
///
/// Evaluated on doubled values so it stays in integer microseconds.
pub fn windows_overlap(a: &Reception, b: &Reception) -> bool {
    let (sa, ea) = (a.start_time().as_micros() as i128, a.end_time().as_micros() as i128);
    let (sb, eb) = (b.start_time().as_micros() as i128, b.end_time().as_micros() as i128);
    ((sa + ea) - (sb + eb)).abs() < (ea - sa) + (eb - sb)
}

/// Whether `reception` is captured over `interferer`.
///
/// Spreading factors outside the tabulated range never capture.
pub fn is_captured(reception: &Reception, interferer: &Reception) -> bool {
    non_orth_delta_db(reception.spreading_factor, interferer.spreading_factor)
        .map(|delta| reception.power_dbm - interferer.power_dbm >= delta)
        .unwrap_or(false)
}

/// Start of the critical section of a reception: the guard period before
/// the end of the programmed preamble.
pub fn critical_section_start(reception: &Reception, preamble_symbols: u32) -> SimTime {
    let t_sym = symbol_time_us(reception.spreading_factor, reception.bandwidth_hz);
    let symbols = preamble_symbols.saturating_sub(CRITICAL_SECTION_GUARD_SYMBOLS) as f64;
    reception.preamble_start_time() + SimTime::from_micros_f64(t_sym * symbols)
}

// ============================================================================
// Receiver
// ============================================================================

/// Decision engine of one radio endpoint.
pub struct Receiver {
    role: EndpointRole,
    address: MacAddress,
    channel_access: ChannelAccess,
    energy_detection_dbm: f64,
    preamble_symbols: u32,
    error_model: Option<Arc<dyn ErrorModel>>,
    stats: ReceiverStats,
}

impl Receiver {
    /// Create a receiver for an endpoint.
    pub fn new(role: EndpointRole, address: MacAddress, config: &PhyConfig) -> Self {
        Receiver {
            role,
            address,
            channel_access: config.channel_access,
            energy_detection_dbm: config.energy_detection_dbm,
            preamble_symbols: config.preamble_symbols,
            error_model: None,
            stats: ReceiverStats::default(),
        }
    }

    /// Attach an error model used to annotate decoded frames.
    pub fn with_error_model(mut self, model: Arc<dyn ErrorModel>) -> Self {
        self.error_model = Some(model);
        self
    }

    /// Local MAC address.
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// Active channel access policy.
    pub fn channel_access(&self) -> ChannelAccess {
        self.channel_access
    }

    /// Counters.
    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Listening is possible iff the maximum noise and interference power
    /// over the window reaches the energy detection level.
    pub fn compute_listening_decision(&mut self, noise: &Noise) -> bool {
        let max_power_dbm = noise.max_power_dbm();
        let possible = max_power_dbm >= self.energy_detection_dbm;
        debug!(
            max_power_dbm,
            energy_detection_dbm = self.energy_detection_dbm,
            possible,
            "listening decision"
        );
        if !possible {
            self.stats.listening_impossible += 1;
        }
        possible
    }

    /// Minimum received power over the part window against sensitivity.
    ///
    /// Reception power is constant over the signal, so the minimum is the
    /// reception power for any non-empty window.
    pub fn compute_is_reception_possible(&mut self, reception: &Reception, part: SignalPart) -> bool {
        let min_power_dbm = reception.power_dbm;
        let sensitivity = sensitivity_dbm(reception.spreading_factor, reception.bandwidth_hz);
        let possible = min_power_dbm >= sensitivity;
        debug!(
            signal = %reception.signal_id,
            %part,
            min_power_dbm,
            sensitivity_dbm = sensitivity,
            possible,
            "reception possible"
        );
        if !possible {
            self.stats.below_sensitivity += 1;
        }
        possible
    }

    /// Find the first interferer that collides with `reception` under the
    /// active channel access policy.
    pub fn is_packet_collided(&self, reception: &Reception, interference: &[Reception]) -> Option<SignalId> {
        let cs_begin = critical_section_start(reception, self.preamble_symbols);
        for interferer in interference {
            let overlap = windows_overlap(reception, interferer);
            let frequency_collision = reception.center_frequency_hz == interferer.center_frequency_hz;
            let capture = is_captured(reception, interferer);
            let timing_collision = cs_begin < interferer.end_time();
            debug!(
                signal = %reception.signal_id,
                interferer = %interferer.signal_id,
                own_sf = reception.spreading_factor,
                interferer_sf = interferer.spreading_factor,
                power_gap_db = reception.power_dbm - interferer.power_dbm,
                overlap,
                frequency_collision,
                capture,
                timing_collision,
                "interferer"
            );
            if !(overlap && frequency_collision) {
                continue;
            }
            let collided = match self.channel_access {
                ChannelAccess::SimpleContention => true,
                ChannelAccess::CaptureAware => !capture && timing_collision,
            };
            if collided {
                return Some(interferer.signal_id);
            }
        }
        None
    }

    /// Attempt test. A collision fails the attempt and is counted when the
    /// frame is addressed to this endpoint.
    pub fn compute_is_reception_attempted(
        &mut self,
        reception: &Reception,
        part: SignalPart,
        interference: &[Reception],
    ) -> (bool, Option<Collision>) {
        let Some(interferer) = self.is_packet_collided(reception, interference) else {
            return (true, None);
        };
        let counted = reception.destination == self.address;
        if counted {
            self.stats.collisions += 1;
        }
        let data_collision = self.role.policy().records_data_collisions && part.carries_data();
        if data_collision {
            self.stats.data_collisions += 1;
        }
        debug!(
            signal = %reception.signal_id,
            %interferer,
            %part,
            counted,
            data_collision,
            "collision"
        );
        (
            false,
            Some(Collision {
                interferer,
                counted,
                data_collision,
            }),
        )
    }

    /// Success test. Collision-free parts always succeed; error models only
    /// annotate.
    pub fn compute_is_reception_successful(&self, _reception: &Reception, _part: SignalPart) -> bool {
        true
    }

    /// Full decision chain for one part, short-circuiting after the first
    /// failed stage.
    pub fn compute_reception_decision(
        &mut self,
        reception: &Reception,
        part: SignalPart,
        interference: &[Reception],
    ) -> ReceptionDecision {
        let possible = self.compute_is_reception_possible(reception, part);
        let (attempted, collision) = if possible {
            self.compute_is_reception_attempted(reception, part, interference)
        } else {
            (false, None)
        };
        let successful = attempted && self.compute_is_reception_successful(reception, part);
        ReceptionDecision {
            part,
            possible,
            attempted,
            successful,
            collision,
        }
    }

    /// Build the decoded frame of a successful reception with its tags.
    pub fn compute_reception_result(&self, signal: &Signal, reception: &Reception, snir: SnirInd) -> DecodedFrame {
        let error_rate = annotate_error_rates(self.error_model.as_deref(), &snir, reception.spreading_factor);
        DecodedFrame {
            frame: signal.frame.clone(),
            signal_id: signal.id,
            transmitter: signal.transmitter,
            receiver: reception.receiver,
            tags: FrameTags {
                signal_power: Some(SignalPowerInd {
                    power_dbm: reception.power_dbm,
                }),
                snir: Some(snir),
                time: Some(SignalTimeInd {
                    start: reception.start_time(),
                    end: reception.end_time(),
                }),
                error_rate: Some(error_rate),
            },
        }
    }
}
