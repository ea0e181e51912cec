//! Radio data shared between the PHY, model and runner crates.
//!
//! These are plain data carriers: signals, receptions, frames and the
//! notifications a radio emits. The calculations that produce them live in
//! `lrsim-phy`.

use crate::{EntityId, SimTime};
use serde::{Deserialize, Serialize};

// ============================================================================
// Addressing
// ============================================================================

/// 48-bit MAC address of a radio endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub u64);

impl MacAddress {
    /// The broadcast address.
    pub const BROADCAST: MacAddress = MacAddress(0xFFFF_FFFF_FFFF);

    /// Check whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// A link-layer frame. The payload is opaque to the PHY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Sender address.
    pub source: MacAddress,
    /// Intended receiver address.
    pub destination: MacAddress,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

// ============================================================================
// Transmission Parameters
// ============================================================================

/// Per-frame LoRa radio parameters supplied by the upper layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxParams {
    /// Center frequency in Hz.
    pub center_frequency_hz: u32,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Spreading factor (6-12).
    pub spreading_factor: u8,
    /// Code redundancy (1-4, coding rate 4/5 to 4/8).
    pub code_redundancy: u8,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Whether an explicit header is sent.
    pub use_header: bool,
}

impl Default for TxParams {
    fn default() -> Self {
        TxParams {
            center_frequency_hz: 868_100_000,
            bandwidth_hz: 125_000,
            spreading_factor: 7,
            code_redundancy: 1,
            tx_power_dbm: 14.0,
            use_header: true,
        }
    }
}

/// Upper layer → radio: a frame ready to transmit.
#[derive(Debug, Clone)]
pub struct TxRequest {
    /// The frame to transmit.
    pub frame: Frame,
    /// Radio parameters for this frame.
    pub params: TxParams,
}

// ============================================================================
// Signal Parts
// ============================================================================

/// How a signal is divided into parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Preamble, header and data are tracked separately.
    Separated,
    /// The signal is a single whole part.
    Whole,
}

impl SignalKind {
    /// The part a transmission or reception starts with.
    pub fn first_part(&self) -> SignalPart {
        match self {
            SignalKind::Separated => SignalPart::Preamble,
            SignalKind::Whole => SignalPart::Whole,
        }
    }
}

/// A named sub-phase of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPart {
    /// The whole signal when parts are not separated.
    Whole,
    /// Preamble and sync word.
    Preamble,
    /// Explicit header.
    Header,
    /// Payload.
    Data,
}

impl SignalPart {
    /// Encode the part as a small integer (used in timer ids).
    pub fn code(&self) -> u8 {
        match self {
            SignalPart::Whole => 0,
            SignalPart::Preamble => 1,
            SignalPart::Header => 2,
            SignalPart::Data => 3,
        }
    }

    /// Decode a part code. Returns `None` for unknown codes.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SignalPart::Whole),
            1 => Some(SignalPart::Preamble),
            2 => Some(SignalPart::Header),
            3 => Some(SignalPart::Data),
            _ => None,
        }
    }

    /// The part following this one, or `None` if this is the last part.
    pub fn next(&self) -> Option<SignalPart> {
        match self {
            SignalPart::Preamble => Some(SignalPart::Header),
            SignalPart::Header => Some(SignalPart::Data),
            SignalPart::Data | SignalPart::Whole => None,
        }
    }

    /// Whether the signal ends with this part.
    pub fn is_final(&self) -> bool {
        self.next().is_none()
    }

    /// Whether this part carries payload.
    pub fn carries_data(&self) -> bool {
        matches!(self, SignalPart::Data | SignalPart::Whole)
    }

    /// Label used in logs and traces.
    pub fn as_label(&self) -> &'static str {
        match self {
            SignalPart::Whole => "whole",
            SignalPart::Preamble => "preamble",
            SignalPart::Header => "header",
            SignalPart::Data => "data",
        }
    }
}

impl std::fmt::Display for SignalPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Part boundaries of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalTiming {
    /// Leading edge (preamble start).
    pub start: SimTime,
    /// End of the preamble.
    pub preamble_end: SimTime,
    /// End of the header.
    pub header_end: SimTime,
    /// Trailing edge.
    pub end: SimTime,
}

impl SignalTiming {
    /// Start time of a part.
    pub fn start_of(&self, part: SignalPart) -> SimTime {
        match part {
            SignalPart::Whole | SignalPart::Preamble => self.start,
            SignalPart::Header => self.preamble_end,
            SignalPart::Data => self.header_end,
        }
    }

    /// End time of a part.
    pub fn end_of(&self, part: SignalPart) -> SimTime {
        match part {
            SignalPart::Preamble => self.preamble_end,
            SignalPart::Header => self.header_end,
            SignalPart::Data | SignalPart::Whole => self.end,
        }
    }

    /// Total duration.
    pub fn duration(&self) -> SimTime {
        self.end - self.start
    }

    /// The same timing delayed by `delay`.
    pub fn shifted(&self, delay: SimTime) -> SignalTiming {
        SignalTiming {
            start: self.start + delay,
            preamble_end: self.preamble_end + delay,
            header_end: self.header_end + delay,
            end: self.end + delay,
        }
    }
}

// ============================================================================
// Signals and Receptions
// ============================================================================

/// Unique identifier of an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalId(pub u64);

impl std::fmt::Display for SignalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "signal#{}", self.0)
    }
}

/// An emitted radio waveform instance. Immutable once created.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Unique signal ID.
    pub id: SignalId,
    /// Radio that emitted the signal.
    pub transmitter: EntityId,
    /// How the signal is divided into parts.
    pub kind: SignalKind,
    /// Part boundaries at the transmitter.
    pub timing: SignalTiming,
    /// Radio parameters.
    pub params: TxParams,
    /// Carried frame.
    pub frame: Frame,
}

impl Signal {
    /// Start time of the signal.
    pub fn start_time(&self) -> SimTime {
        self.timing.start
    }

    /// End time of the signal.
    pub fn end_time(&self) -> SimTime {
        self.timing.end
    }
}

/// A signal as perceived at one receiving radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    /// The received signal.
    pub signal_id: SignalId,
    /// Radio that emitted the signal.
    pub transmitter: EntityId,
    /// Radio perceiving the signal.
    pub receiver: EntityId,
    /// Part boundaries at the receiver.
    pub timing: SignalTiming,
    /// Received power in dBm.
    pub power_dbm: f64,
    /// Center frequency in Hz.
    pub center_frequency_hz: u32,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Spreading factor.
    pub spreading_factor: u8,
    /// Receiver address of the carried frame.
    pub destination: MacAddress,
}

impl Reception {
    /// Arrival of the leading edge.
    pub fn start_time(&self) -> SimTime {
        self.timing.start
    }

    /// Arrival of the trailing edge.
    pub fn end_time(&self) -> SimTime {
        self.timing.end
    }

    /// Start of the preamble at the receiver.
    pub fn preamble_start_time(&self) -> SimTime {
        self.timing.start
    }
}

// ============================================================================
// Decoded Frames
// ============================================================================

/// Received signal power indication.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalPowerInd {
    /// Received power in dBm.
    pub power_dbm: f64,
}

/// Signal to noise-plus-interference indication.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SnirInd {
    /// Minimum SNIR over the reception in dB.
    pub min_db: f64,
    /// Maximum SNIR over the reception in dB.
    pub max_db: f64,
}

/// Reception time window indication.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalTimeInd {
    /// Leading edge at the receiver.
    pub start: SimTime,
    /// Trailing edge at the receiver.
    pub end: SimTime,
}

/// Error-rate annotation. Rates a model cannot estimate are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ErrorRateInd {
    /// Packet error rate.
    pub packet_error_rate: Option<f64>,
    /// Bit error rate.
    pub bit_error_rate: Option<f64>,
    /// Symbol error rate.
    pub symbol_error_rate: Option<f64>,
}

/// Metadata attached to a decoded frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameTags {
    /// Received power.
    pub signal_power: Option<SignalPowerInd>,
    /// SNIR range.
    pub snir: Option<SnirInd>,
    /// Reception window.
    pub time: Option<SignalTimeInd>,
    /// Error rates.
    pub error_rate: Option<ErrorRateInd>,
}

/// A frame decoded by a radio, on its way to the upper layer.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// The frame.
    pub frame: Frame,
    /// Signal that carried the frame.
    pub signal_id: SignalId,
    /// Radio that transmitted the frame.
    pub transmitter: EntityId,
    /// Radio that decoded the frame.
    pub receiver: EntityId,
    /// Reception metadata.
    pub tags: FrameTags,
}

// ============================================================================
// Notifications
// ============================================================================

/// What a [`PhyNotification`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    /// The radio put a signal on the air.
    TransmissionStarted,
    /// The radio finished transmitting a signal.
    TransmissionEnded,
    /// A signal's leading edge reached the radio.
    ReceptionStarted {
        /// Whether the radio is tracking this reception.
        tracked: bool,
    },
    /// A signal's trailing edge passed the radio.
    ReceptionEnded {
        /// Whether a frame was decoded and delivered.
        successful: bool,
    },
    /// The tracked reception was aborted.
    ReceptionAborted,
    /// A reception was lost to a collision the radio records.
    CollisionDetected {
        /// The interfering signal that caused the collision.
        interferer: SignalId,
        /// The frame was addressed to this radio.
        counted: bool,
        /// A gateway recorded a collision in a payload-carrying part.
        data_part: bool,
    },
}

/// Radio → observers notification intended for statistics collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhyNotification {
    /// Radio emitting the notification.
    pub radio: EntityId,
    /// Signal concerned.
    pub signal_id: SignalId,
    /// Simulation time of the notification.
    pub time: SimTime,
    /// What happened.
    #[serde(flatten)]
    pub kind: NotificationKind,
}
