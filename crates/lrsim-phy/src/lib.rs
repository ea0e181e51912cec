//! # lrsim-phy
//!
//! LoRa physical layer for LRSim.
//!
//! This crate provides:
//! - Airtime and signal part boundaries ([`timing`])
//! - Sensitivity and non-orthogonality tables ([`tables`])
//! - The reception decision engine ([`Receiver`])
//! - Error-rate annotation ([`ErrorModel`], [`SnrThresholdErrorModel`])
//! - The shared radio medium ([`RadioMedium`], [`MediumEntity`])
//! - The radio entity and its timing state machine ([`Radio`])
//! - Configurable PHY parameters ([`PhyConfig`])

pub mod decision;
pub mod error;
pub mod error_model;
pub mod medium;
pub mod radio;
pub mod tables;
pub mod timing;

pub use decision::{
    ChannelAccess, Collision, EndpointRole, ReceiverStats, ReceptionDecision, Receiver, RolePolicy,
};
pub use error::PhyError;
pub use error_model::{ErrorModel, SnrThresholdErrorModel};
pub use medium::{Medium, MediumConfig, MediumEntity, Noise, PathLossModel, RadioMedium};
pub use radio::{Radio, RadioState, RadioStats};

use serde::{Deserialize, Serialize};

/// Configurable PHY parameters shared by all radios of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhyConfig {
    /// Collision resolution policy.
    pub channel_access: ChannelAccess,
    /// Energy detection level in dBm for the listening decision.
    pub energy_detection_dbm: f64,
    /// Programmed preamble symbols.
    pub preamble_symbols: u32,
    /// Track preamble, header and data separately instead of one whole part.
    pub separate_parts: bool,
    /// Capacity of the in-flight reception arena per radio (1-256).
    pub max_concurrent_receptions: usize,
}

impl PhyConfig {
    /// Default programmed preamble length.
    pub const DEFAULT_PREAMBLE_SYMBOLS: u32 = 8;

    /// Default energy detection level.
    pub const DEFAULT_ENERGY_DETECTION_DBM: f64 = -140.0;

    /// Largest supported arena capacity.
    pub const MAX_CONCURRENT_RECEPTIONS: usize = 256;
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            channel_access: ChannelAccess::CaptureAware,
            energy_detection_dbm: Self::DEFAULT_ENERGY_DETECTION_DBM,
            preamble_symbols: Self::DEFAULT_PREAMBLE_SYMBOLS,
            separate_parts: true,
            max_concurrent_receptions: 16,
        }
    }
}
