//! PHY error types.

use lrsim_common::{EntityId, SignalId, SimError};
use thiserror::Error;

/// Fatal PHY usage errors. These abort the simulation.
#[derive(Debug, Error, PartialEq)]
pub enum PhyError {
    /// The upper layer asked for a transmission while one is in progress.
    #[error("Received frame from upper layer while transmitting {0}")]
    TransmitWhileBusy(SignalId),

    /// A decoded frame lacks a tag required for delivery.
    #[error("{0} indication not present on decoded frame")]
    MissingTag(&'static str),

    /// A boundary timer carried an unknown signal part code.
    #[error("Unknown signal part code {0}")]
    UnknownSignalPart(u8),
}

impl PhyError {
    /// Wrap into a simulation error raised by `entity`.
    pub fn into_sim_error(self, entity: EntityId) -> SimError {
        SimError::HandlerError {
            entity,
            message: self.to_string(),
        }
    }
}
