//! Error-rate annotation of decoded frames.
//!
//! Error models only annotate; the reception decision never consults them.

use lrsim_common::{ErrorRateInd, SnirInd};

/// Estimates error rates of a reception from its SNIR.
pub trait ErrorModel: Send + Sync {
    /// Packet error rate, if the model can estimate it.
    fn compute_packet_error_rate(&self, snir: &SnirInd, spreading_factor: u8) -> Option<f64>;

    /// Bit error rate, if the model can estimate it.
    fn compute_bit_error_rate(&self, _snir: &SnirInd, _spreading_factor: u8) -> Option<f64> {
        None
    }

    /// Symbol error rate, if the model can estimate it.
    fn compute_symbol_error_rate(&self, _snir: &SnirInd, _spreading_factor: u8) -> Option<f64> {
        None
    }
}

/// Compute the error-rate tag for a reception. Without a model every rate is zero.
pub fn annotate_error_rates(
    model: Option<&dyn ErrorModel>,
    snir: &SnirInd,
    spreading_factor: u8,
) -> ErrorRateInd {
    match model {
        Some(model) => ErrorRateInd {
            packet_error_rate: model.compute_packet_error_rate(snir, spreading_factor),
            bit_error_rate: model.compute_bit_error_rate(snir, spreading_factor),
            symbol_error_rate: model.compute_symbol_error_rate(snir, spreading_factor),
        },
        None => ErrorRateInd {
            packet_error_rate: Some(0.0),
            bit_error_rate: Some(0.0),
            symbol_error_rate: Some(0.0),
        },
    }
}

/// Step error model: a frame is lost when its minimum SNIR is below the
/// demodulation threshold of its spreading factor.
#[derive(Debug, Clone)]
pub struct SnrThresholdErrorModel {
    /// SNR thresholds for SF7..SF12 in dB, indexed as `[SF-7]`.
    pub thresholds_db: [f64; 6],
}

impl SnrThresholdErrorModel {
    /// Default demodulation thresholds for SF7..SF12.
    pub const DEFAULT_THRESHOLDS_DB: [f64; 6] = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0];

    /// Threshold for a spreading factor. Unknown SFs use the SF8 value.
    pub fn threshold_db(&self, spreading_factor: u8) -> f64 {
        match spreading_factor {
            7..=12 => self.thresholds_db[(spreading_factor - 7) as usize],
            _ => self.thresholds_db[1],
        }
    }
}

impl Default for SnrThresholdErrorModel {
    fn default() -> Self {
        SnrThresholdErrorModel {
            thresholds_db: Self::DEFAULT_THRESHOLDS_DB,
        }
    }
}

impl ErrorModel for SnrThresholdErrorModel {
    fn compute_packet_error_rate(&self, snir: &SnirInd, spreading_factor: u8) -> Option<f64> {
        if snir.min_db >= self.threshold_db(spreading_factor) {
            Some(0.0)
        } else {
            Some(1.0)
        }
    }
}
