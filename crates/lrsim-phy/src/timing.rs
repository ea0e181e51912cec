//! LoRa airtime and signal part boundaries.

use lrsim_common::{SignalTiming, SimTime, TxParams};

/// Symbols of sync word and start frame delimiter added to the programmed preamble.
const PREAMBLE_EXTRA_SYMBOLS: f64 = 4.25;

/// Payload symbols carried in the explicit header part.
pub const HEADER_SYMBOLS: u32 = 8;

/// Symbol period in microseconds: `2^SF / BW`.
pub fn symbol_time_us(spreading_factor: u8, bandwidth_hz: u32) -> f64 {
    2f64.powi(spreading_factor as i32) * 1_000_000.0 / bandwidth_hz as f64
}

/// Preamble duration in microseconds for `preamble_symbols` programmed symbols.
pub fn preamble_duration_us(params: &TxParams, preamble_symbols: u32) -> f64 {
    (preamble_symbols as f64 + PREAMBLE_EXTRA_SYMBOLS)
        * symbol_time_us(params.spreading_factor, params.bandwidth_hz)
}

/// Number of payload symbols (header included) for a frame of `payload_len` bytes.
///
/// `n = 8 + max(ceil((8*PL - 4*SF + 28 + 16) / (4*SF)) * (CR + 4), 0)`
pub fn payload_symbols(params: &TxParams, payload_len: usize) -> u32 {
    let sf = params.spreading_factor as f64;
    let numerator = 8.0 * payload_len as f64 - 4.0 * sf + 28.0 + 16.0;
    let blocks = (numerator / (4.0 * sf)).ceil();
    let extra = (blocks * (params.code_redundancy as f64 + 4.0)).max(0.0);
    8 + extra as u32
}

/// Compute the part boundaries of a signal starting at `start`.
///
/// With `use_header` the header part spans the first [`HEADER_SYMBOLS`]
/// payload symbols; otherwise it has zero length and the data part covers
/// all payload symbols.
pub fn signal_timing(
    params: &TxParams,
    payload_len: usize,
    preamble_symbols: u32,
    start: SimTime,
) -> SignalTiming {
    let t_sym = symbol_time_us(params.spreading_factor, params.bandwidth_hz);
    let preamble = preamble_duration_us(params, preamble_symbols);
    let n_payload = payload_symbols(params, payload_len);
    let header_symbols = if params.use_header {
        HEADER_SYMBOLS.min(n_payload)
    } else {
        0
    };

    let at = |offset_us: f64| start + SimTime::from_micros_f64(offset_us);
    SignalTiming {
        start,
        preamble_end: at(preamble),
        header_end: at(preamble + header_symbols as f64 * t_sym),
        end: at(preamble + n_payload as f64 * t_sym),
    }
}

/// Total time on air for a frame of `payload_len` bytes.
pub fn time_on_air(params: &TxParams, payload_len: usize, preamble_symbols: u32) -> SimTime {
    signal_timing(params, payload_len, preamble_symbols, SimTime::ZERO).duration()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf7() -> TxParams {
        TxParams::default()
    }

    #[test]
    fn test_symbol_time() {
        assert!((symbol_time_us(7, 125_000) - 1024.0).abs() < 1e-9);
        assert!((symbol_time_us(12, 125_000) - 32768.0).abs() < 1e-9);
        assert!((symbol_time_us(7, 500_000) - 256.0).abs() < 1e-9);
    }

    #[test]
    fn test_payload_symbols() {
        // ceil(176 / 28) = 7 blocks of 5 symbols
        assert_eq!(payload_symbols(&sf7(), 20), 43);
        // Empty payload still needs the fixed 8 symbols plus one block
        assert_eq!(payload_symbols(&sf7(), 0), 13);
        // SF12, 4/8: ceil((400 - 48 + 44) / 48) = 9 blocks of 8 symbols
        let params = TxParams {
            spreading_factor: 12,
            code_redundancy: 4,
            ..sf7()
        };
        assert_eq!(payload_symbols(&params, 50), 80);
    }

    #[test]
    fn test_signal_timing_sf7_20_bytes() {
        let timing = signal_timing(&sf7(), 20, 8, SimTime::ZERO);
        assert_eq!(timing.preamble_end, SimTime::from_micros(12_544));
        assert_eq!(timing.header_end, SimTime::from_micros(12_544 + 8 * 1024));
        assert_eq!(timing.end, SimTime::from_micros(12_544 + 43 * 1024));
    }

    #[test]
    fn test_signal_timing_without_header() {
        let params = TxParams {
            use_header: false,
            ..sf7()
        };
        let timing = signal_timing(&params, 20, 8, SimTime::from_millis(5));
        assert_eq!(timing.header_end, timing.preamble_end);
        assert_eq!(timing.duration(), SimTime::from_micros(12_544 + 43 * 1024));
    }

    #[test]
    fn test_time_on_air_grows_with_sf() {
        let mut params = sf7();
        let mut last = SimTime::ZERO;
        for sf in 7..=12 {
            params.spreading_factor = sf;
            let toa = time_on_air(&params, 20, 8);
            assert!(toa > last);
            last = toa;
        }
    }
}
