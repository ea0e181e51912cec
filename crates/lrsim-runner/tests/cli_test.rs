//! Integration tests for the `lrsim` binary.
//!
//! These tests write a model to a temporary directory, run the binary on it
//! and check the trace, metrics and summary it produces.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

use serde::Deserialize;

// ============================================================================
// JSON Deserialization Types for Trace Output
// ============================================================================

/// A trace entry from the output file.
///
/// The payload is flattened into the entry, so fields specific to one entry
/// type are optional here.
#[derive(Debug, Deserialize, Clone)]
struct TraceEntry {
    origin: String,
    origin_id: String,
    timestamp: String,
    /// Entry type: "SIGNAL", "FRAME" or "PHY"
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    signal_id: Option<u64>,
    #[serde(rename = "SNIR", default)]
    snir: Option<String>,
    #[serde(rename = "RSSI", default)]
    rssi: Option<String>,
    #[serde(default)]
    frame_hex: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    tracked: Option<bool>,
    #[serde(default)]
    counted: Option<bool>,
    #[serde(default)]
    signal_start_time_s: Option<f64>,
    #[serde(default)]
    signal_end_time_s: Option<f64>,
}

const COLLISION_MODEL: &str = r#"
simulation:
  seed: 7
nodes:
  - name: gw
    role: gateway
    position: { x: 0, y: 0 }
  - name: ed1
    position: { x: 1000, y: 0 }
  - name: ed2
    position: { x: 0, y: 1000 }
traffic:
  - { from: ed1, to: gw, at_s: 0.100, payload_len: 4 }
  - { from: ed2, to: gw, at_s: 0.105, payload_len: 4 }
  - { from: ed1, to: gw, at_s: 1.000, payload_len: 4 }
"#;

// ============================================================================
// Test Helper Functions
// ============================================================================

fn write_model(dir: &TempDir, name: &str, yaml: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, yaml).expect("Failed to write model");
    path
}

fn run_lrsim(args: &[&str], models: &[&Path]) -> Output {
    // CARGO_BIN_EXE_lrsim is set by cargo when running tests for this crate
    let binary = env!("CARGO_BIN_EXE_lrsim");
    let mut cmd = Command::new(binary);
    cmd.arg("run");
    for model in models {
        cmd.arg(model);
    }
    cmd.args(args);
    let output = cmd.output().expect("Failed to execute lrsim");
    if !output.status.success() {
        panic!(
            "Simulation failed:\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    output
}

fn run_and_collect_trace(yaml: &str) -> Vec<TraceEntry> {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let model = write_model(&temp_dir, "model.yaml", yaml);
    let output_path = temp_dir.path().join("trace.json");
    let output_arg = output_path.to_string_lossy().to_string();
    run_lrsim(&["--output", &output_arg], &[&model]);

    let trace_json = fs::read_to_string(&output_path).expect("Failed to read trace output file");
    serde_json::from_str(&trace_json).expect("Failed to parse trace JSON")
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_trace_contains_signals_frames_and_notifications() {
    let trace = run_and_collect_trace(COLLISION_MODEL);

    let signals: Vec<_> = trace.iter().filter(|e| e.entry_type == "SIGNAL").collect();
    assert_eq!(signals.len(), 3);
    for signal in &signals {
        assert_eq!(signal.direction.as_deref(), Some("TX"));
        assert_eq!(signal.rssi.as_deref(), Some("14 dBm"));
        assert!(signal.origin == "ed1" || signal.origin == "ed2");
        assert!(signal.signal_id.is_some());
        // Payload starts with the host's sequence number
        assert_eq!(signal.frame_hex.as_ref().map(|h| h.len()), Some(8));
        assert!(signal.signal_end_time_s.unwrap() > signal.signal_start_time_s.unwrap());
    }

    // Only the third frame gets through to the gateway. ed2 is 1414 m from
    // ed1 and overhears it at about -111 dBm.
    let frames: Vec<_> = trace.iter().filter(|e| e.entry_type == "FRAME").collect();
    assert_eq!(frames.len(), 2);
    let overheard: Vec<_> = frames.iter().filter(|e| e.origin == "ed2").collect();
    assert_eq!(overheard.len(), 1);
    assert_eq!(overheard[0].rssi.as_deref(), Some("-111.1 dBm"));
    let gw_frames: Vec<_> = frames.iter().filter(|e| e.origin == "gw").collect();
    assert_eq!(gw_frames.len(), 1);
    let frame = gw_frames[0];
    assert_eq!(frame.origin, "gw");
    assert_eq!(frame.direction.as_deref(), Some("RX"));
    assert_eq!(frame.rssi.as_deref(), Some("-107.0 dBm"));
    assert_eq!(frame.snir.as_deref(), Some("13.0 dB"));
    assert_eq!(frame.frame_hex.as_deref(), Some("00000001"));
    assert!(frame.timestamp.starts_with("2025-01-01T00:00:01."));

    let counted: Vec<_> = trace
        .iter()
        .filter(|e| e.origin == "gw" && e.kind.as_deref() == Some("collision_detected"))
        .collect();
    assert_eq!(counted.len(), 1);
    assert_eq!(counted[0].counted, Some(true));

    let gw_started = trace
        .iter()
        .filter(|e| e.origin == "gw" && e.kind.as_deref() == Some("reception_started"))
        .count();
    assert_eq!(gw_started, 3);
    assert!(trace
        .iter()
        .any(|e| e.origin == "gw" && e.kind.as_deref() == Some("reception_started") && e.tracked == Some(false)));
    assert!(trace.iter().all(|e| !e.origin_id.is_empty()));
}

#[test]
fn test_run_prints_stats_summary() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let model = write_model(&temp_dir, "model.yaml", COLLISION_MODEL);
    let output = run_lrsim(&["--duration", "2s"], &[&model]);

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(summary["stats"]["signals_transmitted"], 3);
    assert_eq!(summary["stats"]["simulation_time_us"], 2_000_000);
    assert_eq!(summary["nodes"]["gw"]["collisions"], 1);
    assert_eq!(summary["nodes"]["gw"]["rx_frames"], 1);
    assert_eq!(summary["nodes"]["ed2"]["rx_frames"], 1);
    assert_eq!(summary["stats"]["frames_received"], 2);
    assert_eq!(summary["nodes"]["ed1"]["tx_signals"], 2);
}

#[test]
fn test_later_model_files_override_earlier_ones() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let base = write_model(&temp_dir, "base.yaml", COLLISION_MODEL);
    // Moving ed1 close to the gateway lets its first frame capture the channel
    let overlay = write_model(&temp_dir, "overlay.yaml", "nodes:\n  - name: ed1\n    position: { x: 100, y: 0 }\n");
    let output = run_lrsim(&[], &[&base, &overlay]);

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(summary["nodes"]["gw"]["collisions"], 0);
    assert_eq!(summary["nodes"]["gw"]["rx_frames"], 2);
}

#[test]
fn test_metrics_json_export() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let model = write_model(&temp_dir, "model.yaml", COLLISION_MODEL);
    let metrics_path = temp_dir.path().join("metrics.json");
    let metrics_arg = metrics_path.to_string_lossy().to_string();
    run_lrsim(&["--metrics-output", "json", "--metrics-file", &metrics_arg], &[&model]);

    let metrics: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&metrics_path).expect("Failed to read metrics")).unwrap();
    assert_eq!(metrics["counters"]["lrsim.radio.tx_signals"], 3);
    // The gateway's frame plus the one ed2 overhears
    assert_eq!(metrics["counters"]["lrsim.radio.rx_frames"], 2);
    assert_eq!(metrics["nodes"]["gw"]["counters"]["lrsim.radio.rx_frames"], 1);
    assert_eq!(metrics["nodes"]["ed2"]["counters"]["lrsim.radio.rx_frames"], 1);
    assert_eq!(metrics["nodes"]["gw"]["counters"]["lrsim.radio.rx_collided"], 1);
    assert_eq!(metrics["nodes"]["ed1"]["counters"]["lrsim.radio.tx_signals"], 2);
    assert_eq!(metrics["by_part"]["lrsim.radio.rx_collided"]["preamble"], 1);
    assert_eq!(metrics["histograms"]["lrsim.radio.rx_power"]["count"], 2);
    assert_eq!(metrics["nodes"]["gw"]["histograms"]["lrsim.radio.rx_power"]["count"], 1);
}

#[test]
fn test_metrics_prometheus_to_stdout() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let model = write_model(&temp_dir, "model.yaml", COLLISION_MODEL);
    let output = run_lrsim(&["--metrics-output", "prometheus"], &[&model]);

    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("# TYPE lrsim_radio_tx_signals counter"));
    assert!(text.contains("lrsim_radio_tx_signals 3"));
    assert!(text.contains("lrsim_radio_tx_signals{node=\"ed2\"} 1"));
}

#[test]
fn test_invalid_model_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let model = write_model(&temp_dir, "bad.yaml", "nodes:\n  - name: a\n    radio: { spreading_factor: 13 }\n");
    let output = Command::new(env!("CARGO_BIN_EXE_lrsim"))
        .arg("run")
        .arg(&model)
        .output()
        .expect("Failed to execute lrsim");
    assert!(!output.status.success());
}

#[test]
fn test_airtime_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_lrsim"))
        .args(["airtime", "--sf", "7", "--payload-len", "0"])
        .output()
        .expect("Failed to execute lrsim");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    // 12.25 preamble symbols plus 13 payload symbols of 1024 us
    assert!(text.contains("25856 us"), "{text}");
}
