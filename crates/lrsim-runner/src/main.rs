//! # lrsim
//!
//! CLI runner for LRSim.
//!
//! Runs LoRa PHY reception and collision simulations from YAML models and
//! offers a few calculators for the underlying radio tables.

use lrsim_runner::metrics_export::{self, InMemoryRecorder};
use lrsim_runner::{EventLoop, NodeStats, ProgressInfo, RunnerError, SimTime, SimulationStats};

use clap::{Parser, Subcommand, ValueEnum};
use lrsim_common::TxParams;
use lrsim_metrics::metric_defs;
use lrsim_model::{build_simulation, load_model, load_models};
use lrsim_phy::{tables, timing, PhyConfig};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Accepts a plain number of seconds (`60`), a number with a unit suffix
/// (`60s`, `10m`, `2h`, `1d`) or combined units (`1h30m`). Sub-second values
/// use `ms`.
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;

        let multiplier = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use ms, s, m, h, or d.", c, s)),
        };

        total_seconds += value * multiplier;
        current_number.clear();
    }

    // Trailing number without unit is seconds
    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if total_seconds == 0.0 && !s.is_empty() {
        return Err(format!("Invalid duration format: '{}'", s));
    }

    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at end of simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

/// LRSim - LoRa reception and collision simulator
#[derive(Parser, Debug)]
#[command(name = "lrsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from one or more YAML model files
    Run(RunnerConfig),
    /// List all available metrics with descriptions and labels
    Metrics,
    /// Print the receiver sensitivity table
    Sensitivity,
    /// Compute the time on air of a frame
    Airtime(AirtimeConfig),
}

/// Configuration for a simulation run
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Path(s) to YAML model file(s). Multiple files are merged in order.
    #[arg(required = true)]
    pub models: Vec<PathBuf>,

    /// Simulated duration (e.g. `30s`, `5m`, `1h30m`). Overrides the model;
    /// without either the run continues until no events remain.
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed (overrides the model, random when neither sets one)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Write a JSON trace of signals, frames and radio notifications to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Export metrics at the end of the run in the given format
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// File for the metrics export (stdout if not specified)
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print progress and a per-node summary to stderr
    #[arg(short, long)]
    pub verbose: bool,
}

/// Configuration for the airtime calculator
#[derive(Parser, Debug)]
pub struct AirtimeConfig {
    /// Spreading factor (6-12)
    #[arg(long, default_value = "7")]
    pub sf: u8,

    /// Bandwidth in Hz
    #[arg(long, default_value = "125000")]
    pub bw: u32,

    /// Coding rate index (1-4, meaning 4/5 to 4/8)
    #[arg(long, default_value = "1")]
    pub cr: u8,

    /// Payload length in bytes
    #[arg(long, default_value = "20")]
    pub payload_len: usize,

    /// Programmed preamble symbols
    #[arg(long, default_value_t = PhyConfig::DEFAULT_PREAMBLE_SYMBOLS)]
    pub preamble: u32,

    /// Implicit header mode (no header symbols)
    #[arg(long)]
    pub implicit_header: bool,
}

// ============================================================================
// Run Command
// ============================================================================

/// Run a simulation with the given configuration.
pub fn run_simulation(config: &RunnerConfig) -> Result<(SimulationStats, BTreeMap<String, NodeStats>), RunnerError> {
    let metrics_recorder = if config.metrics_output.is_some() {
        let recorder = Arc::new(InMemoryRecorder::new());
        if let Err(e) = metrics::set_global_recorder(recorder.clone()) {
            tracing::warn!("failed to set metrics recorder: {}", e);
            None
        } else {
            lrsim_metrics::describe_metrics();
            Some(recorder)
        }
    } else {
        None
    };

    let model = if config.models.len() == 1 {
        load_model(&config.models[0])?
    } else {
        let paths: Vec<&Path> = config.models.iter().map(|p| p.as_path()).collect();
        load_models(&paths)?
    };
    info!(nodes = model.nodes().len(), files = config.models.len(), "loaded model");

    let seed = config.seed.or(model.simulation().seed).unwrap_or_else(|| {
        use rand::Rng;
        rand::thread_rng().gen()
    });
    info!(seed, "using seed");

    let simulation = build_simulation(&model, seed)?;
    info!(entities = simulation.entities.len(), "built simulation");

    let trace_output: Option<Box<dyn Write>> = match config.output {
        Some(ref path) => Some(Box::new(std::io::BufWriter::new(std::fs::File::create(path)?))),
        None => None,
    };
    let mut event_loop = EventLoop::new(simulation, seed, trace_output);

    let duration_s = config.duration.or(model.simulation().duration_s);
    if let Some(secs) = duration_s {
        if !(secs.is_finite() && secs > 0.0) {
            return Err(RunnerError::ConfigError(format!("duration must be positive, got {}", secs)));
        }
    }
    let verbose = config.verbose;
    let print_progress = |_: &EventLoop, progress: ProgressInfo, is_final: bool| {
        if !verbose || is_final {
            return;
        }
        match progress.target_time {
            Some(target) => eprintln!(
                "  {:>10.3}s / {:.3}s | {} events",
                progress.sim_time.as_secs_f64(),
                target.as_secs_f64(),
                progress.events_processed
            ),
            None => eprintln!(
                "  {:>10.3}s | {} events",
                progress.sim_time.as_secs_f64(),
                progress.events_processed
            ),
        }
    };
    let stats = event_loop.run_with_progress(duration_s.map(SimTime::from_secs), print_progress)?;

    if verbose {
        print_summary_table(&event_loop);
    }

    if let (Some(format), Some(recorder)) = (config.metrics_output, metrics_recorder) {
        let snapshot = recorder.snapshot(event_loop.current_time());
        let mut writer: Box<dyn Write> = match config.metrics_file {
            Some(ref path) => Box::new(std::io::BufWriter::new(std::fs::File::create(path)?)),
            None => Box::new(std::io::stdout()),
        };
        match format {
            MetricsOutputFormat::Json => metrics_export::export_json(&snapshot, &mut writer)?,
            MetricsOutputFormat::Prometheus => metrics_export::export_prometheus(&snapshot, &mut writer)?,
        }
        writer.flush()?;
    }

    Ok((stats, event_loop.node_stats().clone()))
}

/// Print a per-node summary to stderr.
fn print_summary_table(event_loop: &EventLoop) {
    eprintln!();
    eprintln!(
        "{:<16} {:>6} {:>8} {:>8} {:>7} {:>7} {:>7} {:>6} {:>9}",
        "node", "tx", "arrivals", "tracked", "frames", "failed", "aborted", "coll", "delivered"
    );
    for (name, stats) in event_loop.node_stats() {
        eprintln!(
            "{:<16} {:>6} {:>8} {:>8} {:>7} {:>7} {:>7} {:>6} {:>9}",
            name,
            stats.tx_signals,
            stats.rx_arrivals,
            stats.rx_tracked,
            stats.rx_frames,
            stats.rx_failed,
            stats.rx_aborted,
            stats.collisions,
            stats.frames_delivered
        );
    }
}

// ============================================================================
// Table Commands
// ============================================================================

/// Print information about all available metrics
fn print_metrics_info() {
    println!("LRSim Available Metrics");
    println!("=======================\n");

    println!("All metrics support the following labels:");
    println!("  - node: Individual node identifier");
    println!("  - node_type: Endpoint role (end_device, gateway)");
    println!("  - groups: Custom grouping tags (comma-separated)");
    println!();

    let categories = [("Radio/PHY Layer", "lrsim.radio."), ("Host Layer", "lrsim.host.")];

    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);
        for metric in metric_defs::ALL {
            if !metric.name.starts_with(prefix) {
                continue;
            }
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            let unit_str = metric.unit_str();
            if !unit_str.is_empty() {
                println!("    Unit: {}", unit_str);
            }
            if !metric.description.is_empty() {
                println!("    Description: {}", metric.description);
            }
            if !metric.labels.is_empty() {
                println!("    Extra labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }
}

/// Print the sensitivity table in dBm, one row per spreading factor.
fn print_sensitivity_table() {
    let bandwidths = [125_000u32, 250_000, 500_000];
    print!("{:<4}", "SF");
    for bw in bandwidths {
        print!(" {:>10}", format!("{} kHz", bw / 1000));
    }
    println!();
    for sf in 6..=12u8 {
        print!("{:<4}", sf);
        for bw in bandwidths {
            print!(" {:>10.1}", tables::sensitivity_dbm(sf, bw));
        }
        println!();
    }
    println!("(other combinations: {:.1} dBm)", tables::DEFAULT_SENSITIVITY_DBM);
}

/// Print the time on air of a frame and its part boundaries.
fn print_airtime(config: &AirtimeConfig) -> Result<(), RunnerError> {
    if !(6..=12).contains(&config.sf) {
        return Err(RunnerError::ConfigError(format!("spreading factor {} outside 6..=12", config.sf)));
    }
    if !(1..=4).contains(&config.cr) {
        return Err(RunnerError::ConfigError(format!("coding rate {} outside 1..=4", config.cr)));
    }
    if config.bw == 0 {
        return Err(RunnerError::ConfigError("bandwidth must be positive".to_string()));
    }
    let params = TxParams {
        spreading_factor: config.sf,
        bandwidth_hz: config.bw,
        code_redundancy: config.cr,
        use_header: !config.implicit_header,
        ..TxParams::default()
    };
    let timing = timing::signal_timing(&params, config.payload_len, config.preamble, SimTime::ZERO);
    println!("symbol time:      {:>12.1} us", timing::symbol_time_us(config.sf, config.bw));
    println!("preamble:         {:>12} us", timing.preamble_end.as_micros());
    println!("header:           {:>12} us", (timing.header_end - timing.preamble_end).as_micros());
    println!(
        "data:             {:>12} us ({} payload symbols)",
        (timing.end - timing.header_end).as_micros(),
        timing::payload_symbols(&params, config.payload_len)
    );
    println!("time on air:      {:>12} us", timing.duration().as_micros());
    Ok(())
}

fn main() -> Result<(), RunnerError> {
    // Default to "warn" level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(config) => {
            let (stats, node_stats) = run_simulation(&config)?;
            // Stats go to stdout only when metrics are not exported there
            if config.metrics_output.is_none() || config.metrics_file.is_some() {
                let summary = serde_json::json!({
                    "stats": stats,
                    "nodes": node_stats,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Commands::Metrics => print_metrics_info(),
        Commands::Sensitivity => print_sensitivity_table(),
        Commands::Airtime(config) => print_airtime(&config)?,
    }

    Ok(())
}
