//! Count Replay - offline counting over recorded tracker output
//!
//! Reads a JSONL file with one tracker message per line and runs the same
//! windowed counter as traffic-counter, using frame timestamps as the clock.
//!
//! Usage:
//!   count-replay --input capture.jsonl
//!   count-replay --input capture.jsonl --output counts.jsonl --window-ms 5000

use anyhow::{bail, Context};
use clap::Parser;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

use traffic_counter::domain::types::Category;
use traffic_counter::infra::{ClockMode, Config, Metrics};
use traffic_counter::io::{parse_tracker_message, Egress};
use traffic_counter::services::CountAggregator;

/// Count Replay - run the windowed counter over a recorded capture
#[derive(Parser, Debug)]
#[command(name = "count-replay", version, about, long_about = None)]
struct Args {
    /// JSONL file of tracker messages
    #[arg(short, long)]
    input: String,

    /// JSONL file snapshots are appended to
    #[arg(short, long, default_value = "replay_counts.jsonl")]
    output: String,

    /// Path to TOML configuration file
    ///
    /// Supplies categories, class map, and site id. Must exist when given.
    #[arg(short, long)]
    config: Option<String>,

    /// Window length override in milliseconds
    #[arg(short, long)]
    window_ms: Option<u64>,

    /// Retention override in windows
    #[arg(short, long)]
    retention: Option<usize>,
}

/// Counts accumulated over a replay
#[derive(Debug, Default)]
struct ReplayStats {
    lines: u64,
    invalid_lines: u64,
    frames: u64,
    windows: u64,
    totals: [u64; Category::ALL.len()],
}

impl ReplayStats {
    fn add_snapshot(&mut self, snapshot: &traffic_counter::domain::snapshot::CountSnapshot) {
        self.windows += 1;
        for (category, count) in &snapshot.counts {
            self.totals[category.index()] += count;
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let window_ms = args.window_ms.unwrap_or(config.window_ms());
    let retention = args.retention.unwrap_or(config.retention_windows());
    if window_ms == 0 {
        bail!("--window-ms must be at least 1");
    }
    if retention == 0 {
        bail!("--retention must be at least 1");
    }

    config = config
        .with_clock_mode(ClockMode::Stream)
        .with_window(window_ms, retention)
        .with_egress_file(&args.output);
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "count_replay_starting");

    let args = Args::parse();
    let config = build_config(&args)?;

    info!(
        input = %args.input,
        output = %args.output,
        window_ms = %config.window_ms(),
        retention_windows = %config.retention_windows(),
        categories = ?config.categories(),
        "replay_config_loaded"
    );

    let file =
        File::open(&args.input).with_context(|| format!("Failed to open input {}", args.input))?;
    let reader = BufReader::new(file);

    let metrics = Arc::new(Metrics::new());
    let egress = Egress::new(config.egress_file()).with_site(config.site_id());
    let mut aggregator = CountAggregator::with_egress(&config, metrics.clone(), egress, None);

    let started = Instant::now();
    let mut stats = ReplayStats::default();
    // Frames without a timestamp inherit the previous frame time
    let mut last_frame_ms = 0u64;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let parsed = match parse_tracker_message(
            &line,
            config.category_map(),
            Instant::now(),
            last_frame_ms,
        ) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(line = %(line_no + 1), error = %e, "replay_line_invalid");
                stats.invalid_lines += 1;
                continue;
            }
        };
        metrics.record_observations_ignored(parsed.ignored);

        for batch in parsed.batches {
            stats.frames += 1;
            last_frame_ms = last_frame_ms.max(batch.frame_time_ms);
            if let Some(snapshot) = aggregator.process_batch(batch) {
                stats.add_snapshot(&snapshot);
            }
        }
    }

    if let Some(snapshot) = aggregator.finish() {
        stats.add_snapshot(&snapshot);
    }

    let totals: Vec<String> = Category::ALL
        .iter()
        .map(|c| format!("{}={}", c, stats.totals[c.index()]))
        .collect();

    info!(
        lines = %stats.lines,
        invalid_lines = %stats.invalid_lines,
        frames = %stats.frames,
        windows = %stats.windows,
        history_windows = %aggregator.counter().history_len(),
        ignored = %metrics.observations_ignored(),
        totals = %totals.join(" "),
        elapsed_ms = %started.elapsed().as_millis(),
        "replay_complete"
    );

    Ok(())
}
