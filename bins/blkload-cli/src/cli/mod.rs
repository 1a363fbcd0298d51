//! CLI module for blkload
//!
//! Maps command-line flags onto [`EngineConfig`].

pub mod run;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use blkload_core::{EngineConfig, RunLimits};
use clap::Parser;

/// blkload - random-read storage load generator
#[derive(Parser, Debug)]
#[command(name = "blkload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Block devices or files to read from
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<PathBuf>,

    /// Read size and alignment (e.g., 4K, 128K, 1M)
    #[arg(short, long, default_value = "128K")]
    pub block_size: String,

    /// Maximum reads in flight
    #[arg(short = 'q', long, default_value = "512")]
    pub max_outstanding: usize,

    /// Maximum reads per submit call
    #[arg(long = "batch", default_value = "256")]
    pub batch_limit: usize,

    /// Maximum completions reaped per wait
    #[arg(long, default_value = "32")]
    pub max_events: usize,

    /// Completion wait timeout in microseconds
    #[arg(long, default_value = "500")]
    pub wait_us: u64,

    /// Stop after this many seconds
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// Stop after this many completed reads
    #[arg(short = 'n', long)]
    pub max_ops: Option<u64>,

    /// Seed for a reproducible request sequence
    #[arg(long)]
    pub seed: Option<u64>,

    /// Open targets without O_DIRECT
    #[arg(long)]
    pub buffered: bool,

    /// Progress report interval in seconds (0 disables)
    #[arg(long, default_value = "1")]
    pub report_secs: u64,

    /// Print the final summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Build the engine configuration from the parsed flags.
    pub fn to_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let block_size = parse_size(&self.block_size)
            .with_context(|| format!("Invalid block size: {}", self.block_size))?;
        let block_size = usize::try_from(block_size).context("Block size too large")?;

        let duration = match self.duration {
            Some(secs) if !secs.is_finite() || secs <= 0.0 => {
                bail!("Duration must be a positive number of seconds, got {secs}")
            }
            Some(secs) => Some(Duration::from_secs_f64(secs)),
            None => None,
        };

        let config = EngineConfig {
            block_size,
            max_outstanding: self.max_outstanding,
            batch_limit: self.batch_limit,
            max_events: self.max_events,
            wait_timeout: Duration::from_micros(self.wait_us),
            report_interval: (self.report_secs > 0).then(|| Duration::from_secs(self.report_secs)),
            limits: RunLimits { duration, max_completions: self.max_ops },
            seed: self.seed,
            ..EngineConfig::default()
        };

        if let Err(reason) = config.validate() {
            bail!("Invalid configuration: {reason}");
        }
        Ok(config)
    }
}

/// Parse size string (e.g., "4K", "128K", "1G", "2T", "512B")
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim().to_uppercase();
    let (num, multiplier) = if s.ends_with("T") || s.ends_with("TIB") {
        (s.trim_end_matches("TIB").trim_end_matches("T"), 1u64 << 40)
    } else if s.ends_with("G") || s.ends_with("GIB") {
        (s.trim_end_matches("GIB").trim_end_matches("G"), 1u64 << 30)
    } else if s.ends_with("M") || s.ends_with("MIB") {
        (s.trim_end_matches("MIB").trim_end_matches("M"), 1u64 << 20)
    } else if s.ends_with("K") || s.ends_with("KIB") {
        (s.trim_end_matches("KIB").trim_end_matches("K"), 1u64 << 10)
    } else {
        (s.trim_end_matches("B"), 1u64)
    };

    let num: u64 = num.trim().parse()?;
    num.checked_mul(multiplier).context("Size overflows 64 bits")
}

/// Format bytes as human-readable string
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1}T", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}
