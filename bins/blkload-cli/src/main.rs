//! blkload - random-read storage load generator
//!
//! Keeps a fixed number of block-aligned random reads in flight against one
//! or more block devices or files using `io_uring`.
//!
//! # Usage
//!
//! ```bash
//! # 512 outstanding 128K reads against a raw device
//! blkload /dev/nvme0n1
//!
//! # 4K reads, queue depth 64, stop after 30 s, JSON summary
//! blkload -b 4K -q 64 -d 30 --json /dev/sdb /dev/sdc
//!
//! # Per-request tracing
//! RUST_LOG=blkload_core=trace blkload -n 100 ./disk.img --buffered
//! ```

mod cli;
mod signal;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    cli::run::run(cli)
}
