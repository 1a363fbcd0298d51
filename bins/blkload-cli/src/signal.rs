//! Graceful shutdown on SIGINT/SIGTERM.

use std::sync::atomic::Ordering;

use anyhow::Context;
use blkload_core::StopSignal;
use tracing::{info, warn};

/// Install a handler that sets the returned stop signal.
///
/// The first signal asks the engine to stop and drain; a second one exits
/// immediately.
pub fn install_stop_handler() -> anyhow::Result<StopSignal> {
    let stop = StopSignal::new();
    let flag = stop.flag();

    // SIGINT (Ctrl+C) and SIGTERM handler
    ctrlc::set_handler(move || {
        if flag.load(Ordering::Relaxed) {
            // Second signal - force exit
            warn!("Received second interrupt, forcing exit");
            std::process::exit(1);
        }
        info!("Received shutdown signal, draining outstanding reads...");
        flag.store(true, Ordering::Relaxed);
    })
    .context("Failed to set signal handler")?;

    Ok(stop)
}
