//! Run command - open targets, drive the engine, print the summary

use anyhow::{Context, Result};
use blkload_core::{Engine, TargetRegistry, UringBackend};
use tracing::info;

use super::{format_size, Cli};
use crate::signal::install_stop_handler;

pub fn run(cli: Cli) -> Result<()> {
    let config = cli.to_engine_config()?;

    let mut registry = TargetRegistry::new().direct(!cli.buffered);
    for path in &cli.targets {
        registry
            .register(path, config.block_size)
            .with_context(|| format!("Failed to register target {}", path.display()))?;
    }
    for target in registry.iter() {
        info!(
            "{}: {} {} ({} blocks of {})",
            target.path().display(),
            target.kind(),
            format_size(target.total_size()),
            target.block_count(),
            format_size(target.block_size() as u64)
        );
    }

    let entries = u32::try_from(config.max_outstanding).context("Queue depth too large")?;
    let backend = UringBackend::new(entries)
        .map_err(blkload_core::Error::Backend)
        .context("Failed to set up io_uring")?;

    let mut engine = Engine::new(config, registry, backend)?;
    let stop = install_stop_handler()?;
    let summary = engine.run(&stop)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(())
}
