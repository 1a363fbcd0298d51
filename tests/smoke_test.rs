//! Smoke tests for basic functionality

use blkload::{Engine, EngineConfig, RunLimits, StopSignal, TargetRegistry, UringBackend};
use std::io::Write;
use std::time::Duration;

#[test]
fn test_version_exists() {
    // Verify the crate version string is valid semver
    let version = env!("CARGO_PKG_VERSION");
    assert!(!version.is_empty());
    let parts: Vec<&str> = version.split('.').collect();
    assert_eq!(parts.len(), 3, "Version should be semver: {version}");
}

#[test]
fn test_io_uring_run_against_temp_file() {
    let backend = match UringBackend::new(16) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("skipping: io_uring unavailable ({e})");
            return;
        }
    };

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&vec![0x5A; 256 * 1024]).unwrap();
    file.flush().unwrap();

    let mut registry = TargetRegistry::new().direct(false);
    registry.register(file.path(), 4096).unwrap();

    let config = EngineConfig {
        block_size: 4096,
        max_outstanding: 16,
        batch_limit: 4,
        max_events: 8,
        report_interval: None,
        shutdown_timeout: Duration::from_secs(2),
        limits: RunLimits { duration: Some(Duration::from_secs(10)), max_completions: Some(200) },
        seed: Some(42),
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config, registry, backend).unwrap();
    let summary = engine.run(&StopSignal::new()).unwrap();

    assert!(summary.stats.completed >= 200);
    assert_eq!(summary.stats.completion_errors, 0);
    assert_eq!(summary.stats.bytes_read, summary.stats.completed * 4096);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(engine.outstanding(), 0);
}
