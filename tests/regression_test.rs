//! Scenario tests for batch rejection, timeouts, stale completions and
//! shutdown

use blkload::{
    Completion, Engine, EngineConfig, Error, OpStatus, RunLimits, ScriptedBackend,
    ScriptedStatus, StopSignal, TargetRegistry, Token, Tracker,
};
use std::time::Duration;

const EAGAIN: i32 = 11;

fn engine(max_outstanding: usize, batch_limit: usize) -> Engine<ScriptedBackend> {
    engine_with_limits(max_outstanding, batch_limit, RunLimits::unbounded())
}

fn engine_with_limits(
    max_outstanding: usize,
    batch_limit: usize,
    limits: RunLimits,
) -> Engine<ScriptedBackend> {
    let mut registry = TargetRegistry::new();
    registry.register_detached("mem0", 1 << 20, 4096).unwrap();
    let config = EngineConfig {
        block_size: 4096,
        max_outstanding,
        batch_limit,
        report_interval: None,
        shutdown_timeout: Duration::from_millis(20),
        limits,
        seed: Some(1),
        ..EngineConfig::default()
    };
    Engine::new(config, registry, ScriptedBackend::new()).unwrap()
}

// ============================================================================
// Batch Rejection
// ============================================================================

#[test]
fn test_rejected_batch_finalizes_only_never_queued_member() {
    let mut e = engine(4, 4);
    e.backend_mut().hold_completions(true);
    e.backend_mut().reject_next_batch(vec![
        ScriptedStatus::InProgress,
        ScriptedStatus::InProgress,
        ScriptedStatus::NeverQueued(EAGAIN),
        ScriptedStatus::InProgress,
    ]);

    assert_eq!(e.submit_phase(), 4);

    assert_eq!(e.outstanding(), 3);
    let issued: Vec<Token> = e.backend().issued().iter().map(|r| r.token).collect();
    assert_eq!(issued.len(), 3);
    for token in &issued {
        assert_eq!(e.tracker().get(*token).unwrap().status(), OpStatus::InFlight);
    }
    assert_eq!(e.tracker().len(), 3);
    assert_eq!(e.stats().submission_errors, 1);

    // The survivors complete normally later
    e.backend_mut().hold_completions(false);
    e.drain_phase();
    assert_eq!(e.outstanding(), 0);
    assert_eq!(e.stats().completed, 3);
}

#[test]
fn test_rejected_batch_with_completed_race() {
    let mut e = engine(4, 4);
    e.backend_mut().hold_completions(true);
    e.backend_mut().reject_next_batch(vec![
        ScriptedStatus::CompletedOk,
        ScriptedStatus::CompletedError(5),
        ScriptedStatus::NeverQueued(EAGAIN),
        ScriptedStatus::InProgress,
    ]);

    e.submit_phase();
    assert_eq!(e.outstanding(), 1);
    assert_eq!(e.tracker().len(), 1);
    assert_eq!(e.stats().completed, 2);
    assert_eq!(e.stats().completion_errors, 1);
    assert_eq!(e.stats().submission_errors, 1);
}

#[test]
fn test_next_batch_starts_empty_after_rejection() {
    let mut e = engine(8, 4);
    e.backend_mut().hold_completions(true);
    e.backend_mut().reject_next_batch(vec![ScriptedStatus::NeverQueued(EAGAIN); 4]);

    e.submit_phase();
    assert_eq!(e.outstanding(), 0);

    // A fresh batch of exactly batch_limit requests, nothing carried over
    assert_eq!(e.submit_phase(), 4);
    assert_eq!(e.outstanding(), 4);
    assert_eq!(e.backend().issued().len(), 4);
}

// ============================================================================
// Completion Draining
// ============================================================================

#[test]
fn test_wait_timeout_leaves_state_unchanged() {
    let mut e = engine(8, 8);
    e.backend_mut().hold_completions(true);
    e.submit_phase();

    let before: Vec<Token> = e.tracker().tokens().collect();
    let outcome = e.drain_phase();

    assert!(outcome.timed_out);
    assert_eq!(outcome.reaped, 0);
    assert_eq!(e.outstanding(), 8);
    assert_eq!(e.tracker().tokens().collect::<Vec<_>>(), before);
}

#[test]
fn test_wait_failure_does_not_stop_engine() {
    let mut e = engine(8, 8);
    e.submit_phase();
    e.backend_mut().fail_next_wait(9);

    let outcome = e.drain_phase();
    assert!(outcome.wait_failed);
    assert_eq!(e.outstanding(), 8);

    e.drain_phase();
    assert_eq!(e.outstanding(), 0);
    assert_eq!(e.stats().wait_failures, 1);
}

#[test]
fn test_stale_completion_ignored() {
    let mut e = engine(2, 2);
    e.backend_mut().hold_completions(true);
    e.submit_phase();

    let live = e.tracker().tokens().next().unwrap();
    let stale = Token::new(live.index(), live.generation().wrapping_add(1));
    e.backend_mut().inject(Completion { token: stale, result: 4096 });

    e.drain_phase();
    assert_eq!(e.outstanding(), 2);
    assert_eq!(e.tracker().len(), 2);
    assert_eq!(e.stats().correlation_errors, 1);
}

#[test]
fn test_duplicate_completion_counted_once() {
    let mut e = engine(1, 1);
    e.backend_mut().hold_completions(true);
    e.submit_phase();
    let token = e.tracker().tokens().next().unwrap();

    e.backend_mut().inject(Completion { token, result: 4096 });
    e.backend_mut().inject(Completion { token, result: 4096 });
    e.drain_phase();

    assert_eq!(e.outstanding(), 0);
    assert_eq!(e.stats().completed, 1);
    assert_eq!(e.stats().correlation_errors, 1);
}

#[test]
fn test_double_finalize_is_correlation_error() {
    let mut tracker = Tracker::new();
    let token = tracker.create(blkload::TargetId::new(0), 0, 4096).unwrap();
    drop(tracker.finalize(token).unwrap());
    assert!(matches!(tracker.finalize(token), Err(Error::Correlation { .. })));
}

// ============================================================================
// Run Bounds and Shutdown
// ============================================================================

#[test]
fn test_max_completions_drains_to_zero() {
    let mut e = engine_with_limits(32, 8, RunLimits::completions(500));

    let summary = e.run(&StopSignal::new()).unwrap();
    assert!(summary.stats.completed >= 500);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(e.outstanding(), 0);
    assert!(e.tracker().is_empty());
}

#[test]
fn test_stop_before_start_submits_nothing() {
    let mut e = engine(32, 8);
    let stop = StopSignal::new();
    stop.stop();

    let summary = e.run(&stop).unwrap();
    assert_eq!(summary.stats.submitted, 0);
    assert_eq!(summary.stats.batches, 0);
    assert!(e.backend().issued().is_empty());
}

#[test]
fn test_stuck_requests_abandoned_on_shutdown() {
    let mut e = engine(16, 16);
    e.backend_mut().hold_completions(true);
    e.submit_phase();

    let stop = StopSignal::new();
    stop.stop();
    let summary = e.run(&stop).unwrap();

    assert_eq!(summary.abandoned, 16);
    assert_eq!(e.outstanding(), 0);
    assert!(e.tracker().is_empty());
    assert!(e.registry().iter().all(|t| t.raw_fd().is_none()));
}
