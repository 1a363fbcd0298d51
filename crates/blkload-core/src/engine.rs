//! Request lifecycle engine
//!
//! One control loop alternates a submission phase and a drain phase:
//!
//! 1. **Submit**: fill a batch with random aligned reads until the batch
//!    limit or the admission bound is hit, then issue it with a single
//!    non-blocking group-submit call. A rejected batch goes to the
//!    reconciler.
//! 2. **Drain**: while requests are outstanding, wait for completions with a
//!    bounded timeout and finalize them.
//!
//! The outstanding count is incremented as soon as an operation is created,
//! before the backend accepts it, and always equals the tracker's size
//! between phases. The stop signal is checked before every phase; on stop,
//! admission ends and outstanding requests are drained for up to
//! `shutdown_timeout`, then abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, ReadRequest};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::reaper::{DrainOutcome, Reaper};
use crate::reconcile::{reconcile, ReconcileReport};
use crate::stats::{EngineStats, RunSummary};
use crate::target::{Target, TargetId, TargetRegistry};
use crate::tracker::{OpStatus, Token, Tracker};

/// Cross-thread stop flag, set from a signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Fresh, unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for handing to a signal handler.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Pick an offset uniformly from `{0, block, 2*block, ...}` such that a
/// `block_size` read stays inside `total_size`.
///
/// Returns `None` when no whole block fits (`block_size` is zero or larger
/// than `total_size`).
#[inline]
pub fn aligned_offset<R: Rng + ?Sized>(
    rng: &mut R,
    total_size: u64,
    block_size: usize,
) -> Option<u64> {
    let block = block_size as u64;
    let blocks = total_size.checked_div(block)?;
    if blocks == 0 {
        return None;
    }
    Some(rng.random_range(0..blocks) * block)
}

/// Asynchronous read load engine over a backend `B`.
pub struct Engine<B: Backend> {
    config: EngineConfig,
    registry: TargetRegistry,
    tracker: Tracker,
    backend: B,
    reaper: Reaper,
    rng: StdRng,
    outstanding: usize,
    batch: Vec<Token>,
    requests: Vec<ReadRequest>,
    stats: EngineStats,
    finished: bool,
}

impl<B: Backend> std::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("targets", &self.registry.len())
            .field("outstanding", &self.outstanding)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Engine<B> {
    /// Build an engine over opened targets.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a config that fails validation, an empty
    /// registry, or a target whose block size cannot be issued as one read.
    pub fn new(config: EngineConfig, registry: TargetRegistry, backend: B) -> Result<Self> {
        config.validate().map_err(|reason| Error::InvalidConfig(reason.into()))?;
        if registry.is_empty() {
            return Err(Error::InvalidConfig("no targets registered".into()));
        }
        if let Some(target) = registry.iter().find(|t| u32::try_from(t.block_size()).is_err()) {
            return Err(Error::InvalidConfig(format!(
                "block size {} of {} does not fit one read",
                target.block_size(),
                target.path().display()
            )));
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            tracker: Tracker::with_limit(config.max_outstanding),
            reaper: Reaper::new(config.wait_timeout, config.max_events),
            batch: Vec::with_capacity(config.batch_limit),
            requests: Vec::with_capacity(config.batch_limit),
            config,
            registry,
            backend,
            rng,
            outstanding: 0,
            stats: EngineStats::default(),
            finished: false,
        })
    }

    /// Cap the operation record pool below the admission bound.
    #[cfg(test)]
    fn with_record_limit(mut self, limit: usize) -> Self {
        self.tracker = Tracker::with_limit(limit);
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered targets.
    #[must_use]
    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Tracked operations.
    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably (for scripting test backends between phases).
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Requests counted as outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Choose a target uniformly at random.
    pub fn pick_target(&mut self) -> Option<TargetId> {
        self.registry.pick(&mut self.rng).map(Target::id)
    }

    /// Run one submission phase. Returns the number of requests in the batch.
    pub fn submit_phase(&mut self) -> usize {
        while self.outstanding < self.config.max_outstanding
            && self.batch.len() < self.config.batch_limit
        {
            let Some(target) = self.registry.pick(&mut self.rng) else { break };
            let id = target.id();
            let Some(offset) =
                aligned_offset(&mut self.rng, target.total_size(), target.block_size())
            else {
                break;
            };

            match self.tracker.create(id, offset, target.block_size()) {
                Ok(token) => {
                    self.batch.push(token);
                    self.outstanding += 1;
                }
                Err(err) => {
                    debug!(outstanding = self.outstanding, "{err}; batch closed early");
                    self.stats.record_error(&err);
                    break;
                }
            }
        }

        if self.batch.is_empty() {
            return 0;
        }

        for &token in &self.batch {
            let Some(op) = self.tracker.get_mut(token) else { continue };
            let fd = self.registry.get(op.target()).and_then(|t| t.raw_fd());
            self.requests.push(ReadRequest {
                token,
                fd,
                offset: op.offset(),
                len: op.len() as u32,
                buf: op.buffer_ptr(),
            });
        }

        let size = self.batch.len();
        self.stats.batches += 1;
        match self.backend.issue_batch(&self.requests) {
            Ok(()) => {
                for &token in &self.batch {
                    if let Some(op) = self.tracker.get_mut(token) {
                        op.set_status(OpStatus::InFlight);
                    }
                }
                self.stats.submitted += size as u64;
                trace!(size, outstanding = self.outstanding, "batch submitted");
            }
            Err(e) => {
                self.stats.rejected_batches += 1;
                warn!(size, error = %e, "batch submission failed; reconciling");
                let report: ReconcileReport = reconcile(
                    &mut self.tracker,
                    &mut self.backend,
                    &self.batch,
                    &mut self.outstanding,
                    &mut self.stats,
                );
                self.stats.submitted += report.accepted() as u64;
            }
        }

        self.batch.clear();
        self.requests.clear();
        debug_assert_eq!(self.tracker.len(), self.outstanding);
        size
    }

    /// Run one drain phase.
    pub fn drain_phase(&mut self) -> DrainOutcome {
        let outcome = self.reaper.drain(
            &mut self.tracker,
            &mut self.backend,
            &mut self.outstanding,
            &mut self.stats,
        );
        debug_assert_eq!(self.tracker.len(), self.outstanding);
        outcome
    }

    /// Run until `stop` is set or a configured limit is reached, then shut
    /// down.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if the engine has already been run.
    pub fn run(&mut self, stop: &StopSignal) -> Result<RunSummary> {
        if self.finished {
            return Err(Error::InvalidConfig("engine has already run".into()));
        }

        let start = Instant::now();
        let mut last_report = start;
        let mut reported = self.stats;

        info!(
            targets = self.registry.len(),
            max_outstanding = self.config.max_outstanding,
            batch_limit = self.config.batch_limit,
            max_events = self.config.max_events,
            wait_us = self.config.wait_timeout.as_micros() as u64,
            "run started"
        );

        loop {
            if self.should_stop(stop, start) {
                break;
            }
            let batch = self.submit_phase();

            if self.should_stop(stop, start) {
                break;
            }
            if self.outstanding > 0 {
                let outcome = self.drain_phase();
                debug!(batch, reaped = outcome.reaped, outstanding = self.outstanding, "cycle");
            }

            if let Some(interval) = self.config.report_interval {
                let since = last_report.elapsed();
                if since >= interval {
                    self.report_progress(&reported, since);
                    reported = self.stats;
                    last_report = Instant::now();
                }
            }
        }

        let abandoned = self.shutdown();
        let summary = RunSummary::new(self.stats, start.elapsed(), abandoned);
        info!(
            completed = summary.stats.completed,
            iops = summary.iops as u64,
            mib_per_sec = summary.mib_per_sec,
            errors = summary.stats.errors(),
            abandoned,
            "run finished"
        );
        Ok(summary)
    }

    fn should_stop(&self, stop: &StopSignal, start: Instant) -> bool {
        if stop.is_stopped() {
            return true;
        }
        let limits = &self.config.limits;
        if limits.duration.is_some_and(|d| start.elapsed() >= d) {
            return true;
        }
        limits.max_completions.is_some_and(|n| self.stats.completed >= n)
    }

    fn report_progress(&self, earlier: &EngineStats, since: Duration) {
        let delta = self.stats.since(earlier);
        info!(
            iops = delta.iops(since) as u64,
            mib_per_sec = delta.mib_per_sec(since),
            outstanding = self.outstanding,
            errors = delta.errors(),
            total = self.stats.completed,
            "progress"
        );
    }

    /// Drain for up to `shutdown_timeout`, abandon the rest, close targets.
    fn shutdown(&mut self) -> usize {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        debug!(outstanding = self.outstanding, "shutting down");

        while self.outstanding > 0 && Instant::now() < deadline {
            self.drain_phase();
        }

        let abandoned = if self.outstanding > 0 {
            let abandoned = self.tracker.abandon();
            warn!(abandoned, "requests still in flight at shutdown; buffers leaked");
            self.outstanding = 0;
            abandoned
        } else {
            0
        };

        self.registry.close_all();
        self.finished = true;
        abandoned
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        // Buffers of in-flight reads must outlive the kernel's writes.
        if self.outstanding > 0 {
            self.tracker.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunLimits;
    use crate::scripted::{ScriptedBackend, ScriptedStatus};
    use nix::libc;

    fn engine(config: EngineConfig, targets: &[(u64, usize)]) -> Engine<ScriptedBackend> {
        let mut registry = TargetRegistry::new();
        for (i, &(size, block)) in targets.iter().enumerate() {
            registry.register_detached(format!("mem{i}"), size, block).unwrap();
        }
        Engine::new(config, registry, ScriptedBackend::new()).unwrap()
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            block_size: 512,
            max_outstanding: 8,
            batch_limit: 4,
            shutdown_timeout: Duration::from_millis(20),
            report_interval: None,
            seed: Some(7),
            ..EngineConfig::default()
        }
    }

    // ========================================================================
    // Construction Tests
    // ========================================================================

    #[test]
    fn test_new_rejects_empty_registry() {
        let err = Engine::new(small_config(), TargetRegistry::new(), ScriptedBackend::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut registry = TargetRegistry::new();
        registry.register_detached("mem0", 4096, 512).unwrap();
        let config = small_config().with_max_outstanding(0);
        let err = Engine::new(config, registry, ScriptedBackend::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    // ========================================================================
    // Submission Phase Tests
    // ========================================================================

    #[test]
    fn test_submit_phase_respects_batch_limit() {
        let mut e = engine(small_config(), &[(1 << 20, 512)]);
        assert_eq!(e.submit_phase(), 4);
        assert_eq!(e.outstanding(), 4);
        assert_eq!(e.tracker().len(), 4);
        assert_eq!(e.backend().batches(), 1);
    }

    #[test]
    fn test_submit_phase_respects_admission_bound() {
        let mut e = engine(small_config(), &[(1 << 20, 512)]);
        e.backend_mut().hold_completions(true);
        e.submit_phase();
        e.submit_phase();
        assert_eq!(e.outstanding(), 8);

        // Bound reached: nothing is created, nothing is submitted
        assert_eq!(e.submit_phase(), 0);
        assert_eq!(e.outstanding(), 8);
        assert_eq!(e.backend().batches(), 2);
    }

    #[test]
    fn test_submitted_requests_are_aligned_and_in_bounds() {
        let mut e = engine(small_config(), &[(4096, 512), (8192, 1024)]);
        for _ in 0..50 {
            e.submit_phase();
            e.drain_phase();
        }
        for read in e.backend().issued() {
            let len = u64::from(read.len);
            assert_eq!(read.offset % len, 0);
            let total = if len == 512 { 4096 } else { 8192 };
            assert!(read.offset + len <= total);
        }
    }

    #[test]
    fn test_allocation_failure_closes_batch_early() {
        let mut e = engine(small_config(), &[(1 << 20, 512)]).with_record_limit(6);
        e.backend_mut().hold_completions(true);
        assert_eq!(e.submit_phase(), 4);

        // Two records left: the batch closes after them
        assert_eq!(e.submit_phase(), 2);
        assert_eq!(e.stats().allocation_failures, 1);
        assert_eq!(e.outstanding(), 6);
        assert_eq!(e.tracker().len(), 6);
        assert_eq!(e.stats().submitted, 6);
        assert_eq!(e.backend().batches(), 2);

        // Pool exhausted: nothing is counted, nothing is issued
        assert_eq!(e.submit_phase(), 0);
        assert_eq!(e.stats().allocation_failures, 2);
        assert_eq!(e.outstanding(), 6);
        assert_eq!(e.backend().batches(), 2);

        e.backend_mut().hold_completions(false);
        e.drain_phase();
        assert_eq!(e.outstanding(), 0);

        // Records freed: the next phase fills the batch again
        assert_eq!(e.submit_phase(), 4);
        assert_eq!(e.outstanding(), 4);
        assert_eq!(e.tracker().len(), 4);
    }

    #[test]
    fn test_rejected_batch_is_reconciled() {
        let mut e = engine(small_config(), &[(1 << 20, 512)]);
        e.backend_mut().hold_completions(true);
        e.backend_mut().reject_next_batch(vec![
            ScriptedStatus::InProgress,
            ScriptedStatus::NeverQueued(libc::EAGAIN),
        ]);

        assert_eq!(e.submit_phase(), 4);
        assert_eq!(e.outstanding(), 3);
        assert_eq!(e.tracker().len(), 3);
        assert_eq!(e.stats().rejected_batches, 1);
        assert_eq!(e.stats().submitted, 3);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let offsets = |seed| {
            let mut e = engine(small_config().with_seed(seed), &[(1 << 20, 512)]);
            e.submit_phase();
            e.backend().issued().iter().map(|r| r.offset).collect::<Vec<_>>()
        };
        assert_eq!(offsets(11), offsets(11));
    }

    // ========================================================================
    // Run Loop Tests
    // ========================================================================

    #[test]
    fn test_run_until_max_completions() {
        let config = small_config().with_limits(RunLimits::completions(100));
        let mut e = engine(config, &[(1 << 20, 512)]);

        let summary = e.run(&StopSignal::new()).unwrap();
        assert!(summary.stats.completed >= 100);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(e.outstanding(), 0);
        assert!(e.tracker().is_empty());
        assert!(e.registry().iter().all(|t| t.raw_fd().is_none()));
    }

    #[test]
    fn test_run_with_stop_already_set() {
        let mut e = engine(small_config(), &[(1 << 20, 512)]);
        let stop = StopSignal::new();
        stop.stop();

        let summary = e.run(&stop).unwrap();
        assert_eq!(summary.stats.submitted, 0);
        assert_eq!(e.backend().batches(), 0);
    }

    #[test]
    fn test_run_abandons_after_shutdown_timeout() {
        let config = small_config().with_limits(RunLimits::duration(Duration::from_millis(5)));
        let mut e = engine(config, &[(1 << 20, 512)]);
        e.backend_mut().hold_completions(true);

        let summary = e.run(&StopSignal::new()).unwrap();
        assert_eq!(summary.abandoned, 8);
        assert_eq!(e.outstanding(), 0);
        assert!(e.tracker().is_empty());
    }

    #[test]
    fn test_run_twice_is_error() {
        let config = small_config().with_limits(RunLimits::completions(1));
        let mut e = engine(config, &[(4096, 512)]);
        e.run(&StopSignal::new()).unwrap();
        assert!(matches!(e.run(&StopSignal::new()), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_aligned_offset_domain() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let offset = aligned_offset(&mut rng, 1000, 256).unwrap();
            assert!(matches!(offset, 0 | 256 | 512));
        }
    }

    #[test]
    fn test_aligned_offset_no_whole_block() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(aligned_offset(&mut rng, 4096, 0), None);
        assert_eq!(aligned_offset(&mut rng, 511, 512), None);
        assert_eq!(aligned_offset(&mut rng, 512, 512), Some(0));
    }

    #[test]
    fn test_stop_signal_shared_flag() {
        let stop = StopSignal::new();
        let flag = stop.flag();
        flag.store(true, Ordering::SeqCst);
        assert!(stop.clone().is_stopped());
    }
}
