//! Completion reaper
//!
//! Drains the completion channel while requests are outstanding. Each
//! completion is matched to its tracked operation by token and finalized;
//! a failed read is reported but still finalized, and a completion for an
//! unknown or stale token is logged and skipped without touching the
//! outstanding count.

use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::backend::{Completion, CompletionNotifier};
use crate::error::{Error, Result};
use crate::stats::EngineStats;
use crate::tracker::{OpStatus, Token, Tracker};

/// How a drain phase ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Operations finalized during the phase
    pub reaped: usize,
    /// Completions whose token matched nothing
    pub stale: usize,
    /// The phase ended on a wait that returned no events
    pub timed_out: bool,
    /// The phase ended on a failed wait call
    pub wait_failed: bool,
}

/// Finalize `token` with a raw completion `result` and account for it.
///
/// # Errors
///
/// [`Error::Correlation`] if the token is not tracked; nothing is changed.
pub(crate) fn settle(
    tracker: &mut Tracker,
    token: Token,
    result: i32,
    outstanding: &mut usize,
    stats: &mut EngineStats,
) -> Result<()> {
    let mut op = tracker.finalize(token)?;
    *outstanding -= 1;
    stats.completed += 1;
    op.complete(result);

    match op.status() {
        OpStatus::CompletedOk(n) => {
            stats.bytes_read += n as u64;
            if n < op.len() {
                stats.short_reads += 1;
                debug!(%token, offset = op.offset(), got = n, want = op.len(), "short read");
            } else {
                trace!(%token, offset = op.offset(), "read complete");
            }
        }
        OpStatus::CompletedError(errno) => {
            let err = Error::Completion { token, errno };
            warn!(target_id = op.target().index(), offset = op.offset(), "{err}");
            stats.record_error(&err);
        }
        _ => {}
    }
    // op drops here, releasing its buffer
    Ok(())
}

/// Drain loop state: timeout, per-wait cap and a reusable event buffer.
#[derive(Debug)]
pub struct Reaper {
    timeout: Duration,
    max_events: usize,
    events: Vec<Completion>,
}

impl Reaper {
    /// Create a reaper.
    #[must_use]
    pub fn new(timeout: Duration, max_events: usize) -> Self {
        Self { timeout, max_events, events: Vec::with_capacity(max_events) }
    }

    /// Wait timeout per iteration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one drain phase.
    ///
    /// Repeats until `outstanding` reaches zero, a wait times out with no
    /// events, or the wait call fails.
    pub fn drain<N: CompletionNotifier + ?Sized>(
        &mut self,
        tracker: &mut Tracker,
        notifier: &mut N,
        outstanding: &mut usize,
        stats: &mut EngineStats,
    ) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();

        while *outstanding > 0 {
            self.events.clear();
            match notifier.wait(self.timeout, self.max_events, &mut self.events) {
                Err(e) => {
                    let err = Error::Wait(e);
                    error!(outstanding = *outstanding, "{err}");
                    stats.record_error(&err);
                    outcome.wait_failed = true;
                    break;
                }
                Ok(0) => {
                    stats.wait_timeouts += 1;
                    outcome.timed_out = true;
                    break;
                }
                Ok(_) => {
                    for completion in self.events.drain(..) {
                        let Completion { token, result } = completion;
                        match settle(tracker, token, result, outstanding, stats) {
                            Ok(()) => outcome.reaped += 1,
                            Err(err) => {
                                warn!(result, "{err}");
                                stats.record_error(&err);
                                outcome.stale += 1;
                            }
                        }
                    }
                }
            }
        }

        debug!(
            reaped = outcome.reaped,
            stale = outcome.stale,
            outstanding = *outstanding,
            timed_out = outcome.timed_out,
            "drain phase"
        );
        outcome
    }
}
