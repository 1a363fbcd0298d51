//! Error reconciler
//!
//! Runs only when a group-submit call fails. Each member of the rejected
//! batch is classified by its individual status:
//!
//! | status          | action                                   |
//! |-----------------|------------------------------------------|
//! | in progress     | stays tracked, count unchanged           |
//! | never queued    | finalized, count - 1, submission error   |
//! | completed ok    | finalized, count - 1                     |
//! | completed error | finalized, count - 1, completion error   |
//!
//! No member is left both rejected and tracked.

use std::io;

use tracing::{debug, warn};

use crate::backend::{RequestStatus, Submitter};
use crate::error::Error;
use crate::reaper::settle;
use crate::stats::EngineStats;
use crate::tracker::{OpStatus, Token, Tracker};

/// Per-status tally of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Left tracked
    pub in_progress: usize,
    /// Finalized as rejected
    pub never_queued: usize,
    /// Finalized as already completed (ok or error)
    pub completed: usize,
    /// Members that were not tracked
    pub untracked: usize,
}

impl ReconcileReport {
    /// Members the backend accepted.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.in_progress + self.completed
    }
}

/// Classify every member of a rejected `batch`.
pub fn reconcile<S: Submitter + ?Sized>(
    tracker: &mut Tracker,
    submitter: &mut S,
    batch: &[Token],
    outstanding: &mut usize,
    stats: &mut EngineStats,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for &token in batch {
        match submitter.status(token) {
            RequestStatus::InProgress => match tracker.get_mut(token) {
                Some(op) => {
                    op.set_status(OpStatus::InFlight);
                    report.in_progress += 1;
                }
                None => report.untracked += 1,
            },
            RequestStatus::NeverQueued(errno) => match tracker.finalize(token) {
                Ok(mut op) => {
                    op.set_status(OpStatus::Rejected);
                    *outstanding -= 1;
                    let source = io::Error::from_raw_os_error(errno);
                    let err = Error::Submission { token, source };
                    warn!(offset = op.offset(), "{err}");
                    stats.record_error(&err);
                    report.never_queued += 1;
                }
                Err(err) => {
                    stats.record_error(&err);
                    report.untracked += 1;
                }
            },
            RequestStatus::Completed(result) => {
                match settle(tracker, token, result, outstanding, stats) {
                    Ok(()) => report.completed += 1,
                    Err(err) => {
                        stats.record_error(&err);
                        report.untracked += 1;
                    }
                }
            }
        }
    }

    debug!(
        batch = batch.len(),
        in_progress = report.in_progress,
        never_queued = report.never_queued,
        completed = report.completed,
        outstanding = *outstanding,
        "reconciled rejected batch"
    );
    report
}
