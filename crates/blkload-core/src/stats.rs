//! Run statistics
//!
//! The engine is single-threaded, so counters are plain integers. A
//! [`RunSummary`] is produced at the end of every run.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;

const MIB: f64 = 1024.0 * 1024.0;

/// Counters maintained by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Requests handed to the backend
    pub submitted: u64,
    /// Requests finalized after a completion (ok or error)
    pub completed: u64,
    /// Bytes read by successful completions
    pub bytes_read: u64,
    /// Successful completions shorter than the request
    pub short_reads: u64,
    /// Group-submit calls
    pub batches: u64,
    /// Group-submit calls that failed
    pub rejected_batches: u64,
    /// Creates refused by the tracker
    pub allocation_failures: u64,
    /// Requests rejected before acceptance
    pub submission_errors: u64,
    /// Reads that finished with an error
    pub completion_errors: u64,
    /// Completions for unknown or stale tokens
    pub correlation_errors: u64,
    /// Wait calls that failed
    pub wait_failures: u64,
    /// Wait calls that returned no events
    pub wait_timeouts: u64,
}

impl EngineStats {
    /// Bump the counter that matches a steady-state error.
    pub fn record_error(&mut self, err: &Error) {
        match err {
            Error::Allocation { .. } => self.allocation_failures += 1,
            Error::Submission { .. } => self.submission_errors += 1,
            Error::Completion { .. } => self.completion_errors += 1,
            Error::Correlation { .. } => self.correlation_errors += 1,
            Error::Wait(_) => self.wait_failures += 1,
            Error::Open { .. }
            | Error::Geometry { .. }
            | Error::Backend(_)
            | Error::InvalidConfig(_) => {}
        }
    }

    /// Sum of all steady-state error counters.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.allocation_failures
            + self.submission_errors
            + self.completion_errors
            + self.correlation_errors
            + self.wait_failures
    }

    /// Counter-wise difference from an earlier snapshot.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            submitted: self.submitted.saturating_sub(earlier.submitted),
            completed: self.completed.saturating_sub(earlier.completed),
            bytes_read: self.bytes_read.saturating_sub(earlier.bytes_read),
            short_reads: self.short_reads.saturating_sub(earlier.short_reads),
            batches: self.batches.saturating_sub(earlier.batches),
            rejected_batches: self.rejected_batches.saturating_sub(earlier.rejected_batches),
            allocation_failures: self
                .allocation_failures
                .saturating_sub(earlier.allocation_failures),
            submission_errors: self.submission_errors.saturating_sub(earlier.submission_errors),
            completion_errors: self.completion_errors.saturating_sub(earlier.completion_errors),
            correlation_errors: self
                .correlation_errors
                .saturating_sub(earlier.correlation_errors),
            wait_failures: self.wait_failures.saturating_sub(earlier.wait_failures),
            wait_timeouts: self.wait_timeouts.saturating_sub(earlier.wait_timeouts),
        }
    }

    /// Completions per second over `elapsed`.
    #[must_use]
    pub fn iops(&self, elapsed: Duration) -> f64 {
        per_second(self.completed as f64, elapsed)
    }

    /// Read throughput in MiB/s over `elapsed`.
    #[must_use]
    pub fn mib_per_sec(&self, elapsed: Duration) -> f64 {
        per_second(self.bytes_read as f64 / MIB, elapsed)
    }
}

fn per_second(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        amount / secs
    }
}

/// Final report of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Wall time from start to the end of shutdown
    pub elapsed_secs: f64,
    /// Completions per second
    pub iops: f64,
    /// Read throughput
    pub mib_per_sec: f64,
    /// Requests left behind when shutdown timed out
    pub abandoned: usize,
    /// Counters
    #[serde(flatten)]
    pub stats: EngineStats,
}

impl RunSummary {
    /// Build a summary from final counters.
    #[must_use]
    pub fn new(stats: EngineStats, elapsed: Duration, abandoned: usize) -> Self {
        Self {
            elapsed_secs: elapsed.as_secs_f64(),
            iops: stats.iops(elapsed),
            mib_per_sec: stats.mib_per_sec(elapsed),
            abandoned,
            stats,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "elapsed:       {:.3} s", self.elapsed_secs)?;
        writeln!(f, "completed:     {} ({:.0} IOPS)", s.completed, self.iops)?;
        writeln!(f, "bytes read:    {} ({:.1} MiB/s)", s.bytes_read, self.mib_per_sec)?;
        writeln!(
            f,
            "submitted:     {} in {} batches ({} rejected)",
            s.submitted, s.batches, s.rejected_batches
        )?;
        writeln!(f, "short reads:   {}", s.short_reads)?;
        write!(
            f,
            "errors:        alloc={} submit={} read={} stale={} wait={} (timeouts={})",
            s.allocation_failures,
            s.submission_errors,
            s.completion_errors,
            s.correlation_errors,
            s.wait_failures,
            s.wait_timeouts
        )?;
        if self.abandoned > 0 {
            write!(f, "\nabandoned:     {}", self.abandoned)?;
        }
        Ok(())
    }
}
