//! I/O backend shims
//!
//! The engine never talks to the kernel directly. It issues reads through a
//! [`Submitter`] and collects results from a [`CompletionNotifier`], so the
//! request lifecycle can be driven by the real `io_uring` backend
//! ([`crate::uring::UringBackend`]) or by the deterministic
//! [`crate::scripted::ScriptedBackend`] in tests.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::tracker::Token;

// ============================================================================
// Request / Completion types
// ============================================================================

/// One asynchronous read handed to a [`Submitter`].
///
/// `buf` points into a buffer owned by a tracked operation. It stays valid
/// until that operation is finalized, which only happens after the backend
/// reports the request completed or never queued.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    /// Correlation token, echoed back on completion
    pub token: Token,
    /// Target descriptor (`None` for detached targets)
    pub fd: Option<RawFd>,
    /// Byte offset
    pub offset: u64,
    /// Bytes to read
    pub len: u32,
    /// Destination buffer
    pub buf: *mut u8,
}

/// Individual status of a request after its batch was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Accepted, or indistinguishable from accepted; a completion will follow.
    InProgress,
    /// Rejected before acceptance; carries a positive errno.
    NeverQueued(i32),
    /// Already finished; carries the raw result (`>= 0` bytes, `< 0` -errno).
    Completed(i32),
}

/// Completion delivered by a [`CompletionNotifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Token of the finished request
    pub token: Token,
    /// Bytes read, or a negated errno
    pub result: i32,
}

// ============================================================================
// Shim traits
// ============================================================================

/// Asynchronous read primitive.
pub trait Submitter {
    /// Issue a group of reads without waiting for any of them.
    ///
    /// `Ok` means every request was accepted. `Err` means the group-submit
    /// call failed; [`Submitter::status`] then reports each member.
    fn issue_batch(&mut self, requests: &[ReadRequest]) -> io::Result<()>;

    /// Issue a single read.
    fn issue(&mut self, request: &ReadRequest) -> io::Result<()> {
        self.issue_batch(std::slice::from_ref(request))
    }

    /// Individual status of a member of the last rejected batch.
    ///
    /// Anything the backend cannot tell apart from "accepted" is reported as
    /// [`RequestStatus::InProgress`].
    fn status(&mut self, token: Token) -> RequestStatus;
}

/// Completion notification channel.
pub trait CompletionNotifier {
    /// Wait up to `timeout` for completions and append at most `max` of them
    /// to `out`.
    ///
    /// Returns the number appended; `Ok(0)` means the wait timed out. `Err`
    /// means the wait call itself failed.
    fn wait(
        &mut self,
        timeout: Duration,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> io::Result<usize>;
}

/// Both halves of a backend.
pub trait Backend: Submitter + CompletionNotifier {}

impl<T: Submitter + CompletionNotifier> Backend for T {}
