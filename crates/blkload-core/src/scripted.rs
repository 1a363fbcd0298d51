//! Scripted backend
//!
//! Deterministic in-memory [`Submitter`] + [`CompletionNotifier`]. Every
//! accepted request completes with its full length on the next `wait`
//! unless completions are held or a result was queued for it. Batch
//! rejections, wait failures and stale completions can be scripted ahead of
//! time. Nothing is ever read: the request buffers are not touched.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use crate::backend::{Completion, CompletionNotifier, ReadRequest, RequestStatus, Submitter};
use crate::tracker::Token;

/// Individual outcome scripted for one member of a rejected batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedStatus {
    /// Accepted despite the batch error; completes on a later wait.
    InProgress,
    /// Rejected before acceptance with this errno.
    NeverQueued(i32),
    /// Finished successfully before the status query.
    CompletedOk,
    /// Finished with this errno before the status query.
    CompletedError(i32),
}

/// A read the backend accepted, as seen on issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedRead {
    /// Request token
    pub token: Token,
    /// Target descriptor, if any
    pub fd: Option<i32>,
    /// Byte offset
    pub offset: u64,
    /// Length in bytes
    pub len: u32,
}

/// In-memory backend for deterministic engine tests.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    pending: VecDeque<Completion>,
    injected: VecDeque<Completion>,
    queued_results: VecDeque<i32>,
    reject_next: Option<Vec<ScriptedStatus>>,
    last_batch: HashMap<Token, RequestStatus>,
    wait_errors: VecDeque<i32>,
    held: bool,
    issued: Vec<IssuedRead>,
    batches: u64,
    waits: u64,
}

impl ScriptedBackend {
    /// Backend that completes every request on the next wait.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop (or resume) delivering completions for accepted requests.
    pub fn hold_completions(&mut self, held: bool) {
        self.held = held;
    }

    /// Make the next `issue_batch` fail, with one status per batch position.
    /// Positions past the end of `statuses` are in progress.
    pub fn reject_next_batch(&mut self, statuses: Vec<ScriptedStatus>) {
        self.reject_next = Some(statuses);
    }

    /// Make the next `wait` fail with `errno`.
    pub fn fail_next_wait(&mut self, errno: i32) {
        self.wait_errors.push_back(errno);
    }

    /// Results for the next accepted requests, in issue order: `>= 0` is a
    /// byte count (short reads allowed), `< 0` a negated errno.
    pub fn queue_results<I: IntoIterator<Item = i32>>(&mut self, results: I) {
        self.queued_results.extend(results);
    }

    /// Deliver an arbitrary completion on the next wait, ahead of real ones.
    pub fn inject(&mut self, completion: Completion) {
        self.injected.push_back(completion);
    }

    /// Every read accepted so far, in issue order.
    #[must_use]
    pub fn issued(&self) -> &[IssuedRead] {
        &self.issued
    }

    /// Forget the issue log.
    pub fn clear_issued(&mut self) {
        self.issued.clear();
    }

    /// Number of group-submit calls, accepted or not.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Number of wait calls.
    #[must_use]
    pub fn waits(&self) -> u64 {
        self.waits
    }

    /// Accepted requests whose completion has not been delivered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn accept(&mut self, req: &ReadRequest) {
        let result = self.queued_results.pop_front().unwrap_or(req.len as i32);
        self.issued.push(IssuedRead {
            token: req.token,
            fd: req.fd,
            offset: req.offset,
            len: req.len,
        });
        self.pending.push_back(Completion { token: req.token, result });
    }
}

impl Submitter for ScriptedBackend {
    fn issue_batch(&mut self, requests: &[ReadRequest]) -> io::Result<()> {
        self.batches += 1;
        self.last_batch.clear();

        let Some(statuses) = self.reject_next.take() else {
            for req in requests {
                self.accept(req);
            }
            return Ok(());
        };

        for (i, req) in requests.iter().enumerate() {
            let scripted = statuses.get(i).copied().unwrap_or(ScriptedStatus::InProgress);
            let status = match scripted {
                ScriptedStatus::InProgress => {
                    self.accept(req);
                    RequestStatus::InProgress
                }
                ScriptedStatus::NeverQueued(errno) => RequestStatus::NeverQueued(errno),
                ScriptedStatus::CompletedOk => RequestStatus::Completed(req.len as i32),
                ScriptedStatus::CompletedError(errno) => RequestStatus::Completed(-errno),
            };
            self.last_batch.insert(req.token, status);
        }
        Err(io::Error::from_raw_os_error(nix::libc::EAGAIN))
    }

    fn status(&mut self, token: Token) -> RequestStatus {
        self.last_batch.get(&token).copied().unwrap_or(RequestStatus::InProgress)
    }
}

impl CompletionNotifier for ScriptedBackend {
    fn wait(
        &mut self,
        _timeout: Duration,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> io::Result<usize> {
        self.waits += 1;
        if let Some(errno) = self.wait_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let mut delivered = 0;
        while delivered < max {
            let next = match self.injected.pop_front() {
                Some(c) => Some(c),
                None if !self.held => self.pending.pop_front(),
                None => None,
            };
            let Some(completion) = next else { break };
            out.push(completion);
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::libc;

    fn request(index: u32) -> ReadRequest {
        ReadRequest {
            token: Token::new(index, 1),
            fd: None,
            offset: u64::from(index) * 512,
            len: 512,
            buf: std::ptr::null_mut(),
        }
    }

    #[test]
    fn test_scripted_completes_on_next_wait() {
        let mut backend = ScriptedBackend::new();
        backend.issue_batch(&[request(0), request(1)]).unwrap();
        assert_eq!(backend.in_flight(), 2);

        let mut out = Vec::new();
        assert_eq!(backend.wait(Duration::ZERO, 32, &mut out).unwrap(), 2);
        assert_eq!(out[0], Completion { token: Token::new(0, 1), result: 512 });
        assert_eq!(backend.wait(Duration::ZERO, 32, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_scripted_max_events() {
        let mut backend = ScriptedBackend::new();
        let reqs: Vec<_> = (0..5).map(request).collect();
        backend.issue_batch(&reqs).unwrap();

        let mut out = Vec::new();
        assert_eq!(backend.wait(Duration::ZERO, 2, &mut out).unwrap(), 2);
        assert_eq!(backend.in_flight(), 3);
    }

    #[test]
    fn test_scripted_hold() {
        let mut backend = ScriptedBackend::new();
        backend.hold_completions(true);
        backend.issue(&request(0)).unwrap();

        let mut out = Vec::new();
        assert_eq!(backend.wait(Duration::ZERO, 8, &mut out).unwrap(), 0);
        backend.hold_completions(false);
        assert_eq!(backend.wait(Duration::ZERO, 8, &mut out).unwrap(), 1);
    }

    #[test]
    fn test_scripted_rejected_batch_statuses() {
        let mut backend = ScriptedBackend::new();
        backend.reject_next_batch(vec![
            ScriptedStatus::InProgress,
            ScriptedStatus::NeverQueued(libc::EAGAIN),
            ScriptedStatus::CompletedError(libc::EIO),
        ]);
        let reqs: Vec<_> = (0..4).map(request).collect();
        assert!(backend.issue_batch(&reqs).is_err());

        assert_eq!(backend.status(reqs[0].token), RequestStatus::InProgress);
        assert_eq!(backend.status(reqs[1].token), RequestStatus::NeverQueued(libc::EAGAIN));
        assert_eq!(backend.status(reqs[2].token), RequestStatus::Completed(-libc::EIO));
        assert_eq!(backend.status(reqs[3].token), RequestStatus::InProgress);
        // Only the in-progress members will complete later
        assert_eq!(backend.in_flight(), 2);
        assert_eq!(backend.batches(), 1);
    }

    #[test]
    fn test_scripted_wait_failure_and_injection() {
        let mut backend = ScriptedBackend::new();
        backend.fail_next_wait(libc::EBADF);
        backend.inject(Completion { token: Token::new(9, 9), result: 0 });

        let mut out = Vec::new();
        let err = backend.wait(Duration::ZERO, 8, &mut out).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));

        assert_eq!(backend.wait(Duration::ZERO, 8, &mut out).unwrap(), 1);
        assert_eq!(out[0].token, Token::new(9, 9));
        assert_eq!(backend.waits(), 2);
    }

    #[test]
    fn test_scripted_queued_results() {
        let mut backend = ScriptedBackend::new();
        backend.queue_results([-libc::EIO, 100]);
        backend.issue_batch(&[request(0), request(1), request(2)]).unwrap();

        let mut out = Vec::new();
        backend.wait(Duration::ZERO, 8, &mut out).unwrap();
        let results: Vec<i32> = out.iter().map(|c| c.result).collect();
        assert_eq!(results, vec![-libc::EIO, 100, 512]);
    }
}
