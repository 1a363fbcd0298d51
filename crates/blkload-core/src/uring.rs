//! `io_uring` backend
//!
//! Reads are `Read` SQEs carrying the packed [`Token`] as `user_data`. A
//! group submit is one `io_uring_enter`, and the timed wait is
//! `submit_with_args` with a timespec (`ETIME` means the wait timed out).
//!
//! When an enter fails or consumes only part of the batch, SQEs already
//! pushed stay in the submission ring and go out with the next enter, so
//! they are reported as in progress. Only requests that could not be pushed
//! at all are reported as never queued.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};
use nix::libc;
use tracing::{debug, trace};

use crate::backend::{Completion, CompletionNotifier, ReadRequest, RequestStatus, Submitter};
use crate::tracker::Token;

/// Production backend over a single `io_uring` instance.
pub struct UringBackend {
    ring: IoUring,
    /// Members of the last batch: `Ok(())` if pushed, `Err(errno)` if not.
    last_batch: HashMap<Token, Result<(), i32>>,
    /// CQEs reaped while answering `status`, delivered by the next `wait`.
    stash: VecDeque<Completion>,
}

impl std::fmt::Debug for UringBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringBackend")
            .field("sq_entries", &self.ring.params().sq_entries())
            .field("cq_entries", &self.ring.params().cq_entries())
            .field("stashed", &self.stash.len())
            .finish()
    }
}

impl UringBackend {
    /// Create a ring with room for `entries` in-flight reads.
    ///
    /// # Errors
    ///
    /// Fails if the kernel refuses the ring or lacks extended wait arguments
    /// (Linux < 5.11).
    pub fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries.max(1))?;
        if !ring.params().is_feature_ext_arg() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring lacks IORING_FEAT_EXT_ARG (timed waits need Linux 5.11+)",
            ));
        }
        debug!(
            sq_entries = ring.params().sq_entries(),
            cq_entries = ring.params().cq_entries(),
            "io_uring backend ready"
        );
        Ok(Self { ring, last_batch: HashMap::new(), stash: VecDeque::new() })
    }

    fn reap_into_stash(&mut self) {
        for cqe in self.ring.completion() {
            self.stash.push_back(Completion {
                token: Token::from_u64(cqe.user_data()),
                result: cqe.result(),
            });
        }
    }

    fn deliver(&mut self, max: usize, out: &mut Vec<Completion>) -> usize {
        let mut delivered = 0;
        while delivered < max {
            match self.stash.pop_front() {
                Some(completion) => {
                    out.push(completion);
                    delivered += 1;
                }
                None => break,
            }
        }
        for cqe in self.ring.completion().take(max - delivered) {
            out.push(Completion { token: Token::from_u64(cqe.user_data()), result: cqe.result() });
            delivered += 1;
        }
        delivered
    }
}

impl Submitter for UringBackend {
    fn issue_batch(&mut self, requests: &[ReadRequest]) -> io::Result<()> {
        self.last_batch.clear();
        let mut unpushed = 0usize;

        {
            let mut sq = self.ring.submission();
            for req in requests {
                let Some(fd) = req.fd else {
                    self.last_batch.insert(req.token, Err(libc::EBADF));
                    unpushed += 1;
                    continue;
                };
                let sqe = opcode::Read::new(types::Fd(fd), req.buf, req.len)
                    .offset(req.offset)
                    .build()
                    .user_data(req.token.as_u64());
                // SAFETY: req.buf points into a buffer owned by a tracked
                // operation; it is not freed until the request completes or is
                // reported never queued.
                let pushed = unsafe { sq.push(&sqe) };
                match pushed {
                    Ok(()) => {
                        self.last_batch.insert(req.token, Ok(()));
                    }
                    Err(_) => {
                        self.last_batch.insert(req.token, Err(libc::EAGAIN));
                        unpushed += 1;
                    }
                }
            }
        }

        let submitted = self.ring.submit()?;
        let left_in_sq = self.ring.submission().len();
        trace!(requests = requests.len(), submitted, left_in_sq, unpushed, "io_uring_enter");

        if unpushed > 0 {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        if left_in_sq > 0 {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("io_uring_enter consumed {submitted} of {} entries", requests.len()),
            ));
        }
        Ok(())
    }

    fn status(&mut self, token: Token) -> RequestStatus {
        self.reap_into_stash();
        if let Some(pos) = self.stash.iter().position(|c| c.token == token) {
            if let Some(completion) = self.stash.remove(pos) {
                return RequestStatus::Completed(completion.result);
            }
        }
        match self.last_batch.get(&token) {
            Some(Err(errno)) => RequestStatus::NeverQueued(*errno),
            Some(Ok(())) | None => RequestStatus::InProgress,
        }
    }
}

impl CompletionNotifier for UringBackend {
    fn wait(
        &mut self,
        timeout: Duration,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> io::Result<usize> {
        if max == 0 {
            return Ok(0);
        }
        let ready = self.deliver(max, out);
        if ready > 0 {
            return Ok(ready);
        }

        let ts = types::Timespec::from(timeout);
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR)) => {}
            Err(e) => return Err(e),
        }
        Ok(self.deliver(max, out))
    }
}
