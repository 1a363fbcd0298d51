//! Error types for blkload-core.

use nix::libc;
use std::path::PathBuf;
use thiserror::Error;

use crate::tracker::Token;

/// Errors raised by the target registry and the request lifecycle engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The target path could not be opened.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        /// Path that was being opened.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The size of an opened target could not be determined, or is unusable
    /// with the requested block size.
    #[error("bad geometry for {}: {reason}", path.display())]
    Geometry {
        /// Path of the offending target.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Buffer or bookkeeping record allocation failed.
    #[error("allocation of {len} bytes failed: {reason}")]
    Allocation {
        /// Requested buffer length.
        len: usize,
        /// What went wrong.
        reason: &'static str,
    },

    /// A request was rejected before the kernel accepted it.
    #[error("submission of {token} rejected: {source}")]
    Submission {
        /// Token of the rejected request.
        token: Token,
        /// Error reported by the submit path.
        #[source]
        source: std::io::Error,
    },

    /// An accepted read finished with a negative result.
    #[error("read {token} failed with errno {errno}")]
    Completion {
        /// Token of the failed request.
        token: Token,
        /// Positive errno value.
        errno: i32,
    },

    /// A token does not match any currently tracked operation.
    #[error("no tracked operation for {token}")]
    Correlation {
        /// The unknown token.
        token: Token,
    },

    /// The completion wait call itself failed.
    #[error("completion wait failed: {0}")]
    Wait(std::io::Error),

    /// The backend could not be constructed.
    #[error("backend setup failed: {0}")]
    Backend(std::io::Error),

    /// Invalid engine or registry parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns true if the condition clears on its own and the engine should
    /// simply carry on with the next phase.
    #[inline]
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. }
                | Self::Submission { .. }
                | Self::Completion { .. }
                | Self::Correlation { .. }
                | Self::Wait(_)
        )
    }

    /// Convert to a negative errno for reporting.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Open { source, .. } => -source.raw_os_error().unwrap_or(libc::ENOENT),
            Self::Geometry { .. } => -libc::EINVAL,
            Self::Allocation { .. } => -libc::ENOMEM,
            Self::Submission { source, .. } => -source.raw_os_error().unwrap_or(libc::EAGAIN),
            Self::Completion { errno, .. } => -errno,
            Self::Correlation { .. } => -libc::ENOENT,
            Self::Wait(e) | Self::Backend(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidConfig(_) => -libc::EINVAL,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
