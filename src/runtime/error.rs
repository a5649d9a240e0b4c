//! Engine error taxonomy.
//!
//! End-of-stream and short transfers are not errors; everything here ends the
//! engine's run.

use super::token::{Op, TokenError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Ring, pipe or buffer allocation failed before any data moved.
    #[error("engine setup failed: {0}")]
    Setup(#[source] io::Error),

    /// Submitting to or waiting on the ring failed.
    #[error("io_uring submission failed: {0}")]
    Ring(#[source] io::Error),

    /// A relayed operation completed with an unrecoverable error.
    #[error("{op:?} failed: {source}")]
    Io {
        op: Op,
        #[source]
        source: io::Error,
    },

    /// A destination accepted zero bytes while some were still owed.
    #[error("{op:?} made no progress with {owed} bytes outstanding")]
    WriteZero { op: Op, owed: usize },

    #[error("invalid completion token: {0}")]
    Token(#[from] TokenError),

    /// A completion arrived that the current phase is not waiting for.
    #[error("unexpected completion for {0:?}")]
    UnexpectedCompletion(Op),

    /// The ring is too small for a batch that must be submitted together.
    #[error("submission queue cannot hold a batch of {needed} entries")]
    SubmissionQueueFull { needed: usize },

    #[cfg(not(target_os = "linux"))]
    #[error("io_uring engine is only available on Linux")]
    Unsupported,
}

impl EngineError {
    /// Underlying OS error number, if there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            EngineError::Setup(e)
            | EngineError::Ring(e)
            | EngineError::Io { source: e, .. } => e.raw_os_error(),
            EngineError::WriteZero { .. } => Some(libc::EPIPE),
            EngineError::SubmissionQueueFull { .. } => Some(libc::EBUSY),
            #[cfg(not(target_os = "linux"))]
            EngineError::Unsupported => Some(libc::ENOSYS),
            EngineError::Token(_) | EngineError::UnexpectedCompletion(_) => None,
        }
    }

    /// Process exit code: the negated errno, or -1 without one.
    pub fn exit_code(&self) -> i32 {
        -self.errno().unwrap_or(1)
    }

    /// Whether the kernel refused io_uring itself (old kernel or seccomp).
    pub fn is_ring_unavailable(&self) -> bool {
        match self {
            EngineError::Setup(e) => {
                matches!(e.raw_os_error(), Some(libc::ENOSYS) | Some(libc::EPERM))
            }
            #[cfg(not(target_os = "linux"))]
            EngineError::Unsupported => true,
            _ => false,
        }
    }
}

/// Completion results that mean "try the same operation again".
pub fn is_retryable(errno: i32) -> bool {
    errno == libc::EINTR || errno == libc::EAGAIN
}
