// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! Error taxonomy for the runtime.
//!
//! `would-block` never appears here: it is consumed entirely inside the scheduler/poller/
//! I/O-primitive layer and never surfaced to callers.

use std::fmt;
use std::io;

/// The reason a coroutine or thread was interrupted.
///
/// Distinct from [`Error::Interrupted`] only in that it records *why*; the error itself is
/// always the same shape once raised.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InterruptKind {
    /// Cooperative cancellation requested by another coroutine, or by the scheduler on
    /// `request_stop()`.
    Execution,
    /// An external signal or explicit API call wrapped as an interruption.
    User,
}

/// Errors that can be raised at a coroutine suspension point, or by a scheduler-aware I/O
/// primitive.
#[derive(Debug)]
pub enum Error {
    /// Cooperative cancellation request delivered at a suspension point.
    Interrupted(InterruptKind),
    /// A deadline passed before the awaited condition became true.
    TimedOut,
    /// A syscall failed for a reason other than would-block.
    Io(io::Error),
    /// The coroutine's stack was exhausted.
    OutOfStack,
    /// A context-local variable was registered after a storage block had already been
    /// created, and the new cumulative size would have exceeded the frozen total.
    RegistrarFrozen,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Interrupted(InterruptKind::Execution) => {
                write!(f, "execution interrupted")
            }
            Error::Interrupted(InterruptKind::User) => write!(f, "interrupted by user request"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::OutOfStack => write!(f, "coroutine stack overflow"),
            Error::RegistrarFrozen => {
                write!(f, "context-local variable registered after storage was frozen")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True if this error is a would-block-derived condition that a caller can legitimately
    /// retry (never constructed for `would-block` itself, which is consumed internally, but
    /// useful for callers bridging to code that treats timeouts as retryable).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// True if this error represents an interruption delivered to the current coroutine or
    /// thread.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }
}
