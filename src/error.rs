//! Error taxonomy for the runtime.
//!
//! Retry classification matches on the rendered message (see
//! `retry::is_retryable`), so `Display` text here is part of the contract:
//! wrapping may prepend context but must preserve the original message.

use std::{error, fmt, io};

use futures::sync::{mpsc, oneshot};
use tokio_timer::TimerError;

#[derive(Debug)]
pub enum Error {
    /// The load balancer found no node for the task.
    NoCandidates(String),

    /// The requested task exists nowhere active.
    CapabilityUnavailable(String),

    /// Channel creation or dial failure.
    Connect(String),

    /// Failure during send or receive on an open stream.
    Stream(String),

    /// The response did not match the expected schema.
    Protocol(String),

    /// The caller's context was cancelled.
    Cancelled,

    /// A deadline elapsed.
    Timeout(&'static str),

    /// Impossible chunk settings.
    ChunkConfig(String),

    Internal(String),
}

impl Error {
    /// Prepends a context string, preserving the original message so that
    /// classification-by-message still sees it.
    pub fn context(self, ctx: &str) -> Error {
        match self {
            Error::Internal(msg) => Error::Internal(format!("{}: {}", ctx, msg)),
            Error::Stream(msg) => Error::Stream(format!("{}: {}", ctx, msg)),
            Error::Connect(msg) => Error::Connect(format!("{}: {}", ctx, msg)),
            Error::Protocol(msg) => Error::Protocol(format!("{}: {}", ctx, msg)),
            e => e,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NoCandidates(ref task) => {
                write!(f, "no nodes available for task `{}`", task)
            }
            Error::CapabilityUnavailable(ref task) => {
                write!(f, "task `{}` is unavailable on any active node", task)
            }
            Error::Connect(ref msg) => write!(f, "connection failed: {}", msg),
            Error::Stream(ref msg) => write!(f, "stream error: {}", msg),
            Error::Protocol(ref msg) => write!(f, "protocol error: {}", msg),
            Error::Cancelled => write!(f, "request cancelled"),
            Error::Timeout(what) => write!(f, "timeout waiting for {}", what),
            Error::ChunkConfig(ref msg) => {
                write!(f, "invalid chunk configuration: {}", msg)
            }
            Error::Internal(ref msg) => write!(f, "{}", msg),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::NoCandidates(_) => "no nodes available",
            Error::CapabilityUnavailable(_) => "task unavailable",
            Error::Connect(_) => "connection failed",
            Error::Stream(_) => "stream error",
            Error::Protocol(_) => "protocol error",
            Error::Cancelled => "request cancelled",
            Error::Timeout(_) => "timeout",
            Error::ChunkConfig(_) => "invalid chunk configuration",
            Error::Internal(_) => "internal error",
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Stream(format!("{}", e))
    }
}

impl From<::serde_json::Error> for Error {
    fn from(e: ::serde_json::Error) -> Error {
        Error::Protocol(format!("{}", e))
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_: oneshot::Canceled) -> Error {
        Error::Cancelled
    }
}

impl From<TimerError> for Error {
    fn from(e: TimerError) -> Error {
        Error::Internal(format!("timer failed: {}", e))
    }
}

impl<T> From<mpsc::SendError<T>> for Error {
    fn from(_: mpsc::SendError<T>) -> Error {
        Error::Stream("peer task gone".into())
    }
}
