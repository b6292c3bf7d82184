//! Capture error types
//!
//! Two tiers, matching how the receive loop treats them:
//!
//! - [`EventError`]: one bad message. Forwarded to the handler, capture goes on.
//! - [`CaptureError`]: the session itself failed (or was misused).
//!
//! `From<CaptureError> for FlagwatchError` lets the daemon propagate with `?`.

use flagwatch_core::error::{ChannelError, FlagwatchError};

/// Session-level capture error
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Socket creation, binding or group configuration failed
    #[error("failed to open NFLOG group {group}: {reason}")]
    ChannelOpen {
        /// NFLOG group
        group: u16,
        /// Kernel or socket message
        reason: String,
    },

    /// Unrecoverable receive failure; the session is stopped
    #[error("channel fault: {0}")]
    ChannelFault(String),

    /// Operation not allowed in the current session state
    #[error("invalid session state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// Request could not be encoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Capture settings are unusable
    #[error("capture config error: {field}: {reason}")]
    Config { field: String, reason: String },
}

/// Recoverable per-event error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The kernel dropped messages because the socket buffer was full (ENOBUFS)
    #[error("receive buffer overrun, events were dropped")]
    Overrun,

    /// A message could not be decoded
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The kernel reported an error through an NLMSG_ERROR message
    #[error("kernel reported error {errno}: {message}")]
    Kernel {
        /// Positive errno
        errno: i32,
        message: String,
    },
}

impl EventError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Overrun => "overrun",
            Self::Malformed(_) => "malformed",
            Self::Kernel { .. } => "kernel",
        }
    }

    pub(crate) fn kernel(errno: i32) -> Self {
        Self::Kernel {
            errno,
            message: std::io::Error::from_raw_os_error(errno).to_string(),
        }
    }
}

impl From<CaptureError> for FlagwatchError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::ChannelOpen { .. } | CaptureError::Config { .. } => {
                FlagwatchError::Channel(ChannelError::Open(err.to_string()))
            }
            CaptureError::ChannelFault(reason) => {
                FlagwatchError::Channel(ChannelError::Fault(reason))
            }
            other => FlagwatchError::Channel(ChannelError::Fault(other.to_string())),
        }
    }
}
