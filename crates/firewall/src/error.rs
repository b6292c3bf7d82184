//! Firewall error types
//!
//! [`FirewallError`] converts into [`FlagwatchError`] so the daemon can
//! propagate it with `?`.

use std::fmt;

use flagwatch_core::error::{FirewallConfigError, FlagwatchError};

/// The RuleManager step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Flush or create the capture chain
    ClearChain,
    /// Remove the jump from the attachment point
    RemoveAttachment,
    /// Insert the jump at the configured position
    InsertAttachment,
    /// Append one capture rule
    AppendRule,
    /// Delete the (flushed) capture chain
    DeleteChain,
    /// Read-only state check
    Verify,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClearChain => "clear chain",
            Self::RemoveAttachment => "remove attachment",
            Self::InsertAttachment => "insert attachment",
            Self::AppendRule => "append rule",
            Self::DeleteChain => "delete chain",
            Self::Verify => "verify",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firewall domain error
#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    /// A chain/attachment/rule operation failed
    #[error("{step} failed on {table}/{chain}: {reason}")]
    Step {
        /// Failing step
        step: Step,
        /// iptables table
        table: String,
        /// Chain the operation targeted
        chain: String,
        /// Backend message
        reason: String,
    },

    /// Rule definition violates its invariants
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// The backend could not be created (iptables binary missing, etc.)
    #[error("firewall backend unavailable: {0}")]
    Backend(String),
}

impl From<FirewallError> for FlagwatchError {
    fn from(err: FirewallError) -> Self {
        match &err {
            FirewallError::Step { step, .. } => FlagwatchError::Firewall(FirewallConfigError::Step {
                step: step.to_string(),
                reason: err.to_string(),
            }),
            FirewallError::InvalidRule(reason) => {
                FlagwatchError::Firewall(FirewallConfigError::InvalidRule(reason.clone()))
            }
            FirewallError::Backend(reason) => FlagwatchError::Firewall(FirewallConfigError::Step {
                step: "open backend".to_owned(),
                reason: reason.clone(),
            }),
        }
    }
}
