//! Error taxonomy shared by every flagwatch crate.
//!
//! Library crates keep their own detailed error enums and convert into
//! [`FlagwatchError`] so the daemon can propagate everything with `?`.

/// flagwatch top-level error
#[derive(Debug, thiserror::Error)]
pub enum FlagwatchError {
    /// Configuration could not be loaded or is invalid
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Chain, attachment or rule operation failed
    #[error("firewall config error: {0}")]
    Firewall(#[from] FirewallConfigError),

    /// Logging channel could not be opened or failed mid-session
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// TOML could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds a value outside its allowed set
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Firewall configuration errors (chain/attachment/rule operations)
#[derive(Debug, thiserror::Error)]
pub enum FirewallConfigError {
    /// One step of rule installation or teardown failed
    #[error("{step} failed: {reason}")]
    Step { step: String, reason: String },

    /// A rule definition violates its own invariants
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

/// Kernel logging channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Binding the channel failed (privilege, group busy, no netlink support)
    #[error("channel open failed: {0}")]
    Open(String),

    /// Unrecoverable failure while the session was running
    #[error("channel fault: {0}")]
    Fault(String),
}
