//! Shared building blocks for the flagwatch workspace.
//!
//! - [`config`]: `flagwatch.toml` parsing, env overrides, validation
//! - [`error`]: top-level error taxonomy every crate converts into
//! - [`metrics`]: metric names and descriptions

pub mod config;
pub mod error;
pub mod metrics;

// --- re-exports ---

pub use config::{CaptureSection, FirewallSection, FlagwatchConfig, GeneralConfig, MetricsConfig};
pub use error::{ChannelError, ConfigError, FirewallConfigError, FlagwatchError};
