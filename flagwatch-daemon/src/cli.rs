//! CLI argument definitions and config resolution for flagwatch-daemon.
//!
//! Every flag is optional: with none, the daemon reads
//! `/etc/flagwatch/flagwatch.toml` if it exists and falls back to the
//! built-in defaults otherwise.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

use flagwatch_core::config::FlagwatchConfig;
use flagwatch_core::error::{ConfigError, FlagwatchError};

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/flagwatch/flagwatch.toml";

/// flagwatch TCP probe capture daemon.
///
/// Installs an iptables chain that copies stealth (FIN+PSH+URG) and bare
/// SYN packets into an NFLOG group, then logs every packet it receives
/// from that group until SIGINT or SIGTERM.
#[derive(Parser, Debug, Default)]
#[command(name = "flagwatch-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to flagwatch.toml [default: /etc/flagwatch/flagwatch.toml].
    ///
    /// An explicitly given file must exist; a missing default file means
    /// built-in defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration and exit without touching the firewall.
    #[arg(long)]
    pub validate: bool,

    /// Remove the capture chain and its attachment, then exit.
    #[arg(long, conflicts_with = "validate")]
    pub teardown: bool,
}

impl DaemonCli {
    /// Loads the config file (or defaults), then env and CLI overrides, then
    /// validates.
    pub async fn resolve_config(&self) -> Result<FlagwatchConfig> {
        let mut config = match &self.config {
            Some(path) => FlagwatchConfig::from_file(path).await?,
            None => load_or_default(Path::new(DEFAULT_CONFIG_PATH)).await?,
        };
        config.apply_env_overrides();
        self.apply_overrides(&mut config);
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {e}"))?;
        Ok(config)
    }

    /// Applies `--log-level` / `--log-format`.
    pub fn apply_overrides(&self, config: &mut FlagwatchConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
    }
}

async fn load_or_default(path: &Path) -> Result<FlagwatchConfig, FlagwatchError> {
    match FlagwatchConfig::from_file(path).await {
        Err(FlagwatchError::Config(ConfigError::FileNotFound { .. })) => Ok(FlagwatchConfig::default()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_is_valid() {
        let cli = DaemonCli::try_parse_from(["flagwatch-daemon"]).unwrap();
        assert!(cli.config.is_none());
        assert!(!cli.validate);
        assert!(!cli.teardown);
    }

    #[test]
    fn validate_and_teardown_conflict() {
        assert!(DaemonCli::try_parse_from(["flagwatch-daemon", "--validate", "--teardown"]).is_err());
    }

    #[test]
    fn overrides_replace_general_settings() {
        let cli = DaemonCli {
            log_level: Some("debug".to_owned()),
            log_format: Some("pretty".to_owned()),
            ..DaemonCli::default()
        };
        let mut config = FlagwatchConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.log_format, "pretty");
    }

    #[tokio::test]
    async fn missing_default_file_falls_back_to_defaults() {
        let config = load_or_default(Path::new("/nonexistent/flagwatch.toml"))
            .await
            .unwrap();
        assert_eq!(config.capture.group, 100);
    }
}
