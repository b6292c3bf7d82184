//! Configuration: `flagwatch.toml` parsing and runtime settings
//!
//! [`FlagwatchConfig`] holds every section; each crate reads only its own
//! section and converts it into its typed form (`ChainSpec::from_core`,
//! `CaptureConfig::from_core`).
//!
//! # Load order
//! 1. CLI arguments (highest, applied by the daemon)
//! 2. Environment variables (`FLAGWATCH_CAPTURE_GROUP=101`)
//! 3. Config file (`flagwatch.toml`)
//! 4. Defaults (`Default` impls)
//!
//! Defaults reproduce the fixed deployment: table `filter`, chain `nflog`
//! attached first in `INPUT`, TCP ports `20:65535`, NFLOG group `100` with
//! full-packet copy.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), flagwatch_core::error::FlagwatchError> {
//! use flagwatch_core::config::FlagwatchConfig;
//!
//! let config = FlagwatchConfig::load("flagwatch.toml").await?;
//! let config = FlagwatchConfig::parse("[capture]\ngroup = 7")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, FlagwatchError};

/// Top-level flagwatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlagwatchConfig {
    /// Logging settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// Firewall chain and rule settings
    #[serde(default)]
    pub firewall: FirewallSection,
    /// NFLOG capture settings
    #[serde(default)]
    pub capture: CaptureSection,
    /// Prometheus endpoint
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl FlagwatchConfig {
    /// Loads a TOML file, applies env overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FlagwatchError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file without env overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, FlagwatchError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FlagwatchError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                FlagwatchError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parses a TOML string. Missing sections and fields take defaults.
    pub fn parse(toml_str: &str) -> Result<Self, FlagwatchError> {
        toml::from_str(toml_str).map_err(|e| {
            FlagwatchError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Applies `FLAGWATCH_{SECTION}_{FIELD}` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "FLAGWATCH_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "FLAGWATCH_GENERAL_LOG_FORMAT");

        // Firewall
        override_string(&mut self.firewall.table, "FLAGWATCH_FIREWALL_TABLE");
        override_string(&mut self.firewall.chain, "FLAGWATCH_FIREWALL_CHAIN");
        override_string(&mut self.firewall.attach_to, "FLAGWATCH_FIREWALL_ATTACH_TO");
        override_parse(&mut self.firewall.position, "FLAGWATCH_FIREWALL_POSITION");
        override_parse(&mut self.firewall.port_start, "FLAGWATCH_FIREWALL_PORT_START");
        override_parse(&mut self.firewall.port_end, "FLAGWATCH_FIREWALL_PORT_END");
        override_parse(&mut self.firewall.ipv6, "FLAGWATCH_FIREWALL_IPV6");
        override_parse(
            &mut self.firewall.teardown_on_exit,
            "FLAGWATCH_FIREWALL_TEARDOWN_ON_EXIT",
        );
        override_string(&mut self.firewall.prefix, "FLAGWATCH_FIREWALL_PREFIX");

        // Capture
        override_parse(&mut self.capture.group, "FLAGWATCH_CAPTURE_GROUP");
        override_string(&mut self.capture.copy_mode, "FLAGWATCH_CAPTURE_COPY_MODE");
        override_parse(&mut self.capture.copy_range, "FLAGWATCH_CAPTURE_COPY_RANGE");
        override_parse(&mut self.capture.buffer_size, "FLAGWATCH_CAPTURE_BUFFER_SIZE");
        override_parse(
            &mut self.capture.recv_buffer_len,
            "FLAGWATCH_CAPTURE_RECV_BUFFER_LEN",
        );

        // Metrics
        override_parse(&mut self.metrics.enabled, "FLAGWATCH_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "FLAGWATCH_METRICS_LISTEN_ADDR");
        override_parse(&mut self.metrics.port, "FLAGWATCH_METRICS_PORT");
    }

    /// Validates field values and cross-field constraints.
    pub fn validate(&self) -> Result<(), FlagwatchError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        for (field, value) in [
            ("firewall.table", &self.firewall.table),
            ("firewall.chain", &self.firewall.chain),
            ("firewall.attach_to", &self.firewall.attach_to),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty".to_owned()));
            }
            if value.chars().any(char::is_whitespace) {
                return Err(invalid(field, "must not contain whitespace".to_owned()));
            }
        }

        // iptables limits chain names to 28 characters
        if self.firewall.chain.len() > 28 {
            return Err(invalid(
                "firewall.chain",
                "must be at most 28 characters".to_owned(),
            ));
        }

        if self.firewall.position == 0 {
            return Err(invalid(
                "firewall.position",
                "positions are 1-based".to_owned(),
            ));
        }

        if self.firewall.port_start == 0 {
            return Err(invalid(
                "firewall.port_start",
                "must be between 1 and 65535".to_owned(),
            ));
        }

        if self.firewall.port_start > self.firewall.port_end {
            return Err(invalid(
                "firewall.port_end",
                format!(
                    "must not be below port_start ({} > {})",
                    self.firewall.port_start, self.firewall.port_end
                ),
            ));
        }

        // --nflog-prefix accepts at most 64 bytes
        if self.firewall.prefix.len() > 64 {
            return Err(invalid(
                "firewall.prefix",
                "must be at most 64 bytes".to_owned(),
            ));
        }

        let valid_modes = ["packet", "meta"];
        if !valid_modes.contains(&self.capture.copy_mode.as_str()) {
            return Err(invalid(
                "capture.copy_mode",
                format!("must be one of: {}", valid_modes.join(", ")),
            ));
        }

        if self.capture.recv_buffer_len < 4096 {
            return Err(invalid(
                "capture.recv_buffer_len",
                "must be at least 4096 bytes".to_owned(),
            ));
        }

        // one NFLOG message carries copy_range payload bytes plus headers
        let needed = u64::from(self.capture.copy_range) + NFLOG_HEADROOM;
        if self.capture.copy_mode == "packet" && (self.capture.recv_buffer_len as u64) < needed {
            return Err(invalid(
                "capture.recv_buffer_len",
                format!("must be at least copy_range + {NFLOG_HEADROOM} ({needed}) bytes in packet mode"),
            ));
        }

        Ok(())
    }
}

/// Netlink and NFLOG header bytes around a copied payload, rounded up.
const NFLOG_HEADROOM: u64 = 4096;

fn invalid(field: &str, reason: String) -> FlagwatchError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// Firewall chain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallSection {
    /// iptables table
    pub table: String,
    /// Dedicated chain holding the capture rules
    pub chain: String,
    /// Built-in chain the dedicated chain is jumped to from
    pub attach_to: String,
    /// 1-based insert position of the jump (1 = evaluated first)
    pub position: u32,
    /// First destination port watched (inclusive)
    pub port_start: u16,
    /// Last destination port watched (inclusive)
    pub port_end: u16,
    /// Use ip6tables instead of iptables
    pub ipv6: bool,
    /// Remove the chain when the daemon exits
    pub teardown_on_exit: bool,
    /// Optional `--nflog-prefix`; empty means none
    pub prefix: String,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            table: "filter".to_owned(),
            chain: "nflog".to_owned(),
            attach_to: "INPUT".to_owned(),
            position: 1,
            port_start: 20,
            port_end: 65535,
            ipv6: false,
            teardown_on_exit: false,
            prefix: String::new(),
        }
    }
}

/// NFLOG capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// NFLOG group the rules log to and the session binds
    pub group: u16,
    /// packet (full payload) or meta (metadata only)
    pub copy_mode: String,
    /// Max payload bytes copied per packet in `packet` mode
    pub copy_range: u32,
    /// Kernel-side netlink buffer size; 0 keeps the kernel default
    pub buffer_size: u32,
    /// Userspace receive buffer length
    pub recv_buffer_len: usize,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            group: 100,
            copy_mode: "packet".to_owned(),
            copy_range: 0xffff,
            buffer_size: 0,
            recv_buffer_len: 128 * 1024,
        }
    }
}

/// Prometheus metrics endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expose the scrape endpoint
    pub enabled: bool,
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9464,
        }
    }
}

// --- env override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parse<T: std::str::FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = std::any::type_name::<T>(),
                "failed to parse env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_matches_fixed_deployment() {
        let config = FlagwatchConfig::default();
        assert_eq!(config.firewall.table, "filter");
        assert_eq!(config.firewall.chain, "nflog");
        assert_eq!(config.firewall.attach_to, "INPUT");
        assert_eq!(config.firewall.position, 1);
        assert_eq!(config.firewall.port_start, 20);
        assert_eq!(config.firewall.port_end, 65535);
        assert_eq!(config.capture.group, 100);
        assert_eq!(config.capture.copy_mode, "packet");
        assert!(!config.firewall.teardown_on_exit);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn default_config_passes_validation() {
        FlagwatchConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = FlagwatchConfig::parse("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.capture.group, 100);
    }

    #[test]
    fn partial_toml_merges_with_defaults() {
        let toml = r#"
[firewall]
chain = "probes"
port_start = 1024

[capture]
group = 7
copy_mode = "meta"
"#;
        let config = FlagwatchConfig::parse(toml).unwrap();
        assert_eq!(config.firewall.chain, "probes");
        assert_eq!(config.firewall.port_start, 1024);
        // untouched fields keep defaults
        assert_eq!(config.firewall.port_end, 65535);
        assert_eq!(config.firewall.table, "filter");
        assert_eq!(config.capture.group, 7);
        assert_eq!(config.capture.copy_mode, "meta");
    }

    #[test]
    fn invalid_toml_returns_parse_error() {
        let err = FlagwatchConfig::parse("capture = [[[").unwrap_err();
        assert!(matches!(
            err,
            FlagwatchError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn out_of_range_port_fails_to_parse() {
        let err = FlagwatchConfig::parse("[firewall]\nport_end = 65536").unwrap_err();
        assert!(matches!(
            err,
            FlagwatchError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_reversed_port_range() {
        let mut config = FlagwatchConfig::default();
        config.firewall.port_start = 9000;
        config.firewall.port_end = 80;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port_end"));
    }

    #[test]
    fn validate_rejects_zero_position() {
        let mut config = FlagwatchConfig::default();
        config.firewall.position = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("position"));
    }

    #[test]
    fn validate_rejects_empty_chain() {
        let mut config = FlagwatchConfig::default();
        config.firewall.chain = "  ".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("firewall.chain"));
    }

    #[test]
    fn validate_rejects_long_chain_name() {
        let mut config = FlagwatchConfig::default();
        config.firewall.chain = "x".repeat(29);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_copy_mode() {
        let mut config = FlagwatchConfig::default();
        config.capture.copy_mode = "none".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("copy_mode"));
    }

    #[test]
    fn validate_rejects_invalid_log_format() {
        let mut config = FlagwatchConfig::default();
        config.general.log_format = "xml".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_format"));
    }

    #[test]
    fn validate_rejects_tiny_recv_buffer() {
        let mut config = FlagwatchConfig::default();
        config.capture.recv_buffer_len = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_room_for_a_full_copy() {
        // Given: a full 64K copy range with a 64K receive buffer
        let mut config = FlagwatchConfig::default();
        config.capture.copy_range = 0xffff;
        config.capture.recv_buffer_len = 64 * 1024;

        // When
        let err = config.validate().unwrap_err();

        // Then
        assert!(err.to_string().contains("recv_buffer_len"));
        assert!(err.to_string().contains("69631"));
    }

    #[test]
    fn recv_buffer_check_follows_copy_mode_and_range() {
        let mut config = FlagwatchConfig::default();
        config.validate().unwrap();

        config.capture.recv_buffer_len = 64 * 1024;
        config.capture.copy_mode = "meta".to_owned();
        config.validate().unwrap();

        config.capture.copy_mode = "packet".to_owned();
        config.capture.copy_range = 1500;
        config.capture.recv_buffer_len = 8192;
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_override_numeric_field() {
        let mut config = FlagwatchConfig::default();
        // SAFETY: serialized with #[serial], no other thread touches the env
        unsafe { std::env::set_var("FLAGWATCH_CAPTURE_GROUP", "42") };
        config.apply_env_overrides();
        unsafe { std::env::remove_var("FLAGWATCH_CAPTURE_GROUP") };
        assert_eq!(config.capture.group, 42);
    }

    #[test]
    #[serial]
    fn env_override_invalid_value_keeps_original() {
        let mut config = FlagwatchConfig::default();
        // SAFETY: serialized with #[serial], no other thread touches the env
        unsafe { std::env::set_var("FLAGWATCH_FIREWALL_POSITION", "first") };
        config.apply_env_overrides();
        unsafe { std::env::remove_var("FLAGWATCH_FIREWALL_POSITION") };
        assert_eq!(config.firewall.position, 1);
    }

    #[test]
    #[serial]
    fn env_override_string_field() {
        let mut config = FlagwatchConfig::default();
        // SAFETY: serialized with #[serial], no other thread touches the env
        unsafe { std::env::set_var("FLAGWATCH_FIREWALL_CHAIN", "scanwatch") };
        config.apply_env_overrides();
        unsafe { std::env::remove_var("FLAGWATCH_FIREWALL_CHAIN") };
        assert_eq!(config.firewall.chain, "scanwatch");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = FlagwatchConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = FlagwatchConfig::parse(&toml_str).unwrap();
        assert_eq!(config.firewall.chain, parsed.firewall.chain);
        assert_eq!(config.capture.copy_range, parsed.capture.copy_range);
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = FlagwatchConfig::from_file("/nonexistent/flagwatch.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlagwatchError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
