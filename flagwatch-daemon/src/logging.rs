//! Logging initialization for flagwatch-daemon.
//!
//! `log_level` from `[general]` applies to the flagwatch crates only; the
//! driver and runtime crates stay at `warn`. `RUST_LOG`, when set, replaces
//! the whole filter.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flagwatch_core::config::{FlagwatchConfig, GeneralConfig};

/// Crates whose events follow `log_level`.
const FLAGWATCH_CRATES: [&str; 4] = [
    "flagwatch_core",
    "flagwatch_firewall",
    "flagwatch_capture",
    "flagwatch_daemon",
];

/// Filter directives for `level`, e.g. `warn,flagwatch_core=info,...`.
pub fn filter_directives(level: &str) -> String {
    let mut directives = String::from("warn");
    for krate in FLAGWATCH_CRATES {
        directives.push_str(&format!(",{krate}={level}"));
    }
    directives
}

/// Initialize the global tracing subscriber.
///
/// Call once, before the first tracing macro. A second call fails.
///
/// * `"json"`: one JSON object per line with the enclosing span (default)
/// * `"pretty"`: multi-line human-readable output
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    if !matches!(config.log_format.as_str(), "json" | "pretty") {
        anyhow::bail!(
            "unknown log format '{}', expected 'json' or 'pretty'",
            config.log_format
        );
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(&config.log_level))
            .map_err(|e| anyhow::anyhow!("invalid log level '{}': {e}", config.log_level))?,
    };

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize JSON tracing subscriber: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize pretty tracing subscriber: {e}"))?;
    }

    Ok(())
}

/// Root span for one daemon run; every event carries the capture chain and
/// NFLOG group it belongs to.
pub fn daemon_span(config: &FlagwatchConfig) -> tracing::Span {
    tracing::info_span!(
        "flagwatch",
        table = %config.firewall.table,
        chain = %config.firewall.chain,
        group = config.capture.group,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_format_is_rejected_before_install() {
        let config = GeneralConfig {
            log_format: "xml".to_owned(),
            ..GeneralConfig::default()
        };
        let err = init_tracing(&config).unwrap_err();
        assert!(err.to_string().contains("unknown log format 'xml'"));
    }

    #[test]
    fn level_applies_to_every_flagwatch_crate() {
        // Given
        let level = "debug";

        // When
        let directives = filter_directives(level);

        // Then: dependencies stay at warn, flagwatch crates follow the level
        assert!(directives.starts_with("warn,"));
        for krate in FLAGWATCH_CRATES {
            assert!(directives.contains(&format!("{krate}=debug")));
        }
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn daemon_span_is_named_flagwatch() {
        let span = daemon_span(&FlagwatchConfig::default());
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "flagwatch");
            assert!(metadata.fields().field("group").is_some());
            assert!(metadata.fields().field("chain").is_some());
        }
    }
}
