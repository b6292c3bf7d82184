//! Prometheus scrape endpoint.
//!
//! Installs the global `metrics` recorder with the HTTP listener built into
//! `metrics-exporter-prometheus`. Without it the counters recorded by the
//! firewall and capture crates are no-ops.
//!
//! ```ignore
//! if config.metrics.enabled {
//!     install_metrics_recorder(&config.metrics)?;
//! }
//! ```

use std::net::SocketAddr;

use anyhow::Result;
use flagwatch_core::config::MetricsConfig;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the recorder and starts serving `http://<listen_addr>:<port>/metrics`.
///
/// Call at most once per process.
///
/// # Errors
///
/// - `listen_addr:port` is not a socket address
/// - the port cannot be bound, or a recorder is already installed
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    let addr = listen_addr(config)?;

    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces"
        );
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?;

    flagwatch_core::metrics::describe_all();

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint active");
    Ok(())
}

fn listen_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    format!("{}:{}", config.listen_addr, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address '{}': {e}", config.listen_addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_combines_host_and_port() {
        let config = MetricsConfig::default();
        assert_eq!(listen_addr(&config).unwrap().to_string(), "127.0.0.1:9464");
    }

    #[test]
    fn ipv6_host_needs_brackets() {
        let config = MetricsConfig {
            listen_addr: "[::1]".to_owned(),
            ..MetricsConfig::default()
        };
        assert!(listen_addr(&config).is_ok());
    }
}
