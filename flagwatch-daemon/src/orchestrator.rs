//! Startup, capture and shutdown sequencing.
//!
//! # Sequence
//!
//! 1. Install the capture chain (`RuleManager::init`) and verify it
//! 2. Bind the NFLOG group (`CaptureSession::open`)
//! 3. Spawn the listener task running `CaptureSession::run`
//! 4. Wait for SIGINT/SIGTERM, or for the listener to stop on a fault
//! 5. Cancel, join the listener, close the session
//! 6. Remove the chain when `firewall.teardown_on_exit` is set
//!
//! A failure in 1 or 2 aborts before any packet is captured.
//!
//! Firewall calls run on the blocking pool since the iptables driver
//! spawns a process per operation.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use flagwatch_capture::{CaptureConfig, CaptureSession, CaptureStats, EventHandler, LogChannel};
use flagwatch_core::config::FlagwatchConfig;
use flagwatch_firewall::chain::rules_from_core;
use flagwatch_firewall::{
    ChainSpec, FirewallBackend, FirewallRule, InitReport, RuleManager, TeardownReport,
};

/// The daemon orchestrator.
///
/// Generic over the firewall backend so tests can run the full sequence
/// against `MemoryBackend`.
pub struct Orchestrator<B> {
    config: FlagwatchConfig,
    chain: ChainSpec,
    rules: Vec<FirewallRule>,
    capture: CaptureConfig,
    firewall: Arc<RuleManager<B>>,
    cancel: CancellationToken,
}

#[cfg(target_os = "linux")]
impl Orchestrator<flagwatch_firewall::IptablesBackend> {
    /// Builds an orchestrator driving the system `iptables`.
    pub fn build_from_config(config: FlagwatchConfig) -> Result<Self> {
        let manager = RuleManager::iptables(config.firewall.ipv6)?;
        Self::with_manager(config, manager)
    }

    /// Runs the full sequence with the NFLOG socket and [`ProbeLogger`].
    ///
    /// Installs the metrics recorder first when `[metrics] enabled = true`.
    /// Blocks until SIGINT/SIGTERM or a fatal channel fault.
    ///
    /// [`ProbeLogger`]: crate::probe::ProbeLogger
    pub async fn run(&self) -> Result<()> {
        if self.config.metrics.enabled {
            crate::metrics_server::install_metrics_recorder(&self.config.metrics)?;
            record_build_info();
        }

        self.install().await?;

        let session = match CaptureSession::open(self.capture.clone()) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "failed to open capture channel");
                self.teardown_if_configured().await;
                return Err(e.into());
            }
        };

        let outcome = self
            .capture(session, crate::probe::ProbeLogger::new(), wait_for_shutdown_signal())
            .await;
        self.teardown_if_configured().await;
        outcome.map(|_| ())
    }
}

impl<B: FirewallBackend + 'static> Orchestrator<B> {
    /// Builds from a loaded config and an existing rule manager.
    pub fn with_manager(config: FlagwatchConfig, manager: RuleManager<B>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {e}"))?;

        let chain = ChainSpec::from_core(&config.firewall);
        let rules = rules_from_core(&config.firewall, config.capture.group)?;
        let capture = CaptureConfig::from_core(&config.capture)?.with_ipv6(config.firewall.ipv6);

        tracing::info!(
            table = %chain.table,
            chain = %chain.chain,
            attach_to = %chain.attach_to,
            group = capture.group,
            rules = rules.len(),
            "orchestrator initialized"
        );

        Ok(Self {
            config,
            chain,
            rules,
            capture,
            firewall: Arc::new(manager),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &FlagwatchConfig {
        &self.config
    }

    pub fn chain(&self) -> &ChainSpec {
        &self.chain
    }

    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.capture
    }

    pub fn firewall(&self) -> &RuleManager<B> {
        &self.firewall
    }

    /// Token that stops the listener; cancelling it twice is harmless.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Installs and verifies the capture chain.
    pub async fn install(&self) -> Result<InitReport> {
        let firewall = Arc::clone(&self.firewall);
        let chain = self.chain.clone();
        let rules = self.rules.clone();

        let span = tracing::Span::current();
        let (report, verified) = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let report = firewall.init(&chain, &rules)?;
            let verified = firewall.verify(&chain, &rules)?;
            Ok::<_, flagwatch_firewall::FirewallError>((report, verified))
        })
        .await
        .map_err(|e| anyhow::anyhow!("firewall task failed: {e}"))??;

        if verified {
            tracing::info!(
                appended = report.appended,
                removed_attachments = report.removed_attachments,
                "capture rules verified"
            );
        } else {
            tracing::warn!("capture rules installed but verification failed");
        }
        Ok(report)
    }

    /// Removes the capture chain.
    pub async fn teardown(&self) -> Result<TeardownReport> {
        let firewall = Arc::clone(&self.firewall);
        let chain = self.chain.clone();

        let span = tracing::Span::current();
        let report = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            firewall.teardown(&chain)
        })
        .await
        .map_err(|e| anyhow::anyhow!("firewall task failed: {e}"))??;
        Ok(report)
    }

    /// Runs `session` on a listener task until `shutdown` resolves or the
    /// session stops by itself.
    ///
    /// The session is closed before this returns.
    pub async fn capture<C, H, S>(
        &self,
        session: CaptureSession<C>,
        handler: H,
        shutdown: S,
    ) -> Result<CaptureStats>
    where
        C: LogChannel + 'static,
        H: EventHandler + 'static,
        S: Future<Output = Result<&'static str>>,
    {
        let cancel = self.cancel.clone();
        let mut listener = tokio::spawn(async move {
            let mut session = session;
            let mut handler = handler;
            let result = session.run(cancel, &mut handler).await;
            session.close();
            (result, session.stats())
        }
        .in_current_span());
        tracing::info!(group = self.capture.group, "capturing");

        let joined = tokio::select! {
            signal = shutdown => {
                match signal {
                    Ok(name) => tracing::info!(signal = name, "shutdown signal received"),
                    Err(e) => tracing::error!(error = %e, "signal handling failed, stopping capture"),
                }
                self.cancel.cancel();
                (&mut listener).await
            }
            joined = &mut listener => joined,
        };

        let (result, stats) = joined.map_err(|e| anyhow::anyhow!("capture listener failed: {e}"))?;
        tracing::info!(
            events = stats.events,
            errors = stats.errors,
            bytes = stats.bytes,
            "capture finished"
        );
        result?;
        Ok(stats)
    }

    async fn teardown_if_configured(&self) {
        if !self.config.firewall.teardown_on_exit {
            return;
        }
        if let Err(e) = self.teardown().await {
            tracing::error!(error = %e, "failed to remove capture chain");
        }
    }
}

/// Waits for SIGTERM or SIGINT and returns which one arrived.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {e}"))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {e}"))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(target_os = "linux")]
fn record_build_info() {
    use flagwatch_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}
