use anyhow::Result;
use clap::Parser;
use tracing::Instrument;

use flagwatch_daemon::cli::DaemonCli;
use flagwatch_daemon::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();
    let config = cli.resolve_config().await?;

    if cli.validate {
        println!("configuration is valid");
        println!(
            "  chain: {}/{} -> {} @ {}",
            config.firewall.table,
            config.firewall.chain,
            config.firewall.attach_to,
            config.firewall.position
        );
        println!(
            "  ports: {}:{}",
            config.firewall.port_start, config.firewall.port_end
        );
        println!(
            "  nflog group: {} ({})",
            config.capture.group, config.capture.copy_mode
        );
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    let span = logging::daemon_span(&config);
    span.in_scope(|| {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "flagwatch-daemon starting");
    });

    run(cli, config).instrument(span).await
}

#[cfg(target_os = "linux")]
async fn run(cli: DaemonCli, config: flagwatch_core::FlagwatchConfig) -> Result<()> {
    use flagwatch_daemon::orchestrator::Orchestrator;

    let orchestrator = Orchestrator::build_from_config(config)?;

    if cli.teardown {
        let report = orchestrator.teardown().await?;
        tracing::info!(
            detached = ?report.detached,
            removed_attachments = report.removed_attachments,
            deleted = ?report.deleted,
            "capture chain removed"
        );
        return Ok(());
    }

    orchestrator.run().await?;
    tracing::info!("flagwatch-daemon shut down");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_cli: DaemonCli, _config: flagwatch_core::FlagwatchConfig) -> Result<()> {
    anyhow::bail!("flagwatch-daemon requires Linux (iptables and NETLINK_NETFILTER)")
}
