//! Run command: keep a managed daemon alive in the foreground.

use std::future::Future;
use std::time::Duration;

use console::style;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::helpers::{shutdown, start_managed};
use toragent::agent::TransportAgent;
use toragent::config::AgentConfig;

/// How often to check that the daemon is still running.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

pub async fn cmd_run(config: &AgentConfig, verbose: bool) -> anyhow::Result<()> {
    let agent = start_managed(config, verbose).await?;

    println!("  SOCKS proxy: {}", style(agent.socks_url()).cyan());
    println!("  Ctrl-C to stop, SIGHUP to rotate identity");

    let (hup_tx, hup_rx) = mpsc::channel(1);
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                // A rotation already queued covers this one too.
                if let Err(mpsc::error::TrySendError::Closed(())) = hup_tx.try_send(()) {
                    break;
                }
            }
        });
    }
    #[cfg(not(unix))]
    drop(hup_tx);

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let result = supervise(&agent, stop, hup_rx).await;
    shutdown(&agent).await;
    result
}

/// Serve until `stop` resolves, rotating identity on every hangup.
///
/// `stop` is polled across iterations, so a stop request that arrives while
/// a rotation is in flight is still seen.
async fn supervise(
    agent: &TransportAgent,
    stop: impl Future<Output = ()>,
    mut hangups: mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    tokio::pin!(stop);
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut stop => return Ok(()),
            Some(()) = hangups.recv() => match agent.rotate_identity().await {
                Ok(()) => println!("{} New identity", style("✓").green()),
                Err(e) => eprintln!("{} Rotation failed: {}", style("✗").red(), e),
            },
            _ = liveness.tick() => {
                let Some(process) = agent.process() else {
                    continue;
                };
                if process.has_exited().await? {
                    warn!("Daemon exited unexpectedly");
                    anyhow::bail!("tor exited unexpectedly");
                }
                debug!("Daemon {} alive", process.pid());
            }
        }
    }
}
