//! Shared helper functions for CLI commands.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use toragent::agent::{Transport, TransportAgent};
use toragent::config::AgentConfig;

/// Spinner shown while waiting on the daemon.
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Launch a managed daemon, showing progress until it has bootstrapped.
pub async fn start_managed(config: &AgentConfig, verbose: bool) -> anyhow::Result<TransportAgent> {
    let pb = spinner("Bootstrapping Tor...");
    let result = TransportAgent::create_managed(config, verbose).await;
    pb.finish_and_clear();

    let agent = result?;
    if let Some(process) = agent.process() {
        println!(
            "{} Tor bootstrapped (pid {}, {} attempt(s))",
            style("✓").green(),
            process.pid(),
            process.attempts()
        );
    }
    Ok(agent)
}

/// Destroy the agent, reporting rather than propagating failure.
pub async fn shutdown(agent: &TransportAgent) {
    if !agent.is_managed() {
        return;
    }
    let pb = spinner("Shutting down Tor...");
    let result = agent.destroy().await;
    pb.finish_and_clear();

    match result {
        Ok(()) => println!("{} Tor stopped", style("✓").green()),
        Err(e) => eprintln!("{} {}", style("✗").red(), e),
    }
}
