//! Check command.

use console::style;

use toragent::config::AgentConfig;
use toragent::daemon::ProcessSupervisor;

/// Report whether the tor binary is available and what would be used.
pub fn cmd_check(config: &AgentConfig) -> anyhow::Result<()> {
    let daemon = &config.daemon;

    let Some(binary) = ProcessSupervisor::find_binary(daemon.tor_binary.as_deref()) else {
        println!("{} Tor binary not found", style("✗").red());
        if let Some(path) = &daemon.tor_binary {
            println!("  Configured path: {}", path.display());
        }
        println!("  Install tor or set tor_binary / TORAGENT_TOR_BINARY");
        anyhow::bail!("tor binary not found");
    };

    println!("{} Tor binary: {}", style("✓").green(), binary.display());

    match daemon.bootstrap_timeout_secs {
        Some(secs) => println!(
            "  Bootstrap: {}s per attempt (+{}s per retry), {} attempt(s)",
            secs, daemon.timeout_step_secs, daemon.max_attempts
        ),
        None => println!("  Bootstrap: no timeout"),
    }
    println!(
        "  Markers: bootstrap {:?}, reload {:?}, shutdown {:?}",
        daemon.markers.bootstrap, daemon.markers.reload, daemon.markers.shutdown
    );
    if !daemon.extra_args.is_empty() {
        println!("  Extra args: {}", daemon.extra_args.join(" "));
    }
    println!(
        "  External proxy: socks5h://{}:{}",
        config.socks_host, config.socks_port
    );
    if config.tls.insecure {
        println!(
            "{} TLS certificate verification is disabled",
            style("!").yellow()
        );
    }

    Ok(())
}
