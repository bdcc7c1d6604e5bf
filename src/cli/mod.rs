//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod check;
mod fetch;
mod helpers;
mod run_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use url::Url;

use toragent::config::{parse_proxy, AgentConfig};

#[derive(Parser)]
#[command(name = "toragent")]
#[command(about = "Managed Tor daemon and tunneled connections")]
#[command(version)]
pub struct Cli {
    /// Config file path (default: ./toragent.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the tor binary (overrides config)
    #[arg(long, global = true, env = "TORAGENT_TOR_BINARY")]
    tor_binary: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the tor binary can be found and show the effective settings
    Check,

    /// Start a managed daemon and keep it running until interrupted.
    /// SIGHUP to this process rotates the daemon's identity.
    Run,

    /// Fetch a URL through a tunneled connection
    Fetch {
        /// http:// or https:// URL
        url: Url,

        /// Rotate identity before fetching
        #[arg(long)]
        rotate: bool,

        /// Skip TLS certificate verification (INSECURE)
        #[arg(short = 'k', long)]
        insecure: bool,

        /// Use an existing SOCKS proxy (host:port) instead of starting a daemon
        #[arg(long)]
        proxy: Option<String>,

        /// Print response headers
        #[arg(short = 'i', long)]
        include_headers: bool,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (proxy, insecure) = match &cli.command {
        Commands::Fetch {
            proxy, insecure, ..
        } => (proxy.as_deref().map(parse_proxy).transpose()?, *insecure),
        _ => (None, false),
    };

    let config = AgentConfig::discover(cli.config.as_deref())?
        .with_env_overrides()?
        .with_cli_overrides(cli.tor_binary, proxy.clone(), insecure);
    config.validate()?;

    match cli.command {
        Commands::Check => check::cmd_check(&config),
        Commands::Run => run_cmd::cmd_run(&config, cli.verbose).await,
        Commands::Fetch {
            url,
            rotate,
            include_headers,
            ..
        } => {
            fetch::cmd_fetch(
                &config,
                &url,
                fetch::FetchOptions {
                    rotate,
                    include_headers,
                    external_proxy: proxy.is_some(),
                },
                cli.verbose,
            )
            .await
        }
    }
}
