//! tado-proxy - credential-rotating reverse proxy for the tado API.
//!
//! Main entry point for the tado-proxy CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{accounts, clients, serve, tokens};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// tado-proxy - rotate many tado accounts behind one API endpoint
#[derive(Parser)]
#[command(name = "tado-proxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a config file layered over the discovered ones
    #[arg(long, global = true, env = "TADO_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy server
    Serve(serve::ServeArgs),

    /// Inspect registered OAuth clients
    Clients(clients::ClientsArgs),

    /// Manage tado accounts
    Accounts(accounts::AccountsArgs),

    /// Inspect stored tokens
    Tokens(tokens::TokensArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = tado_proxy_config::load_config(cli.config.as_deref())?;
    for warning in &loaded.warnings {
        eprintln!("warning: {}", warning);
    }

    // Console (human-readable) + rotating JSON file
    let _guard = init_tracing(cli.verbose, loaded.config.logging().resolved_dir());

    if cli.verbose {
        let sources = loaded.loaded_from();
        if sources.is_empty() {
            tracing::debug!("No config files found, using defaults");
        }
        for source in sources {
            tracing::debug!(path = %source.display(), "Loaded config");
        }
    }

    let ctx = commands::Context {
        config: loaded.config,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Clients(args) => clients::run(args, &ctx).await,
        Commands::Accounts(args) => accounts::run(args, &ctx).await,
        Commands::Tokens(args) => tokens::run(args, &ctx).await,
    }
}

/// Install the console and file layers.
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing(
    verbose: bool,
    log_dir: PathBuf,
) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let default_filter = if verbose {
        "tado_proxy=debug,tado_proxy_auth=debug,tado_proxy_server=debug,tado_proxy_store=debug,tado_proxy_config=debug,info"
    } else {
        "tado_proxy=info,tado_proxy_auth=info,tado_proxy_server=info,tado_proxy_store=info,warn"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_appender = tracing_appender::rolling::daily(&log_dir, "tado-proxy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "tado_proxy=trace,tado_proxy_auth=trace,tado_proxy_server=trace,tado_proxy_store=trace,tado_proxy_config=trace,info",
                )),
        )
        .init();

    guard
}
