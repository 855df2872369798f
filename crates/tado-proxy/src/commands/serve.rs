//! Serve command - runs the proxy until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use tado_proxy_auth::{AccountLoader, DeviceCodeWaiter, TokenManager};
use tado_proxy_server::{AppState, Server, ServerConfig, maintenance};
use tokio_util::sync::CancellationToken;

use super::{Context, seed_clients};

/// Arguments for the serve command.
///
/// Flags override config file values.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to (overrides config)
    #[arg(short, long, env = "TADO_PROXY_BIND")]
    pub bind: Option<String>,

    /// SQLite database path (overrides config)
    #[arg(long, env = "TADO_PROXY_DB")]
    pub db: Option<PathBuf>,

    /// Bearer token required on /admin routes (overrides config)
    #[arg(long, env = "TADO_PROXY_ADMIN_TOKEN")]
    pub admin_token: Option<String>,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    let server_section = config.server();
    let upstream = config.upstream();
    let tokens_section = config.tokens();
    let requests = config.requests();

    let bind = args.bind.unwrap_or(server_section.bind);
    let bind_address: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address '{bind}'"))?;

    // ── Store ───────────────────────────────────────────────────────────

    let store = ctx.open_store(args.db.as_deref())?;
    let seeded = seed_clients(&store, config)?;
    tracing::info!(clients = seeded, "Clients seeded");
    maintenance::purge_codes(&store)?;

    // ── Upstream services ───────────────────────────────────────────────

    let http = ctx.http_clients()?;
    let oauth = ctx.oauth(http.clone());

    let refresh_buffer = chrono::Duration::from_std(tokens_section.refresh_buffer())
        .context("refresh_buffer_secs out of range")?;
    let tokens = Arc::new(
        TokenManager::new(store.clone(), oauth.clone())
            .with_refresh_buffer(refresh_buffer)
            .with_sweep_interval(tokens_section.sweep_interval()),
    );
    let accounts = AccountLoader::new(store.clone(), oauth.clone(), oauth.clone());
    let codes = DeviceCodeWaiter::new(store.clone(), oauth.clone(), oauth)
        .with_poll_interval(config.codes().poll_interval());

    // ── Background tasks ────────────────────────────────────────────────

    let shutdown = CancellationToken::new();
    let sweeper = tokens.clone().spawn_sweeper(shutdown.child_token());

    // ── HTTP server ─────────────────────────────────────────────────────

    let admin_token = args.admin_token.or(server_section.admin_token);
    if admin_token.is_none() {
        tracing::warn!("No admin token configured, /admin routes are open");
    }

    let server_config = ServerConfig::new(upstream.api_base)
        .with_bind_address(bind_address)
        .with_admin_token(admin_token)
        .with_request_logging(server_section.request_logging)
        .with_bypass_param(upstream.bypass_param)
        .with_request_retention(requests.retention())
        .with_purge_interval(requests.purge_interval());

    let state = AppState::new(server_config, store, http, tokens, accounts, codes)
        .with_shutdown(shutdown.clone());

    let server = Server::new(state);
    let purger = server.spawn_request_purge();

    tokio::spawn(watch_signals(shutdown.clone()));

    let result = server.run(shutdown.clone()).await;

    // Stop background work even when the server failed to start.
    shutdown.cancel();
    let _ = tokio::join!(sweeper, purger);
    tracing::info!("Shutdown complete");

    result.map_err(Into::into)
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
