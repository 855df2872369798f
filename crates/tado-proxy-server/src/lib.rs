//! HTTP surface of tado-proxy.
//!
//! # Routes
//!
//! - `ANY /api/v2/{*path}`: relayed upstream with a rotating token
//! - `GET /api/ratelimits`: per-token usage in the current quota window
//! - `GET /api/stats`: request counts across all tokens
//! - `GET /health`
//! - `/admin/...`: provisioning, guarded by the optional admin token
//!
//! # Example
//!
//! ```ignore
//! use tado_proxy_server::{AppState, Server};
//!
//! let state = AppState::new(config, store, http, tokens, accounts, codes);
//! Server::new(state).run(shutdown).await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod routes;
pub mod state;

pub use auth::admin_auth_middleware;
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use logging::request_logging_middleware;
pub use state::AppState;

use std::net::SocketAddr;

use axum::{Router, middleware};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// The proxy HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        use axum::routing::{any, get};

        Router::new()
            .merge(routes::health_routes())
            .route("/api/v2/{*path}", any(routes::proxy_handler))
            .route("/api/ratelimits", get(routes::ratelimits_handler))
            .route("/api/stats", get(routes::stats_handler))
            .nest("/admin", self.admin_routes())
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                logging::request_logging_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    fn admin_routes(&self) -> Router<AppState> {
        use axum::routing::{get, post};

        Router::new()
            .route("/clients", get(routes::list_clients_handler))
            .route(
                "/accounts",
                get(routes::list_accounts_handler).post(routes::create_account_handler),
            )
            .route(
                "/accounts/{id}",
                axum::routing::delete(routes::delete_account_handler),
            )
            .route("/tokens", get(routes::list_tokens_handler))
            .route(
                "/tokens/{id}",
                axum::routing::patch(routes::update_token_handler),
            )
            .route("/codes", post(routes::create_code_handler))
            .route("/codes/{id}", get(routes::get_code_handler))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::admin_auth_middleware,
            ))
    }

    /// Start the request log purge with the configured retention and
    /// interval. It stops with the state's shutdown token.
    pub fn spawn_request_purge(&self) -> JoinHandle<()> {
        maintenance::spawn_request_purge(
            self.state.store.clone(),
            self.state.config.request_retention,
            self.state.config.purge_interval,
            self.state.shutdown.child_token(),
        )
    }

    /// Serve on the configured address until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.state.config.bind_address;
        self.run_on(addr, shutdown).await
    }

    /// Serve on a specific address until `shutdown` fires.
    pub async fn run_on(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to bind {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let router = self.router();
        if let Ok(addr) = listener.local_addr() {
            info!("Starting server on {}", addr);
        }

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| ServerError::Internal(format!("Server error: {e}")))?;

        info!("Server stopped");
        Ok(())
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }
}
