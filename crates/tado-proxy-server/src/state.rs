//! Application state shared across handlers.

use std::sync::Arc;

use tado_proxy_auth::{AccountLoader, DeviceCodeWaiter, HttpClients, TokenManager};
use tado_proxy_store::SharedStore;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,

    /// Authoritative records.
    pub store: SharedStore,

    /// Impersonating transports used for proxied API calls.
    pub http: Arc<HttpClients>,

    pub tokens: Arc<TokenManager>,

    /// Provisioning for accounts created through the admin API.
    pub accounts: AccountLoader,

    /// Starts a waiter for device codes created through the admin API.
    pub codes: DeviceCodeWaiter,

    /// Fired on process shutdown; device-code waiters stop with it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: SharedStore,
        http: Arc<HttpClients>,
        tokens: Arc<TokenManager>,
        accounts: AccountLoader,
        codes: DeviceCodeWaiter,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            http,
            tokens,
            accounts,
            codes,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}
