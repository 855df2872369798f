//! CLI command handlers.

pub mod accounts;
pub mod clients;
pub mod serve;
pub mod tokens;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tado_proxy_auth::{Endpoints, HttpClients, TadoOAuth};
use tado_proxy_config::TadoProxyConfig;
use tado_proxy_store::{SharedStore, SqliteStore};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration from all discovered layers.
    pub config: TadoProxyConfig,
    pub verbose: bool,
}

impl Context {
    /// Open the record store, preferring `path_override` over `[store] path`.
    pub fn open_store(&self, path_override: Option<&Path>) -> Result<SharedStore> {
        let path = path_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.store().resolved_path());
        let store = SqliteStore::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Arc::new(store))
    }

    /// Impersonating HTTP clients with the configured timeout.
    pub fn http_clients(&self) -> Result<Arc<HttpClients>> {
        let clients = HttpClients::with_timeout(self.config.upstream().timeout())
            .context("Failed to build upstream HTTP clients")?;
        Ok(Arc::new(clients))
    }

    /// The upstream OAuth implementation over `http`.
    pub fn oauth(&self, http: Arc<HttpClients>) -> Arc<TadoOAuth> {
        let upstream = self.config.upstream();
        Arc::new(TadoOAuth::new(
            Endpoints::new(upstream.login_base, upstream.api_base),
            http,
        ))
    }
}

/// Upsert every configured client seed.
pub fn seed_clients(store: &SharedStore, config: &TadoProxyConfig) -> Result<usize> {
    let seeds = config.client_seeds();
    for seed in &seeds {
        let client = store
            .upsert_client(&seed.to_new_client())
            .with_context(|| format!("Failed to seed client '{}'", seed.name))?;
        tracing::debug!(client_id = %client.client_id, id = %client.id, "Seeded client");
    }
    Ok(seeds.len())
}

/// Format an optional timestamp for table output.
pub(crate) fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
