//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [server]      # bind address, admin token, request logging
//! [store]       # database path
//! [upstream]    # API and identity service base URLs
//! [tokens]      # sweep and refresh timing
//! [codes]       # device-code polling
//! [requests]    # request log retention
//! [logging]     # log file directory
//! [[clients]]   # OAuth client seeds
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tado_proxy_store::{ClientType, NewClient, Platform};

use crate::discovery::xdg_config_dir;
use crate::{ConfigError, Result};

/// Application name for data and log directories.
pub(crate) const APP_NAME: &str = "tado-proxy";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. a project-local
/// override) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TadoProxyConfig {
    pub server: Option<ServerSection>,
    pub store: Option<StoreSection>,
    pub upstream: Option<UpstreamSection>,
    pub tokens: Option<TokensSection>,
    pub codes: Option<CodesSection>,
    pub requests: Option<RequestsSection>,
    pub logging: Option<LoggingSection>,
    /// OAuth client seeds, upserted by `client_id` at startup.
    pub clients: Vec<ClientSeed>,
}

impl TadoProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole; client seeds are merged by `client_id`.
    pub fn merge(&mut self, other: TadoProxyConfig) {
        if other.server.is_some() {
            self.server = other.server;
        }
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.upstream.is_some() {
            self.upstream = other.upstream;
        }
        if other.tokens.is_some() {
            self.tokens = other.tokens;
        }
        if other.codes.is_some() {
            self.codes = other.codes;
        }
        if other.requests.is_some() {
            self.requests = other.requests;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }

        for seed in other.clients {
            match self.clients.iter_mut().find(|c| c.client_id == seed.client_id) {
                Some(existing) => *existing = seed,
                None => self.clients.push(seed),
            }
        }
    }

    pub fn server(&self) -> ServerSection {
        self.server.clone().unwrap_or_default()
    }

    pub fn store(&self) -> StoreSection {
        self.store.clone().unwrap_or_default()
    }

    pub fn upstream(&self) -> UpstreamSection {
        self.upstream.clone().unwrap_or_default()
    }

    pub fn tokens(&self) -> TokensSection {
        self.tokens.clone().unwrap_or_default()
    }

    pub fn codes(&self) -> CodesSection {
        self.codes.clone().unwrap_or_default()
    }

    pub fn requests(&self) -> RequestsSection {
        self.requests.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// Configured client seeds, or the known tado clients when none are set.
    pub fn client_seeds(&self) -> Vec<ClientSeed> {
        if self.clients.is_empty() {
            ClientSeed::defaults()
        } else {
            self.clients.clone()
        }
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        for seed in &self.clients {
            seed.validate()?;
        }
        let upstream = self.upstream();
        for (name, url) in [
            ("upstream.api_base", &upstream.api_base),
            ("upstream.login_base", &upstream.login_base),
        ] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be an http(s) URL, got '{url}'"
                )));
            }
        }
        if !upstream.bypass_param.contains('=') {
            return Err(ConfigError::Invalid(format!(
                "upstream.bypass_param must be key=value, got '{}'",
                upstream.bypass_param
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind to.
    pub bind: String,
    /// Bearer token required on `/admin` routes.
    pub admin_token: Option<String>,
    /// Log every HTTP request.
    pub request_logging: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            admin_token: None,
            request_logging: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database file. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

impl StoreSection {
    /// Database path, falling back to `<data dir>/tado-proxy/tado-proxy.db`.
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_NAME)
                .join("tado-proxy.db")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub api_base: String,
    pub login_base: String,
    /// `key=value` appended to every proxied API call.
    pub bypass_param: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            api_base: "https://my.tado.com".to_string(),
            login_base: "https://login.tado.com".to_string(),
            bypass_param: "ngsw-bypass=true".to_string(),
            timeout_secs: 30,
        }
    }
}

impl UpstreamSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensSection {
    pub sweep_interval_secs: u64,
    /// Tokens are refreshed this long before they expire.
    pub refresh_buffer_secs: u64,
}

impl Default for TokensSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            refresh_buffer_secs: 60,
        }
    }
}

impl TokensSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodesSection {
    pub poll_interval_secs: u64,
}

impl Default for CodesSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

impl CodesSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestsSection {
    pub retention_days: u64,
    pub purge_interval_secs: u64,
}

impl Default for RequestsSection {
    fn default() -> Self {
        Self {
            retention_days: 7,
            purge_interval_secs: 3600,
        }
    }
}

impl RequestsSection {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for rolling JSON log files.
    pub dir: Option<PathBuf>,
}

impl LoggingSection {
    /// Log directory, falling back to `<config dir>/logs`.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            xdg_config_dir()
                .unwrap_or_else(|| PathBuf::from(".").join(APP_NAME))
                .join("logs")
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client seeds
// ─────────────────────────────────────────────────────────────────────────────

/// One `[[clients]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSeed {
    pub name: String,
    pub client_id: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    pub platform: Platform,
    #[serde(default)]
    pub redirect_uri: String,
    pub scope: String,
    /// Omit to keep the limit learned from upstream responses.
    #[serde(default)]
    pub daily_limit: Option<i64>,
    #[serde(default)]
    pub disabled: bool,
}

impl ClientSeed {
    /// The public tado clients: the mobile app, the web app and the
    /// device-code client.
    pub fn defaults() -> Vec<ClientSeed> {
        vec![
            ClientSeed {
                name: "tado mobile app".to_string(),
                client_id: "eec8b609-9e2d-4403-9336-4f62a475271e".to_string(),
                client_type: ClientType::PasswordGrant,
                platform: Platform::Mobile,
                redirect_uri: "tado://auth/redirect".to_string(),
                scope: "home.user offline_access".to_string(),
                daily_limit: None,
                disabled: false,
            },
            ClientSeed {
                name: "tado web app".to_string(),
                client_id: "af44f89e-ae86-4ebe-905f-6bf759cf6473".to_string(),
                client_type: ClientType::PasswordGrant,
                platform: Platform::Web,
                redirect_uri: "https://app.tado.com/".to_string(),
                scope: "home.user offline_access".to_string(),
                daily_limit: None,
                disabled: false,
            },
            ClientSeed {
                name: "tado device code".to_string(),
                client_id: "1bb50063-6b0c-4d11-bd99-387f4a91cc46".to_string(),
                client_type: ClientType::DeviceCode,
                platform: Platform::Mobile,
                redirect_uri: String::new(),
                scope: "home.user offline_access".to_string(),
                daily_limit: None,
                disabled: false,
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "client '{}' has an empty client_id",
                self.name
            )));
        }
        if self.client_type == ClientType::PasswordGrant && self.redirect_uri.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "passwordGrant client '{}' needs a redirect_uri",
                self.name
            )));
        }
        if self.daily_limit.is_some_and(|l| l < 0) {
            return Err(ConfigError::Invalid(format!(
                "client '{}' has a negative daily_limit",
                self.name
            )));
        }
        Ok(())
    }

    pub fn to_new_client(&self) -> NewClient {
        NewClient {
            name: self.name.clone(),
            client_id: self.client_id.clone(),
            client_type: self.client_type,
            platform: self.platform,
            redirect_uri: self.redirect_uri.clone(),
            scope: self.scope.clone(),
            daily_limit: self.daily_limit,
            disabled: self.disabled,
        }
    }
}
