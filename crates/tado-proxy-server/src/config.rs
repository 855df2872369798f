//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default max body size for proxied requests (10 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Query parameter appended to every upstream API call.
pub const DEFAULT_BYPASS_PARAM: &str = "ngsw-bypass=true";

/// Default age after which request logs are purged (7 days).
pub const DEFAULT_REQUEST_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default interval between request log purges (1 hour).
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_address: SocketAddr,

    /// Bearer token for `/admin` routes. `None` leaves them open.
    pub admin_token: Option<String>,

    /// Enable request logging.
    pub request_logging: bool,

    /// Base URL of the upstream API, without a trailing slash.
    pub api_base: String,

    /// `key=value` appended to the query of every upstream API call.
    pub bypass_param: String,

    /// Maximum inbound request body size in bytes.
    pub max_body_size: usize,

    /// Request logs older than this are purged.
    pub request_retention: Duration,

    /// Interval between request log purges.
    pub purge_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            admin_token: None,
            request_logging: true,
            api_base: "https://my.tado.com".to_string(),
            bypass_param: DEFAULT_BYPASS_PARAM.to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            request_retention: DEFAULT_REQUEST_RETENTION,
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }
}

impl ServerConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Require `Authorization: Bearer <token>` on admin routes.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }

    pub fn with_bypass_param(mut self, param: impl Into<String>) -> Self {
        self.bypass_param = param.into();
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_request_retention(mut self, retention: Duration) -> Self {
        self.request_retention = retention;
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }
}
