//! Error types for upstream authentication.

use tado_proxy_store::StoreError;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur while talking to the upstream identity service.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Network/HTTP transport error.
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream answered with an unexpected status.
    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The user has not approved the device code yet.
    #[error("Authorization pending")]
    AuthorizationPending,

    /// The login or redirect flow did not go as expected.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation does not apply to this client or account.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Record store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl AuthError {
    /// True for the expected "user has not approved yet" condition.
    pub fn is_pending(&self) -> bool {
        matches!(self, AuthError::AuthorizationPending)
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

impl From<rustls::Error> for AuthError {
    fn from(e: rustls::Error) -> Self {
        AuthError::Tls(e.to_string())
    }
}
