//! Narrow seams between the token lifecycle and the upstream protocol.
//!
//! [`crate::TadoOAuth`] implements all three traits. Tests substitute
//! counting mocks; an alternate `authorize` (for example a headless browser
//! reading the refresh token from local storage) plugs in through
//! [`AuthProvider`] without touching the manager or the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use tado_proxy_store::{Client, Platform};

use crate::error::Result;
use crate::oauth::{DeviceAuthorization, Me, TokenGrant};

/// Refresh and password-grant authorization.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Exchange a refresh token using the client's platform profile.
    async fn refresh(&self, client: &Client, refresh_token: &str) -> Result<TokenGrant>;

    /// Obtain a fresh grant from the account's credentials.
    async fn authorize(&self, client: &Client, email: &str, password: &str) -> Result<TokenGrant>;
}

/// Device-code registration and polling.
#[async_trait]
pub trait DeviceAuthApi: Send + Sync {
    async fn device_authorize(&self, client: &Client) -> Result<DeviceAuthorization>;

    /// Returns [`crate::AuthError::AuthorizationPending`] until the user approves.
    async fn exchange_device_code(&self, client: &Client, device_code: &str) -> Result<TokenGrant>;
}

/// Account profile lookup.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    async fn get_me(&self, access_token: &str, platform: Platform) -> Result<Me>;
}

pub type SharedAuthProvider = Arc<dyn AuthProvider>;
pub type SharedDeviceAuthApi = Arc<dyn DeviceAuthApi>;
pub type SharedProfileApi = Arc<dyn ProfileApi>;
