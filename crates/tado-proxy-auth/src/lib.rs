//! Upstream authentication for tado-proxy.
//!
//! Everything that talks to the tado identity service lives here, shaped to
//! look like traffic from a genuine browser or the mobile app.
//!
//! # Components
//!
//! - [`impersonation`]: TLS and HTTP/2 fingerprints plus ordered header sets per platform
//! - [`oauth`]: password-grant login simulation, device-code flow, refresh, profile lookup
//! - [`token_manager`]: guarded refresh/repair of stored tokens and the background sweep
//! - [`device`]: per-code waiter polling device-code approval until expiry
//! - [`accounts`]: account provisioning against every password-grant client
//! - [`ratelimit`]: the upstream's daily quota window and rate-limit headers

pub mod accounts;
pub mod device;
pub mod error;
pub mod impersonation;
pub mod oauth;
pub mod pkce;
pub mod provider;
pub mod ratelimit;
pub mod token_manager;

pub use accounts::AccountLoader;
pub use device::DeviceCodeWaiter;
pub use error::{AuthError, Result};
pub use impersonation::{HttpClients, ImpersonationProfile, RequestClass};
pub use oauth::{DeviceAuthorization, Endpoints, Me, MeHome, TadoOAuth, TokenGrant};
pub use provider::{
    AuthProvider, DeviceAuthApi, ProfileApi, SharedAuthProvider, SharedDeviceAuthApi,
    SharedProfileApi,
};
pub use ratelimit::QuotaTotals;
pub use token_manager::{SweepReport, TokenManager};
