//! Record types persisted by the store.
//!
//! String forms of the enums are shared by the database, the JSON admin
//! API and configuration files.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::StoreError;

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Invalid(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// How tokens for a client are obtained.
    ClientType {
        PasswordGrant => "passwordGrant",
        DeviceCode => "deviceCode",
    }
);

string_enum!(
    /// Which impersonation profile a client's traffic uses.
    Platform {
        Web => "web",
        Mobile => "mobile",
    }
);

string_enum!(
    TokenStatus {
        Valid => "valid",
        Invalid => "invalid",
    }
);

string_enum!(
    /// Lifecycle of a device-code authorization attempt.
    ///
    /// `Pending` is the only non-terminal status.
    CodeStatus {
        Pending => "pending",
        Authorized => "authorized",
        Expired => "expired",
        UnknownAccount => "unknownAccount",
    }
);

impl CodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CodeStatus::Pending)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// A registered upstream OAuth application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    /// Upstream OAuth client id.
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    pub platform: Platform,
    #[serde(rename = "redirectURI")]
    pub redirect_uri: String,
    pub scope: String,
    pub daily_limit: i64,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating or seeding a [`Client`].
#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub client_id: String,
    pub client_type: ClientType,
    pub platform: Platform,
    pub redirect_uri: String,
    pub scope: String,
    /// `None` keeps the stored limit on upsert (0 for new clients).
    pub daily_limit: Option<i64>,
    pub disabled: bool,
}

/// End-user credentials for the upstream service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(rename = "tadoID")]
    pub tado_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Home {
    pub id: String,
    #[serde(rename = "tadoID")]
    pub tado_id: i64,
    pub name: String,
}

/// Fresh credential material from a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires: DateTime<Utc>,
}

/// One OAuth credential for an (account, client) pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub account: String,
    pub client: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub expires: DateTime<Utc>,
    pub used: Option<DateTime<Utc>>,
    pub status: TokenStatus,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// True when the access token expires within `buffer` of `now`.
    pub fn expires_within(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        now >= self.expires - buffer
    }

    /// True when the token must be refreshed before use.
    pub fn needs_refresh(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        self.status != TokenStatus::Valid || self.expires_within(buffer, now)
    }
}

/// Selection criteria for [`crate::RecordStore::list_tokens`].
#[derive(Debug, Clone, Default)]
pub struct TokenFilter {
    pub status: Option<TokenStatus>,
    /// Exclude tokens that are disabled or whose client is disabled.
    pub enabled_only: bool,
    pub account_email: Option<String>,
    /// Upstream home id owned by the token's account.
    pub home_tado_id: Option<i64>,
}

impl TokenFilter {
    /// Enabled tokens with `status = valid`.
    pub fn usable() -> Self {
        Self {
            status: Some(TokenStatus::Valid),
            enabled_only: true,
            ..Default::default()
        }
    }

    pub fn with_account_email(mut self, email: impl Into<String>) -> Self {
        self.account_email = Some(email.into());
        self
    }

    pub fn with_home(mut self, tado_id: i64) -> Self {
        self.home_tado_id = Some(tado_id);
        self
    }
}

/// A pending or finished device-code authorization attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    pub id: String,
    pub client: String,
    #[serde(skip_serializing)]
    pub device_code: String,
    pub user_code: String,
    #[serde(rename = "verificationURI")]
    pub verification_uri: String,
    pub expires: Option<DateTime<Utc>>,
    pub status: CodeStatus,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit row for one proxied call.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: String,
    pub token: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRequestLog {
    pub token: String,
    pub method: String,
    pub url: String,
    pub status: u16,
}
