//! OAuth flows against the tado identity service.
//!
//! All requests go through [`HttpClients`] so they carry the impersonation
//! profile of the client's platform.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, LOCATION, ORIGIN,
    REFERER,
};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tado_proxy_store::{Client, Platform, TokenCredentials};

use crate::error::{AuthError, Result};
use crate::impersonation::{HttpClients, ImpersonationProfile, RequestClass};
use crate::pkce::{PkceChallenge, generate_state};
use crate::provider::{AuthProvider, DeviceAuthApi, ProfileApi};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Timezone reported by the login form.
const LOGIN_TIMEZONE: &str = "Europe/Berlin";

/// Upper bound on redirect hops after the login form.
const MAX_REDIRECTS: usize = 10;

/// Base URLs of the upstream services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Identity service, e.g. `https://login.tado.com`.
    pub login_base: String,
    /// API service, e.g. `https://my.tado.com`.
    pub api_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login_base: "https://login.tado.com".to_string(),
            api_base: "https://my.tado.com".to_string(),
        }
    }
}

impl Endpoints {
    pub fn new(login_base: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            login_base: login_base.into().trim_end_matches('/').to_string(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/authorize", self.login_base)
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/token", self.login_base)
    }

    pub fn device_authorize_url(&self) -> String {
        format!("{}/oauth2/device_authorize", self.login_base)
    }

    pub fn me_url(&self) -> String {
        format!("{}/api/v2/me", self.api_base)
    }

    /// Resolve a possibly relative `Location` against the identity service.
    fn resolve(&self, location: &str) -> Result<Url> {
        let base = Url::parse(&format!("{}/", self.login_base))
            .map_err(|e| AuthError::Protocol(format!("invalid login base: {e}")))?;
        base.join(location)
            .map_err(|e| AuthError::Protocol(format!("invalid redirect '{location}': {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
}

impl TokenGrant {
    /// Credentials with an absolute expiry computed from `now`.
    pub fn credentials(&self, now: DateTime<Utc>) -> TokenCredentials {
        TokenCredentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires: now + Duration::seconds(self.expires_in),
        }
    }
}

/// Device authorization response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    #[serde(default)]
    pub interval: i64,
}

impl DeviceAuthorization {
    /// The URL the user opens to approve this code.
    pub fn verification_url(&self, client_id: &str) -> String {
        format!("{}&client_id={}", self.verification_uri_complete, client_id)
    }
}

/// The authenticated user's profile.
#[derive(Debug, Clone, Deserialize)]
pub struct Me {
    pub id: String,
    #[serde(default)]
    pub homes: Vec<MeHome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeHome {
    pub id: i64,
    pub name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// TadoOAuth
// ─────────────────────────────────────────────────────────────────────────────

/// Form-POST implementation of the upstream OAuth flows.
#[derive(Debug, Clone)]
pub struct TadoOAuth {
    endpoints: Endpoints,
    http: Arc<HttpClients>,
}

impl TadoOAuth {
    pub fn new(endpoints: Endpoints, http: Arc<HttpClients>) -> Self {
        Self { endpoints, http }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn http(&self) -> &Arc<HttpClients> {
        &self.http
    }

    /// Password-grant authorization by simulating the login form.
    pub async fn authorize(
        &self,
        client: &Client,
        email: &str,
        password: &str,
    ) -> Result<TokenGrant> {
        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let jar = Jar::default();
        let platform = client.platform;

        // Login page, for session cookies.
        let query = encode_form(&[
            ("client_id", client.client_id.as_str()),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", client.scope.as_str()),
            ("state", state.as_str()),
        ]);
        let page_url = self.endpoints.resolve(&format!(
            "{}?{}",
            self.endpoints.authorize_url(),
            query
        ))?;
        let response = self
            .send_auth(platform, &jar, Method::GET, &page_url, None, None)
            .await?;
        tracing::debug!(client_id = %client.client_id, status = %response.status(), "Fetched login page");

        // Login form.
        let device_name = ImpersonationProfile::for_platform(platform).device_name;
        let form = encode_form(&[
            ("captcha_token", ""),
            ("client_id", client.client_id.as_str()),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("metaData.device.name", device_name),
            ("metaData.device.type", "BROWSER"),
            ("nonce", ""),
            ("oauth_context", ""),
            ("pendingIdPLinkId", ""),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("response_mode", ""),
            ("response_type", "code"),
            ("scope", client.scope.as_str()),
            ("state", state.as_str()),
            ("timezone", LOGIN_TIMEZONE),
            ("user_code", ""),
            ("userVerifyingPlatformAuthenticatorAvailable", "true"),
            ("loginId", email),
            ("password", password),
        ]);
        let form_url = self.endpoints.resolve(&self.endpoints.authorize_url())?;
        let response = self
            .send_auth(
                platform,
                &jar,
                Method::POST,
                &form_url,
                Some(&page_url),
                Some(form),
            )
            .await?;

        let mut location = expect_redirect(response, "login form").await?;
        let mut hops = 0;
        while !location.starts_with(client.redirect_uri.as_str()) {
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(AuthError::Protocol(
                    "too many redirects after login".to_string(),
                ));
            }
            let hop_url = self.endpoints.resolve(&location)?;
            let response = self
                .send_auth(platform, &jar, Method::GET, &hop_url, Some(&form_url), None)
                .await?;
            location = expect_redirect(response, "login redirect").await?;
        }

        let code = extract_code(&location, &state)?;
        tracing::debug!(client_id = %client.client_id, hops, "Obtained authorization code");

        let form = encode_form(&[
            ("scope", client.scope.as_str()),
            ("code", code.as_str()),
            ("client_id", client.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code_verifier", pkce.verifier.as_str()),
            ("redirect_uri", client.redirect_uri.as_str()),
        ]);
        let response = self.send_token_form(platform, &self.endpoints.token_url(), form).await?;
        parse_ok(response, "token exchange").await
    }

    /// Register a device code. Always uses the mobile token profile.
    pub async fn device_authorize(&self, client: &Client) -> Result<DeviceAuthorization> {
        let url = format!(
            "{}?{}",
            self.endpoints.device_authorize_url(),
            encode_form(&[("client_id", client.client_id.as_str()), ("scope", client.scope.as_str())])
        );
        let response = self
            .http
            .request(
                Platform::Mobile,
                RequestClass::Token,
                Method::POST,
                &url,
                &HeaderMap::new(),
            )
            .send()
            .await?;
        parse_ok(response, "device authorization").await
    }

    /// Exchange an approved device code. Any non-200 is reported as pending.
    pub async fn exchange_device_code(
        &self,
        client: &Client,
        device_code: &str,
    ) -> Result<TokenGrant> {
        let form = encode_form(&[
            ("client_id", client.client_id.as_str()),
            ("device_code", device_code),
            ("grant_type", DEVICE_CODE_GRANT),
        ]);
        let response = self
            .send_token_form(client.platform, &self.endpoints.token_url(), form)
            .await?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::trace!(%status, body = %body, "Device code not yet approved");
            return Err(AuthError::AuthorizationPending);
        }
        parse_json(response).await
    }

    /// Exchange a refresh token for fresh credentials.
    pub async fn refresh(&self, client: &Client, refresh_token: &str) -> Result<TokenGrant> {
        let form = encode_form(&[
            ("client_id", client.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ]);
        let response = self
            .send_token_form(client.platform, &self.endpoints.token_url(), form)
            .await?;
        let grant: TokenGrant = parse_ok(response, "token refresh").await?;

        if grant.access_token.is_empty() || grant.refresh_token.is_empty() {
            return Err(AuthError::Protocol(
                "empty access or refresh token received".to_string(),
            ));
        }
        Ok(grant)
    }

    /// Fetch the profile of the account behind `access_token`.
    pub async fn get_me(&self, access_token: &str, platform: Platform) -> Result<Me> {
        let mut dynamic = HeaderMap::new();
        dynamic.insert(AUTHORIZATION, bearer(access_token)?);

        let response = self
            .http
            .request(
                platform,
                RequestClass::Api,
                Method::GET,
                &self.endpoints.me_url(),
                &dynamic,
            )
            .send()
            .await?;
        parse_ok(response, "profile").await
    }

    async fn send_auth(
        &self,
        platform: Platform,
        jar: &Jar,
        method: Method,
        url: &Url,
        referer: Option<&Url>,
        form: Option<String>,
    ) -> Result<reqwest::Response> {
        let mut dynamic = HeaderMap::new();
        if let Some(referer) = referer {
            dynamic.insert(REFERER, header_value(referer.as_str())?);
        }
        if let Some(cookie) = jar.cookies(url) {
            dynamic.insert(COOKIE, cookie);
        }
        if let Some(form) = &form {
            dynamic.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
            dynamic.insert(CONTENT_LENGTH, HeaderValue::from(form.len()));
            dynamic.insert(ORIGIN, header_value(&self.endpoints.login_base)?);
        }

        let mut request =
            self.http
                .request(platform, RequestClass::Auth, method, url.as_str(), &dynamic);
        if let Some(form) = form {
            request = request.body(form);
        }

        let response = request.send().await?;
        let mut set_cookies = response.headers().get_all(reqwest::header::SET_COOKIE).iter();
        jar.set_cookies(&mut set_cookies, url);
        Ok(response)
    }

    async fn send_token_form(
        &self,
        platform: Platform,
        url: &str,
        form: String,
    ) -> Result<reqwest::Response> {
        let mut dynamic = HeaderMap::new();
        dynamic.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
        dynamic.insert(CONTENT_LENGTH, HeaderValue::from(form.len()));

        Ok(self
            .http
            .request(platform, RequestClass::Token, Method::POST, url, &dynamic)
            .body(form)
            .send()
            .await?)
    }
}

#[async_trait]
impl AuthProvider for TadoOAuth {
    async fn refresh(&self, client: &Client, refresh_token: &str) -> Result<TokenGrant> {
        TadoOAuth::refresh(self, client, refresh_token).await
    }

    async fn authorize(&self, client: &Client, email: &str, password: &str) -> Result<TokenGrant> {
        TadoOAuth::authorize(self, client, email, password).await
    }
}

#[async_trait]
impl DeviceAuthApi for TadoOAuth {
    async fn device_authorize(&self, client: &Client) -> Result<DeviceAuthorization> {
        TadoOAuth::device_authorize(self, client).await
    }

    async fn exchange_device_code(&self, client: &Client, device_code: &str) -> Result<TokenGrant> {
        TadoOAuth::exchange_device_code(self, client, device_code).await
    }
}

#[async_trait]
impl ProfileApi for TadoOAuth {
    async fn get_me(&self, access_token: &str, platform: Platform) -> Result<Me> {
        TadoOAuth::get_me(self, access_token, platform).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// URL-encode pairs in the given order.
pub fn encode_form(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub(crate) fn bearer(access_token: &str) -> Result<HeaderValue> {
    let mut value = header_value(&format!("Bearer {access_token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AuthError::Protocol(format!("invalid header value: {e}")))
}

async fn expect_redirect(response: reqwest::Response, step: &str) -> Result<String> {
    if response.status() != StatusCode::FOUND {
        return Err(upstream_error(response).await);
    }
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AuthError::Protocol(format!("{step}: redirect without location")))
}

/// Pull the authorization code out of the final redirect and check `state`.
fn extract_code(location: &str, expected_state: &str) -> Result<String> {
    let url = Url::parse(location)
        .map_err(|e| AuthError::Protocol(format!("invalid redirect '{location}': {e}")))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    let code = code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AuthError::Protocol("no code in redirect URI".to_string()))?;
    if state.as_deref() != Some(expected_state) {
        return Err(AuthError::Protocol("state validation failed".to_string()));
    }
    Ok(code)
}

async fn upstream_error(response: reqwest::Response) -> AuthError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    AuthError::Upstream { status, body }
}

async fn parse_ok<T: DeserializeOwned>(response: reqwest::Response, step: &str) -> Result<T> {
    if response.status() != StatusCode::OK {
        let err = upstream_error(response).await;
        tracing::debug!(step, error = %err, "Upstream rejected request");
        return Err(err);
    }
    parse_json(response).await
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let body = response.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| AuthError::Serialization(format!("Failed to parse response: {e}")))
}
