//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use serde_json::json;
use tado_proxy_auth::{
    AccountLoader, AuthError, AuthProvider, DeviceAuthApi, DeviceAuthorization, DeviceCodeWaiter,
    HttpClients, Me, ProfileApi, TokenGrant, TokenManager,
};
use tado_proxy_server::{AppState, Server, ServerConfig};
use tado_proxy_store::{
    Client, ClientType, NewClient, Platform, RecordStore, SharedStore, SqliteStore, Token,
    TokenCredentials,
};
use tower::ServiceExt;

// ─────────────────────────────────────────────────────────────────────────────
// Upstream API stand-in
// ─────────────────────────────────────────────────────────────────────────────

/// One call received by the fake upstream API.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub bearer: String,
    pub headers: HeaderMap,
    pub body: String,
}

#[derive(Clone, Default)]
pub struct MockApi {
    pub seen: Arc<Mutex<Vec<SeenRequest>>>,
    /// Access tokens answered with 401.
    pub rejected: Arc<Mutex<HashSet<String>>>,
}

impl MockApi {
    pub fn reject(&self, access_token: &str) {
        self.rejected.lock().unwrap().insert(access_token.to_string());
    }

    pub fn bearers(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|s| s.bearer.clone()).collect()
    }

    pub fn last(&self) -> SeenRequest {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

async fn mock_api(
    State(api): State<MockApi>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();

    api.seen.lock().unwrap().push(SeenRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        bearer: bearer.clone(),
        headers: headers.clone(),
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    if api.rejected.lock().unwrap().contains(&bearer) {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }
    if uri.path().ends_with("/missing") {
        return (StatusCode::NOT_FOUND, axum::Json(json!({"errors": []}))).into_response();
    }

    let mut response = axum::Json(json!({
        "path": uri.path(),
        "bearer": bearer,
        "body": String::from_utf8_lossy(&body),
    }))
    .into_response();
    response
        .headers_mut()
        .insert("x-upstream", "tado".parse().unwrap());
    if uri.path().ends_with("/policy") {
        response.headers_mut().insert(
            "ratelimit-policy",
            "\"perday\";q=100;w=86400".parse().unwrap(),
        );
    }
    response
}

/// Start the fake API on an ephemeral port and return its base URL.
pub async fn spawn_mock_api() -> (MockApi, String) {
    let api = MockApi::default();
    let app = Router::new().fallback(mock_api).with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (api, format!("http://{addr}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity service stand-in
// ─────────────────────────────────────────────────────────────────────────────

/// Identity service that rejects every login and refresh.
pub struct OfflineIdentity;

#[async_trait]
impl AuthProvider for OfflineIdentity {
    async fn refresh(&self, _client: &Client, _refresh_token: &str) -> tado_proxy_auth::Result<TokenGrant> {
        Err(AuthError::Upstream {
            status: 400,
            body: "invalid_grant".to_string(),
        })
    }

    async fn authorize(
        &self,
        _client: &Client,
        _email: &str,
        _password: &str,
    ) -> tado_proxy_auth::Result<TokenGrant> {
        Err(AuthError::Upstream {
            status: 400,
            body: "invalid credentials".to_string(),
        })
    }
}

#[async_trait]
impl DeviceAuthApi for OfflineIdentity {
    async fn device_authorize(&self, _client: &Client) -> tado_proxy_auth::Result<DeviceAuthorization> {
        Ok(DeviceAuthorization {
            device_code: "device".to_string(),
            user_code: "USER-CODE".to_string(),
            verification_uri: "https://login.example/device".to_string(),
            verification_uri_complete: "https://login.example/device?user_code=USER-CODE"
                .to_string(),
            expires_in: 300,
            interval: 5,
        })
    }

    async fn exchange_device_code(
        &self,
        _client: &Client,
        _device_code: &str,
    ) -> tado_proxy_auth::Result<TokenGrant> {
        Err(AuthError::AuthorizationPending)
    }
}

#[async_trait]
impl ProfileApi for OfflineIdentity {
    async fn get_me(&self, _access_token: &str, _platform: Platform) -> tado_proxy_auth::Result<Me> {
        Err(AuthError::Upstream {
            status: 401,
            body: String::new(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

pub struct TestProxy {
    pub store: SharedStore,
    pub api: MockApi,
    pub state: AppState,
    pub router: Router,
}

impl TestProxy {
    pub async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    pub async fn start_with(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let (api, api_base) = spawn_mock_api().await;
        let store: SharedStore = Arc::new(SqliteStore::open_in_memory().unwrap());
        let identity = Arc::new(OfflineIdentity);

        let config = configure(ServerConfig::new(api_base).with_request_logging(false));
        let tokens = Arc::new(TokenManager::new(store.clone(), identity.clone()));
        let accounts = AccountLoader::new(store.clone(), identity.clone(), identity.clone());
        let codes = DeviceCodeWaiter::new(store.clone(), identity.clone(), identity);
        let state = AppState::new(
            config,
            store.clone(),
            Arc::new(HttpClients::new().unwrap()),
            tokens,
            accounts,
            codes,
        );
        let router = Server::new(state.clone()).router();

        Self {
            store,
            api,
            state,
            router,
        }
    }

    /// Store a fresh token for `email` on a client with `limit` requests per day.
    ///
    /// The access token is `"{email}/{client_id}"`.
    pub fn seed_token(
        &self,
        email: &str,
        client_id: &str,
        client_type: ClientType,
        limit: i64,
    ) -> Token {
        let client = self
            .store
            .upsert_client(&NewClient {
                name: client_id.to_string(),
                client_id: client_id.to_string(),
                client_type,
                platform: Platform::Mobile,
                redirect_uri: "tado://auth/redirect".to_string(),
                scope: "home.user offline_access".to_string(),
                daily_limit: Some(limit),
                disabled: false,
            })
            .unwrap();
        let account = match self.store.find_account_by_email(email).unwrap() {
            Some(account) => account,
            None => self.store.create_account(email, "pw").unwrap(),
        };
        self.store
            .upsert_token(
                &account.id,
                &client.id,
                &TokenCredentials {
                    access_token: format!("{email}/{client_id}"),
                    refresh_token: "refresh".to_string(),
                    expires: Utc::now() + Duration::hours(1),
                },
            )
            .unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
