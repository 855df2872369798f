//! Device-code authorization: register a code, then poll until the user
//! approves it or it expires.
//!
//! Each pending code gets its own task whose lifetime is bounded by the
//! code's expiry. A code ends in exactly one terminal status; a waiter
//! stopped by shutdown leaves it `pending` for the startup purge.

use std::time::Duration;

use chrono::Utc;
use tado_proxy_store::{ClientType, Code, CodeStatus, SharedStore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{AuthError, Result};
use crate::provider::{SharedDeviceAuthApi, SharedProfileApi};

/// Interval between device-code exchange attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Creates device codes and drives them to a terminal status.
#[derive(Clone)]
pub struct DeviceCodeWaiter {
    store: SharedStore,
    device: SharedDeviceAuthApi,
    profile: SharedProfileApi,
    poll_interval: Duration,
}

impl DeviceCodeWaiter {
    pub fn new(store: SharedStore, device: SharedDeviceAuthApi, profile: SharedProfileApi) -> Self {
        Self {
            store,
            device,
            profile,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register a device code for `client_id` and start waiting for it.
    ///
    /// Returns the started code; the waiter runs until a terminal status or
    /// `cancel` fires.
    pub async fn create_code(&self, client_id: &str, cancel: CancellationToken) -> Result<Code> {
        let client = self.store.get_client(client_id)?;
        if client.client_type != ClientType::DeviceCode {
            return Err(AuthError::Unsupported(format!(
                "client {} does not use the device-code flow",
                client.client_id
            )));
        }

        let authorization = self.device.device_authorize(&client).await?;
        let expires = Utc::now() + chrono::Duration::seconds(authorization.expires_in);

        let code = self.store.create_code(&client.id)?;
        let code = self.store.start_code(
            &code.id,
            &authorization.device_code,
            &authorization.user_code,
            &authorization.verification_url(&client.client_id),
            expires,
        )?;
        tracing::info!(
            code_id = %code.id,
            client_id = %client.client_id,
            user_code = %code.user_code,
            %expires,
            "Device code created"
        );

        self.spawn(code.clone(), cancel);
        Ok(code)
    }

    /// Run [`Self::wait`] in the background.
    pub fn spawn(&self, code: Code, cancel: CancellationToken) -> JoinHandle<()> {
        let waiter = self.clone();
        tokio::spawn(async move {
            let code_id = code.id.clone();
            match waiter.wait(code, cancel).await {
                Ok(status) => tracing::info!(code_id, %status, "Device code waiter finished"),
                Err(e) => tracing::error!(code_id, error = %e, "Device code waiter failed"),
            }
        })
    }

    /// Poll until the code is approved, expires, or `cancel` fires.
    ///
    /// Returns the status the code was left in.
    pub async fn wait(&self, code: Code, cancel: CancellationToken) -> Result<CodeStatus> {
        let client = self.store.get_client(&code.client)?;
        let expires = code
            .expires
            .ok_or_else(|| AuthError::Protocol(format!("code {} was never started", code.id)))?;
        let remaining = (expires - Utc::now()).to_std().unwrap_or_default();
        let deadline = Instant::now() + remaining;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!(code_id = %code.id, "Device code waiter cancelled");
                    return Ok(CodeStatus::Pending);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.store.finish_code(&code.id, CodeStatus::Expired, None)?;
                    return Ok(CodeStatus::Expired);
                }
                _ = ticker.tick() => {
                    let exchange = self.device.exchange_device_code(&client, &code.device_code);
                    let grant = match tokio::time::timeout_at(deadline, exchange).await {
                        Ok(Ok(grant)) => grant,
                        Ok(Err(e)) if e.is_pending() => continue,
                        Ok(Err(e)) => {
                            tracing::warn!(code_id = %code.id, error = %e, "Device code exchange failed");
                            continue;
                        }
                        // Deadline hit mid-request; the next loop iteration expires the code.
                        Err(_) => continue,
                    };

                    let lookup = self.profile.get_me(&grant.access_token, client.platform);
                    let me = match tokio::time::timeout_at(deadline, lookup).await {
                        Ok(Ok(me)) => me,
                        Ok(Err(e)) => {
                            tracing::warn!(code_id = %code.id, error = %e, "Profile lookup for approved device code failed");
                            continue;
                        }
                        Err(_) => continue,
                    };
                    let Some(account) = self.store.find_account_by_tado_id(&me.id)? else {
                        tracing::warn!(code_id = %code.id, tado_id = %me.id, "Device code approved by unknown account");
                        self.store.finish_code(&code.id, CodeStatus::UnknownAccount, None)?;
                        return Ok(CodeStatus::UnknownAccount);
                    };

                    let token = self.store.upsert_token(
                        &account.id,
                        &client.id,
                        &grant.credentials(Utc::now()),
                    )?;
                    self.store
                        .finish_code(&code.id, CodeStatus::Authorized, Some(&token.id))?;
                    tracing::info!(
                        code_id = %code.id,
                        account = %account.email,
                        token_id = %token.id,
                        "Device code authorized"
                    );
                    return Ok(CodeStatus::Authorized);
                }
            }
        }
    }
}

impl std::fmt::Debug for DeviceCodeWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCodeWaiter")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tado_proxy_store::{Client, NewClient, Platform, RecordStore, SqliteStore, TokenStatus};

    use super::*;
    use crate::oauth::{DeviceAuthorization, Me, MeHome, TokenGrant};
    use crate::provider::{DeviceAuthApi, ProfileApi};

    struct MockDevice {
        expires_in: i64,
        /// Exchange attempts answered with "pending" before approval.
        pending_polls: Option<u32>,
        polls: AtomicU32,
    }

    #[async_trait]
    impl DeviceAuthApi for MockDevice {
        async fn device_authorize(&self, _client: &Client) -> Result<DeviceAuthorization> {
            Ok(DeviceAuthorization {
                device_code: "device-123".to_string(),
                user_code: "ABCD-EFGH".to_string(),
                verification_uri: "https://login.example/device".to_string(),
                verification_uri_complete: "https://login.example/device?user_code=ABCD-EFGH"
                    .to_string(),
                expires_in: self.expires_in,
                interval: 5,
            })
        }

        async fn exchange_device_code(&self, _client: &Client, device_code: &str) -> Result<TokenGrant> {
            assert_eq!(device_code, "device-123");
            let polls = self.polls.fetch_add(1, Ordering::SeqCst);
            match self.pending_polls {
                Some(pending) if polls >= pending => Ok(TokenGrant {
                    access_token: "device-access".to_string(),
                    refresh_token: "device-refresh".to_string(),
                    expires_in: 600,
                    user_id: None,
                }),
                _ => Err(AuthError::AuthorizationPending),
            }
        }
    }

    struct MockProfile {
        tado_id: String,
    }

    #[async_trait]
    impl ProfileApi for MockProfile {
        async fn get_me(&self, access_token: &str, _platform: Platform) -> Result<Me> {
            assert_eq!(access_token, "device-access");
            Ok(Me {
                id: self.tado_id.clone(),
                homes: vec![MeHome {
                    id: 1,
                    name: "Home".to_string(),
                }],
            })
        }
    }

    fn setup(device: MockDevice, tado_id: &str) -> (SharedStore, DeviceCodeWaiter, Client) {
        let store: SharedStore = Arc::new(SqliteStore::open_in_memory().unwrap());
        let client = store
            .create_client(&NewClient {
                name: "device".to_string(),
                client_id: "device-client".to_string(),
                client_type: ClientType::DeviceCode,
                platform: Platform::Mobile,
                redirect_uri: String::new(),
                scope: "home.user offline_access".to_string(),
                daily_limit: None,
                disabled: false,
            })
            .unwrap();
        let account = store.create_account("user@example.com", "pw").unwrap();
        store
            .set_account_profile(&account.id, "4242", &[])
            .unwrap();

        let waiter = DeviceCodeWaiter::new(
            store.clone(),
            Arc::new(device),
            Arc::new(MockProfile {
                tado_id: tado_id.to_string(),
            }),
        )
        .with_poll_interval(Duration::from_millis(10));
        (store, waiter, client)
    }

    fn device(expires_in: i64, pending_polls: Option<u32>) -> MockDevice {
        MockDevice {
            expires_in,
            pending_polls,
            polls: AtomicU32::new(0),
        }
    }

    async fn start(store: &SharedStore, waiter: &DeviceCodeWaiter, client: &Client) -> Code {
        let authorization = waiter.device.device_authorize(client).await.unwrap();
        let code = store.create_code(&client.id).unwrap();
        store
            .start_code(
                &code.id,
                &authorization.device_code,
                &authorization.user_code,
                &authorization.verification_url(&client.client_id),
                Utc::now() + chrono::Duration::seconds(authorization.expires_in),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_code_expires_without_token() {
        let (store, waiter, client) = setup(device(1, None), "4242");
        let code = start(&store, &waiter, &client).await;

        let status = waiter.wait(code.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(status, CodeStatus::Expired);
        assert_eq!(store.get_code(&code.id).unwrap().status, CodeStatus::Expired);
        assert!(store.list_tokens(&Default::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_code_authorized_creates_token() {
        let (store, waiter, client) = setup(device(60, Some(2)), "4242");
        let code = start(&store, &waiter, &client).await;

        let status = waiter.wait(code.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(status, CodeStatus::Authorized);

        let finished = store.get_code(&code.id).unwrap();
        assert_eq!(finished.status, CodeStatus::Authorized);
        let token = store.get_token(finished.token.as_deref().unwrap()).unwrap();
        assert_eq!(token.client, client.id);
        assert_eq!(token.access_token, "device-access");
        assert_eq!(token.status, TokenStatus::Valid);
    }

    #[tokio::test]
    async fn test_code_unknown_account() {
        let (store, waiter, client) = setup(device(60, Some(0)), "9999");
        let code = start(&store, &waiter, &client).await;

        let status = waiter.wait(code.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(status, CodeStatus::UnknownAccount);
        assert_eq!(
            store.get_code(&code.id).unwrap().status,
            CodeStatus::UnknownAccount
        );
        assert!(store.list_tokens(&Default::default()).unwrap().is_empty());
    }

    struct UnreachableProfile;

    #[async_trait]
    impl ProfileApi for UnreachableProfile {
        async fn get_me(&self, _access_token: &str, _platform: Platform) -> Result<Me> {
            Err(AuthError::Network("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_code_expires_when_profile_lookup_keeps_failing() {
        let (store, waiter, client) = setup(device(1, Some(0)), "4242");
        let waiter = DeviceCodeWaiter::new(
            store.clone(),
            waiter.device.clone(),
            Arc::new(UnreachableProfile),
        )
        .with_poll_interval(Duration::from_millis(10));
        let code = start(&store, &waiter, &client).await;

        let status = waiter.wait(code.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(status, CodeStatus::Expired);
        assert_eq!(store.get_code(&code.id).unwrap().status, CodeStatus::Expired);
        assert!(store.list_tokens(&Default::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_leaves_code_pending() {
        let (store, waiter, client) = setup(device(60, None), "4242");
        let code = start(&store, &waiter, &client).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let status = waiter.wait(code.clone(), cancel).await.unwrap();
        assert_eq!(status, CodeStatus::Pending);
        assert_eq!(store.get_code(&code.id).unwrap().status, CodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_code_rejects_password_grant_client() {
        let (store, waiter, _) = setup(device(60, None), "4242");
        let client = store
            .create_client(&NewClient {
                name: "mobile".to_string(),
                client_id: "mobile-client".to_string(),
                client_type: ClientType::PasswordGrant,
                platform: Platform::Mobile,
                redirect_uri: "tado://auth/redirect".to_string(),
                scope: "home.user offline_access".to_string(),
                daily_limit: None,
                disabled: false,
            })
            .unwrap();

        let err = waiter
            .create_code(&client.id, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_create_code_starts_waiter() {
        let (store, waiter, client) = setup(device(60, Some(0)), "4242");

        let code = waiter
            .create_code(&client.id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code.user_code, "ABCD-EFGH");
        assert_eq!(
            code.verification_uri,
            "https://login.example/device?user_code=ABCD-EFGH&client_id=device-client"
        );

        for _ in 0..100 {
            if store.get_code(&code.id).unwrap().status == CodeStatus::Authorized {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device code was not authorized");
    }
}
