//! Token lifecycle: on-demand refresh, repair and the background sweep.
//!
//! ```text
//!            refresh ok / re-authorize ok / quota reset
//!        ┌────────────────────────────────────────────┐
//!        ▼                                            │
//!     valid ──── refresh failed / upstream 401 ───▶ invalid
//! ```
//!
//! `disabled` tokens are skipped by the sweep regardless of status.
//! Refresh and repair for a single token id are serialized through a keyed
//! lock registry; the authoritative record is re-read after every lock
//! acquisition.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tado_proxy_store::{
    ClientType, SharedStore, Token, TokenFilter, TokenStatus,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AuthError, Result};
use crate::provider::SharedAuthProvider;
use crate::ratelimit::ratelimit_cutoff_at;

/// Tokens are refreshed this long before they expire.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(1);

/// Interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

// ============================================================================
// Keyed locks
// ============================================================================

/// Lazily created per-token-id async locks.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

// ============================================================================
// TokenManager
// ============================================================================

/// Outcome of one background sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub repaired: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// What a successful refresh does to the token's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    /// Requested by a caller that wants a usable token: due when expiring or
    /// not valid, and the token becomes valid.
    OnDemand,
    /// Requested by the sweep: due only when expiring, status is kept.
    /// Invalid tokens only become valid again through `repair`.
    Sweep,
}

/// Owns refresh and repair policy for every stored token.
pub struct TokenManager {
    store: SharedStore,
    provider: SharedAuthProvider,
    refresh_buffer: Duration,
    sweep_interval: std::time::Duration,
    locks: KeyedLocks,
}

impl TokenManager {
    pub fn new(store: SharedStore, provider: SharedAuthProvider) -> Self {
        Self {
            store,
            provider,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            locks: KeyedLocks::default(),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn with_sweep_interval(mut self, interval: std::time::Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Return `token` if it is valid and outside the refresh buffer,
    /// otherwise refresh it (re-authorizing password-grant tokens when the
    /// refresh fails).
    pub async fn get_valid_token(&self, token: &Token) -> Result<Token> {
        if !token.needs_refresh(self.refresh_buffer, Utc::now()) {
            return Ok(token.clone());
        }

        match self.refresh_guarded(&token.id, RefreshMode::OnDemand).await {
            Ok(token) => Ok(token),
            Err(err) => {
                let client = self.store.get_client(&token.client)?;
                if client.client_type != ClientType::PasswordGrant {
                    return Err(err);
                }
                tracing::warn!(
                    token_id = %token.id,
                    error = %err,
                    "Refresh failed, re-authorizing with account credentials"
                );
                self.reauthorize_guarded(&token.id).await
            }
        }
    }

    /// Mark a token invalid after the upstream rejected it.
    pub async fn mark_token_invalid(&self, token_id: &str) -> Result<()> {
        let _guard = self.locks.lock(token_id).await;
        self.store
            .set_token_status(token_id, TokenStatus::Invalid, Some(Utc::now()))?;
        tracing::info!(token_id, "Marked token invalid");
        Ok(())
    }

    /// Record that a token was just used.
    pub fn update_token_used(&self, token_id: &str) -> Result<()> {
        self.store.touch_token(token_id, Utc::now())?;
        Ok(())
    }

    /// Repair invalid tokens and refresh expiring ones.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let filter = TokenFilter {
            enabled_only: true,
            ..Default::default()
        };
        let tokens = self.store.list_tokens(&filter)?;
        let mut report = SweepReport {
            checked: tokens.len(),
            ..Default::default()
        };

        for token in tokens {
            if token.status != TokenStatus::Valid {
                match self.repair(&token).await {
                    Ok(true) => report.repaired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(token_id = %token.id, error = %e, "Failed to repair token");
                    }
                }
            }

            let current = self.store.get_token(&token.id)?;
            if current.expires_within(self.refresh_buffer, Utc::now()) {
                match self.refresh_guarded(&token.id, RefreshMode::Sweep).await {
                    Ok(_) => report.refreshed += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(token_id = %token.id, error = %e, "Failed to refresh token");
                    }
                }
            }
        }

        self.locks.prune();
        Ok(report)
    }

    /// Run [`Self::sweep`] on the configured interval until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval = ?self.sweep_interval, "Token sweeper started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(report) if report.repaired + report.refreshed + report.failed > 0 => {
                                tracing::info!(
                                    checked = report.checked,
                                    repaired = report.repaired,
                                    refreshed = report.refreshed,
                                    failed = report.failed,
                                    "Token sweep finished"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "Token sweep failed"),
                        }
                    }
                }
            }

            tracing::info!("Token sweeper stopped");
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Repair an invalid token. Returns whether it is valid again.
    async fn repair(&self, token: &Token) -> Result<bool> {
        let client = self.store.get_client(&token.client)?;
        match client.client_type {
            ClientType::PasswordGrant => {
                self.reauthorize_guarded(&token.id).await?;
                Ok(true)
            }
            ClientType::DeviceCode => self.reenable_after_reset(&token.id, Utc::now()).await,
        }
    }

    /// Flip a device-code token back to valid once the quota window it was
    /// last used in has ended.
    async fn reenable_after_reset(&self, token_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let cutoff = ratelimit_cutoff_at(now);
        let _guard = self.locks.lock(token_id).await;

        let token = self.store.get_token(token_id)?;
        if token.status == TokenStatus::Valid {
            return Ok(false);
        }
        let used_before_reset = token.used.is_none_or(|used| used < cutoff);
        if now > cutoff && used_before_reset {
            self.store
                .set_token_status(token_id, TokenStatus::Valid, None)?;
            tracing::info!(token_id, %cutoff, "Re-enabled token after quota reset");
            return Ok(true);
        }
        Ok(false)
    }

    async fn refresh_guarded(&self, token_id: &str, mode: RefreshMode) -> Result<Token> {
        let _guard = self.locks.lock(token_id).await;

        let token = self.store.get_token(token_id)?;
        let now = Utc::now();
        let due = match mode {
            RefreshMode::OnDemand => token.needs_refresh(self.refresh_buffer, now),
            RefreshMode::Sweep => token.expires_within(self.refresh_buffer, now),
        };
        if !due {
            return Ok(token);
        }

        let client = self.store.get_client(&token.client)?;
        match self.provider.refresh(&client, &token.refresh_token).await {
            Ok(grant) => {
                let status = match mode {
                    RefreshMode::OnDemand => TokenStatus::Valid,
                    RefreshMode::Sweep => token.status,
                };
                self.store
                    .store_token_credentials(token_id, &grant.credentials(Utc::now()), status)?;
                tracing::info!(token_id, client_id = %client.client_id, "Refreshed token");
                Ok(self.store.get_token(token_id)?)
            }
            Err(err) => {
                self.invalidate_after_failure(token_id);
                Err(err)
            }
        }
    }

    async fn reauthorize_guarded(&self, token_id: &str) -> Result<Token> {
        let _guard = self.locks.lock(token_id).await;

        let token = self.store.get_token(token_id)?;
        if !token.needs_refresh(self.refresh_buffer, Utc::now()) {
            return Ok(token);
        }

        let client = self.store.get_client(&token.client)?;
        if client.client_type != ClientType::PasswordGrant {
            return Err(AuthError::Unsupported(format!(
                "client {} cannot re-authorize with credentials",
                client.client_id
            )));
        }
        let account = self.store.get_account(&token.account)?;

        match self
            .provider
            .authorize(&client, &account.email, &account.password)
            .await
        {
            Ok(grant) => {
                self.store.store_token_credentials(
                    token_id,
                    &grant.credentials(Utc::now()),
                    TokenStatus::Valid,
                )?;
                tracing::info!(token_id, account = %account.email, "Re-authorized token");
                Ok(self.store.get_token(token_id)?)
            }
            Err(err) => {
                self.invalidate_after_failure(token_id);
                Err(err)
            }
        }
    }

    fn invalidate_after_failure(&self, token_id: &str) {
        if let Err(e) = self
            .store
            .set_token_status(token_id, TokenStatus::Invalid, None)
        {
            tracing::error!(token_id, error = %e, "Failed to mark token invalid");
        }
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("refresh_buffer", &self.refresh_buffer)
            .field("sweep_interval", &self.sweep_interval)
            .field("locks", &self.locks.len())
            .finish()
    }
}
