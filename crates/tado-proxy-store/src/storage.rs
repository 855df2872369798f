//! Storage abstraction for proxy records.
//!
//! ```text
//! RecordStore (trait)   - filtered queries, create/update/delete, counts,
//!                         transactional purges
//!     └── SqliteStore   - default SQLite implementation
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::Result;
use crate::types::{
    Account, Client, ClientType, Code, CodeStatus, Home, NewClient, NewRequestLog, RequestLog,
    Token, TokenCredentials, TokenFilter, TokenStatus,
};

/// The record store consumed by the token manager, the device-code waiter
/// and the proxy dispatcher.
///
/// Every method is an atomic single-record operation unless documented as
/// transactional.
pub trait RecordStore: Send + Sync {
    // ── Clients ─────────────────────────────────────────────────────────

    fn create_client(&self, client: &NewClient) -> Result<Client>;

    /// Insert or update a client keyed by its upstream client id.
    fn upsert_client(&self, client: &NewClient) -> Result<Client>;

    fn get_client(&self, id: &str) -> Result<Client>;

    fn list_clients(&self, client_type: Option<ClientType>) -> Result<Vec<Client>>;

    fn set_client_daily_limit(&self, id: &str, daily_limit: i64) -> Result<()>;

    // ── Accounts & homes ────────────────────────────────────────────────

    fn create_account(&self, email: &str, password: &str) -> Result<Account>;

    fn get_account(&self, id: &str) -> Result<Account>;

    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    fn find_account_by_tado_id(&self, tado_id: &str) -> Result<Option<Account>>;

    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Store the upstream account id and replace the account's home links
    /// (transactional).
    fn set_account_profile(&self, id: &str, tado_id: &str, home_ids: &[String]) -> Result<()>;

    /// Delete an account together with its tokens and home links.
    fn delete_account(&self, id: &str) -> Result<()>;

    fn upsert_home(&self, tado_id: i64, name: &str) -> Result<Home>;

    fn list_account_homes(&self, account_id: &str) -> Result<Vec<Home>>;

    // ── Tokens ──────────────────────────────────────────────────────────

    /// Create or overwrite the token for an (account, client) pair and mark
    /// it valid.
    fn upsert_token(
        &self,
        account_id: &str,
        client_id: &str,
        credentials: &TokenCredentials,
    ) -> Result<Token>;

    fn get_token(&self, id: &str) -> Result<Token>;

    fn find_token(&self, account_id: &str, client_id: &str) -> Result<Option<Token>>;

    /// Tokens matching `filter`, least recently used first.
    fn list_tokens(&self, filter: &TokenFilter) -> Result<Vec<Token>>;

    fn store_token_credentials(
        &self,
        id: &str,
        credentials: &TokenCredentials,
        status: TokenStatus,
    ) -> Result<()>;

    /// Set the status, and the `used` timestamp when given.
    fn set_token_status(
        &self,
        id: &str,
        status: TokenStatus,
        used: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn touch_token(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    fn set_token_disabled(&self, id: &str, disabled: bool) -> Result<()>;

    // ── Device codes ────────────────────────────────────────────────────

    fn create_code(&self, client_id: &str) -> Result<Code>;

    fn get_code(&self, id: &str) -> Result<Code>;

    /// Record the upstream device authorization for a pending code.
    fn start_code(
        &self,
        id: &str,
        device_code: &str,
        user_code: &str,
        verification_uri: &str,
        expires: DateTime<Utc>,
    ) -> Result<Code>;

    /// Move a pending code into a terminal status.
    fn finish_code(&self, id: &str, status: CodeStatus, token_id: Option<&str>) -> Result<()>;

    /// Delete every code not in `authorized` status (transactional).
    fn purge_unauthorized_codes(&self) -> Result<usize>;

    // ── Request logs ────────────────────────────────────────────────────

    fn log_request(&self, entry: &NewRequestLog) -> Result<RequestLog>;

    /// Requests made with `token_id` strictly after `since`.
    fn count_requests(&self, token_id: &str, since: DateTime<Utc>) -> Result<i64>;

    /// Requests made with any token strictly after `since`.
    fn count_all_requests(&self, since: DateTime<Utc>) -> Result<i64>;

    /// Delete request logs created before `cutoff` (transactional).
    fn purge_requests_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Shared record store for use across async contexts.
pub type SharedStore = Arc<dyn RecordStore>;
