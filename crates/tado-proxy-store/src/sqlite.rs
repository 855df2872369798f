use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::storage::RecordStore;
use crate::types::{
    Account, Client, ClientType, Code, CodeStatus, Home, NewClient, NewRequestLog, RequestLog,
    Token, TokenCredentials, TokenFilter, TokenStatus,
};
use crate::{Result, StoreError};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

const CLIENT_COLUMNS: &str =
    "id, name, client_id, type, platform, redirect_uri, scope, daily_limit, disabled, created_at";

const ACCOUNT_COLUMNS: &str = "id, email, password, tado_id, created_at";

const TOKEN_COLUMNS: &str = "t.id, t.account_id, t.client_id, t.access_token, t.refresh_token, \
     t.expires, t.used, t.status, t.disabled, t.created_at";

const CODE_COLUMNS: &str = "id, client_id, device_code, user_code, verification_uri, expires, \
     status, token_id, created_at";

/// SQLite-backed record store.
///
/// Thread-safe via an internal `Mutex<Connection>`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Invalid(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        tracing::debug!(path = %path.display(), "Opened record store");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&mut self) -> Result<()> {
        embedded::migrations::runner()
            .run(self.conn.get_mut())
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn select_client(&self, where_clause: &str, param: &str) -> Result<Option<Client>> {
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE {where_clause}");
        Ok(self
            .conn()
            .query_row(&sql, params![param], row_to_client)
            .optional()?)
    }
}

impl RecordStore for SqliteStore {
    // ── Clients ─────────────────────────────────────────────────────

    fn create_client(&self, client: &NewClient) -> Result<Client> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO clients (id, name, client_id, type, platform, redirect_uri, scope, daily_limit, disabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    client.name,
                    client.client_id,
                    client.client_type.as_str(),
                    client.platform.as_str(),
                    client.redirect_uri,
                    client.scope,
                    client.daily_limit.unwrap_or(0),
                    client.disabled,
                    fmt_dt(Utc::now()),
                ],
            )
            .map_err(|e| StoreError::from_insert(e, &format!("client {}", client.client_id)))?;
        self.get_client(&id)
    }

    fn upsert_client(&self, client: &NewClient) -> Result<Client> {
        self.conn().execute(
            "INSERT INTO clients (id, name, client_id, type, platform, redirect_uri, scope, daily_limit, disabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, 0), ?9, ?10)
             ON CONFLICT(client_id) DO UPDATE SET
                 name = excluded.name,
                 type = excluded.type,
                 platform = excluded.platform,
                 redirect_uri = excluded.redirect_uri,
                 scope = excluded.scope,
                 daily_limit = COALESCE(?8, clients.daily_limit),
                 disabled = excluded.disabled",
            params![
                Uuid::new_v4().to_string(),
                client.name,
                client.client_id,
                client.client_type.as_str(),
                client.platform.as_str(),
                client.redirect_uri,
                client.scope,
                client.daily_limit,
                client.disabled,
                fmt_dt(Utc::now()),
            ],
        )?;
        self.select_client("client_id = ?1", &client.client_id)?
            .ok_or_else(|| StoreError::NotFound(format!("client {}", client.client_id)))
    }

    fn get_client(&self, id: &str) -> Result<Client> {
        self.select_client("id = ?1", id)?
            .ok_or_else(|| StoreError::NotFound(format!("client {id}")))
    }

    fn list_clients(&self, client_type: Option<ClientType>) -> Result<Vec<Client>> {
        let conn = self.conn();
        let mut rows = Vec::new();
        if let Some(client_type) = client_type {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CLIENT_COLUMNS} FROM clients WHERE type = ?1 ORDER BY created_at"
            ))?;
            for r in stmt.query_map(params![client_type.as_str()], row_to_client)? {
                rows.push(r?);
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CLIENT_COLUMNS} FROM clients ORDER BY created_at"
            ))?;
            for r in stmt.query_map([], row_to_client)? {
                rows.push(r?);
            }
        }
        Ok(rows)
    }

    fn set_client_daily_limit(&self, id: &str, daily_limit: i64) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE clients SET daily_limit = ?1 WHERE id = ?2",
            params![daily_limit, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("client {id}")));
        }
        Ok(())
    }

    // ── Accounts & homes ────────────────────────────────────────────

    fn create_account(&self, email: &str, password: &str) -> Result<Account> {
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password: password.to_string(),
            tado_id: None,
            created_at: now,
        };
        self.conn()
            .execute(
                "INSERT INTO accounts (id, email, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![account.id, account.email, account.password, fmt_dt(now)],
            )
            .map_err(|e| StoreError::from_insert(e, &format!("account {email}")))?;
        Ok(account)
    }

    fn get_account(&self, id: &str) -> Result<Account> {
        self.conn()
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                row_to_account,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
    }

    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = ?1"),
                params![email],
                row_to_account,
            )
            .optional()?)
    }

    fn find_account_by_tado_id(&self, tado_id: &str) -> Result<Option<Account>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE tado_id = ?1 LIMIT 1"),
                params![tado_id],
                row_to_account,
            )
            .optional()?)
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at"
        ))?;
        let mut accounts = Vec::new();
        for a in stmt.query_map([], row_to_account)? {
            accounts.push(a?);
        }
        Ok(accounts)
    }

    fn set_account_profile(&self, id: &str, tado_id: &str, home_ids: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE accounts SET tado_id = ?1 WHERE id = ?2",
            params![tado_id, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("account {id}")));
        }

        tx.execute(
            "DELETE FROM account_homes WHERE account_id = ?1",
            params![id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO account_homes (account_id, home_id) VALUES (?1, ?2)",
            )?;
            for home_id in home_ids {
                stmt.execute(params![id, home_id])
                    .map_err(|e| StoreError::from_insert(e, &format!("home link {home_id}")))?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_account(&self, id: &str) -> Result<()> {
        let deleted = self
            .conn()
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    fn upsert_home(&self, tado_id: i64, name: &str) -> Result<Home> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO homes (id, tado_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(tado_id) DO UPDATE SET name = excluded.name",
            params![Uuid::new_v4().to_string(), tado_id, name],
        )?;
        Ok(conn.query_row(
            "SELECT id, tado_id, name FROM homes WHERE tado_id = ?1",
            params![tado_id],
            row_to_home,
        )?)
    }

    fn list_account_homes(&self, account_id: &str) -> Result<Vec<Home>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT h.id, h.tado_id, h.name FROM homes h
             JOIN account_homes ah ON ah.home_id = h.id
             WHERE ah.account_id = ?1 ORDER BY h.tado_id",
        )?;
        let mut homes = Vec::new();
        for h in stmt.query_map(params![account_id], row_to_home)? {
            homes.push(h?);
        }
        Ok(homes)
    }

    // ── Tokens ──────────────────────────────────────────────────────

    fn upsert_token(
        &self,
        account_id: &str,
        client_id: &str,
        credentials: &TokenCredentials,
    ) -> Result<Token> {
        self.conn()
            .execute(
                "INSERT INTO tokens (id, account_id, client_id, access_token, refresh_token, expires, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'valid', ?7)
             ON CONFLICT(account_id, client_id) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 expires = excluded.expires,
                 status = 'valid'",
                params![
                    Uuid::new_v4().to_string(),
                    account_id,
                    client_id,
                    credentials.access_token,
                    credentials.refresh_token,
                    fmt_dt(credentials.expires),
                    fmt_dt(Utc::now()),
                ],
            )
            .map_err(|e| StoreError::from_insert(e, "token"))?;

        self.find_token(account_id, client_id)?
            .ok_or_else(|| StoreError::NotFound(format!("token for account {account_id}")))
    }

    fn get_token(&self, id: &str) -> Result<Token> {
        self.conn()
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens t WHERE t.id = ?1"),
                params![id],
                row_to_token,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("token {id}")))
    }

    fn find_token(&self, account_id: &str, client_id: &str) -> Result<Option<Token>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM tokens t WHERE t.account_id = ?1 AND t.client_id = ?2"
                ),
                params![account_id, client_id],
                row_to_token,
            )
            .optional()?)
    }

    fn list_tokens(&self, filter: &TokenFilter) -> Result<Vec<Token>> {
        let mut sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens t
             JOIN accounts a ON a.id = t.account_id
             JOIN clients c ON c.id = t.client_id
             WHERE 1 = 1"
        );
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            values.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND t.status = ?{}", values.len()));
        }
        if filter.enabled_only {
            sql.push_str(" AND t.disabled = 0 AND c.disabled = 0");
        }
        if let Some(email) = &filter.account_email {
            values.push(Box::new(email.clone()));
            sql.push_str(&format!(" AND a.email = ?{}", values.len()));
        }
        if let Some(home) = filter.home_tado_id {
            values.push(Box::new(home));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM account_homes ah JOIN homes h ON h.id = ah.home_id
                   WHERE ah.account_id = t.account_id AND h.tado_id = ?{})",
                values.len()
            ));
        }
        sql.push_str(" ORDER BY t.used ASC, t.created_at ASC");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut tokens = Vec::new();
        for t in stmt.query_map(params.as_slice(), row_to_token)? {
            tokens.push(t?);
        }
        Ok(tokens)
    }

    fn store_token_credentials(
        &self,
        id: &str,
        credentials: &TokenCredentials,
        status: TokenStatus,
    ) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE tokens SET access_token = ?1, refresh_token = ?2, expires = ?3, status = ?4
             WHERE id = ?5",
            params![
                credentials.access_token,
                credentials.refresh_token,
                fmt_dt(credentials.expires),
                status.as_str(),
                id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("token {id}")));
        }
        Ok(())
    }

    fn set_token_status(
        &self,
        id: &str,
        status: TokenStatus,
        used: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE tokens SET status = ?1, used = COALESCE(?2, used) WHERE id = ?3",
            params![status.as_str(), used.map(fmt_dt), id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("token {id}")));
        }
        Ok(())
    }

    fn touch_token(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE tokens SET used = ?1 WHERE id = ?2",
            params![fmt_dt(at), id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("token {id}")));
        }
        Ok(())
    }

    fn set_token_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE tokens SET disabled = ?1 WHERE id = ?2",
            params![disabled, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("token {id}")));
        }
        Ok(())
    }

    // ── Device codes ────────────────────────────────────────────────

    fn create_code(&self, client_id: &str) -> Result<Code> {
        let now = Utc::now();
        let code = Code {
            id: Uuid::new_v4().to_string(),
            client: client_id.to_string(),
            device_code: String::new(),
            user_code: String::new(),
            verification_uri: String::new(),
            expires: None,
            status: CodeStatus::Pending,
            token: None,
            created_at: now,
        };
        self.conn()
            .execute(
                "INSERT INTO codes (id, client_id, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![code.id, code.client, code.status.as_str(), fmt_dt(now)],
            )
            .map_err(|e| StoreError::from_insert(e, "code"))?;
        Ok(code)
    }

    fn get_code(&self, id: &str) -> Result<Code> {
        self.conn()
            .query_row(
                &format!("SELECT {CODE_COLUMNS} FROM codes WHERE id = ?1"),
                params![id],
                row_to_code,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("code {id}")))
    }

    fn start_code(
        &self,
        id: &str,
        device_code: &str,
        user_code: &str,
        verification_uri: &str,
        expires: DateTime<Utc>,
    ) -> Result<Code> {
        let updated = self.conn().execute(
            "UPDATE codes SET device_code = ?1, user_code = ?2, verification_uri = ?3, expires = ?4
             WHERE id = ?5 AND status = 'pending'",
            params![device_code, user_code, verification_uri, fmt_dt(expires), id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("pending code {id}")));
        }
        self.get_code(id)
    }

    fn finish_code(&self, id: &str, status: CodeStatus, token_id: Option<&str>) -> Result<()> {
        if !status.is_terminal() {
            return Err(StoreError::Invalid(format!(
                "code {id} cannot finish as {status}"
            )));
        }
        let updated = self.conn().execute(
            "UPDATE codes SET status = ?1, token_id = ?2 WHERE id = ?3 AND status = 'pending'",
            params![status.as_str(), token_id, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("pending code {id}")));
        }
        Ok(())
    }

    fn purge_unauthorized_codes(&self) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM codes WHERE status != 'authorized'", [])?;
        tx.commit()?;
        Ok(deleted)
    }

    // ── Request logs ────────────────────────────────────────────────

    fn log_request(&self, entry: &NewRequestLog) -> Result<RequestLog> {
        let log = RequestLog {
            id: Uuid::new_v4().to_string(),
            token: entry.token.clone(),
            method: entry.method.clone(),
            url: entry.url.clone(),
            status: entry.status,
            created: Utc::now(),
        };
        self.conn()
            .execute(
                "INSERT INTO requests (id, token_id, method, url, status, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.id,
                    log.token,
                    log.method,
                    log.url,
                    log.status,
                    fmt_dt(log.created)
                ],
            )
            .map_err(|e| StoreError::from_insert(e, "request log"))?;
        Ok(log)
    }

    fn count_requests(&self, token_id: &str, since: DateTime<Utc>) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT count(*) FROM requests WHERE token_id = ?1 AND created > ?2",
            params![token_id, fmt_dt(since)],
            |row| row.get(0),
        )?)
    }

    fn count_all_requests(&self, since: DateTime<Utc>) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT count(*) FROM requests WHERE created > ?1",
            params![fmt_dt(since)],
            |row| row.get(0),
        )?)
    }

    fn purge_requests_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM requests WHERE created < ?1",
            params![fmt_dt(cutoff)],
        )?;
        tx.commit()?;
        Ok(deleted)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text comparison matches time order.
fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_dt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_dt(idx, &s))
        .transpose()
}

fn dt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_dt(idx, &row.get::<_, String>(idx)?)
}

fn parsed<T: std::str::FromStr<Err = StoreError>>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    row.get::<_, String>(idx)?.parse().map_err(|e: StoreError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        client_id: row.get(2)?,
        client_type: parsed(row, 3)?,
        platform: parsed(row, 4)?,
        redirect_uri: row.get(5)?,
        scope: row.get(6)?,
        daily_limit: row.get(7)?,
        disabled: row.get(8)?,
        created_at: dt(row, 9)?,
    })
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        email: row.get(1)?,
        password: row.get(2)?,
        tado_id: row.get(3)?,
        created_at: dt(row, 4)?,
    })
}

fn row_to_home(row: &rusqlite::Row<'_>) -> rusqlite::Result<Home> {
    Ok(Home {
        id: row.get(0)?,
        tado_id: row.get(1)?,
        name: row.get(2)?,
    })
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        account: row.get(1)?,
        client: row.get(2)?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires: dt(row, 5)?,
        used: opt_dt(row, 6)?,
        status: parsed(row, 7)?,
        disabled: row.get(8)?,
        created_at: dt(row, 9)?,
    })
}

fn row_to_code(row: &rusqlite::Row<'_>) -> rusqlite::Result<Code> {
    Ok(Code {
        id: row.get(0)?,
        client: row.get(1)?,
        device_code: row.get(2)?,
        user_code: row.get(3)?,
        verification_uri: row.get(4)?,
        expires: opt_dt(row, 5)?,
        status: parsed(row, 6)?,
        token: row.get(7)?,
        created_at: dt(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::types::Platform;

    fn test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn new_client(client_id: &str, client_type: ClientType) -> NewClient {
        NewClient {
            name: format!("client {client_id}"),
            client_id: client_id.to_string(),
            client_type,
            platform: Platform::Mobile,
            redirect_uri: "tado://auth/redirect".to_string(),
            scope: "home.user offline_access".to_string(),
            daily_limit: Some(1000),
            disabled: false,
        }
    }

    fn creds(access: &str) -> TokenCredentials {
        TokenCredentials {
            access_token: access.to_string(),
            refresh_token: format!("{access}-refresh"),
            expires: Utc::now() + Duration::minutes(10),
        }
    }

    #[test]
    fn test_client_crud() {
        let store = test_store();
        let client = store
            .create_client(&new_client("c1", ClientType::PasswordGrant))
            .unwrap();
        assert_eq!(client.daily_limit, 1000);

        let duplicate = store.create_client(&new_client("c1", ClientType::PasswordGrant));
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

        store.set_client_daily_limit(&client.id, 20000).unwrap();
        assert_eq!(store.get_client(&client.id).unwrap().daily_limit, 20000);

        store
            .create_client(&new_client("c2", ClientType::DeviceCode))
            .unwrap();
        assert_eq!(store.list_clients(None).unwrap().len(), 2);
        assert_eq!(
            store
                .list_clients(Some(ClientType::DeviceCode))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_upsert_client_keeps_learned_limit() {
        let store = test_store();
        let first = store
            .upsert_client(&new_client("c1", ClientType::PasswordGrant))
            .unwrap();
        store.set_client_daily_limit(&first.id, 5000).unwrap();

        let mut seed = new_client("c1", ClientType::PasswordGrant);
        seed.daily_limit = None;
        seed.name = "renamed".to_string();
        let second = store.upsert_client(&seed).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "renamed");
        assert_eq!(second.daily_limit, 5000);
    }

    #[test]
    fn test_account_profile_and_homes() {
        let store = test_store();
        let account = store.create_account("user@example.com", "secret").unwrap();
        let home_a = store.upsert_home(1, "Flat").unwrap();
        let home_b = store.upsert_home(2, "Cabin").unwrap();

        store
            .set_account_profile(&account.id, "42", &[home_a.id.clone(), home_b.id.clone()])
            .unwrap();
        assert_eq!(
            store.get_account(&account.id).unwrap().tado_id.as_deref(),
            Some("42")
        );
        assert_eq!(store.list_account_homes(&account.id).unwrap().len(), 2);

        store
            .set_account_profile(&account.id, "42", &[home_b.id.clone()])
            .unwrap();
        let homes = store.list_account_homes(&account.id).unwrap();
        assert_eq!(homes, vec![home_b]);

        assert!(store.find_account_by_email("user@example.com").unwrap().is_some());
        let found = store.find_account_by_tado_id("42").unwrap().unwrap();
        assert_eq!(found.id, account.id);
        assert!(store.find_account_by_tado_id("7").unwrap().is_none());
    }

    #[test]
    fn test_upsert_home_renames() {
        let store = test_store();
        let first = store.upsert_home(7, "Old").unwrap();
        let second = store.upsert_home(7, "New").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "New");
    }

    #[test]
    fn test_upsert_token_revalidates() {
        let store = test_store();
        let account = store.create_account("user@example.com", "secret").unwrap();
        let client = store
            .create_client(&new_client("c1", ClientType::PasswordGrant))
            .unwrap();

        let token = store
            .upsert_token(&account.id, &client.id, &creds("a1"))
            .unwrap();
        assert_eq!(token.status, TokenStatus::Valid);

        store
            .set_token_status(&token.id, TokenStatus::Invalid, Some(Utc::now()))
            .unwrap();
        let again = store
            .upsert_token(&account.id, &client.id, &creds("a2"))
            .unwrap();
        assert_eq!(again.id, token.id);
        assert_eq!(
            store
                .find_token(&account.id, &client.id)
                .unwrap()
                .map(|t| t.id),
            Some(token.id.clone())
        );
        assert_eq!(again.status, TokenStatus::Valid);
        assert_eq!(again.access_token, "a2");
        assert!(again.used.is_some());
    }

    #[test]
    fn test_list_tokens_filters_and_order() {
        let store = test_store();
        let alice = store.create_account("alice@example.com", "pw").unwrap();
        let bob = store.create_account("bob@example.com", "pw").unwrap();
        let client = store
            .create_client(&new_client("c1", ClientType::PasswordGrant))
            .unwrap();

        let home = store.upsert_home(100, "Home").unwrap();
        store
            .set_account_profile(&alice.id, "1", &[home.id.clone()])
            .unwrap();

        let t_alice = store
            .upsert_token(&alice.id, &client.id, &creds("a"))
            .unwrap();
        let t_bob = store.upsert_token(&bob.id, &client.id, &creds("b")).unwrap();

        // Alice used recently, Bob never: Bob comes first.
        store.touch_token(&t_alice.id, Utc::now()).unwrap();
        let all = store.list_tokens(&TokenFilter::usable()).unwrap();
        let ids: Vec<_> = all.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![t_bob.id.as_str(), t_alice.id.as_str()]);

        let by_email = store
            .list_tokens(&TokenFilter::usable().with_account_email("alice@example.com"))
            .unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].id, t_alice.id);

        let by_home = store
            .list_tokens(&TokenFilter::usable().with_home(100))
            .unwrap();
        assert_eq!(by_home.len(), 1);
        assert_eq!(by_home[0].id, t_alice.id);

        store.set_token_disabled(&t_bob.id, true).unwrap();
        store
            .set_token_status(&t_alice.id, TokenStatus::Invalid, None)
            .unwrap();
        assert!(store.list_tokens(&TokenFilter::usable()).unwrap().is_empty());
        assert_eq!(store.list_tokens(&TokenFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_account_cascades() {
        let store = test_store();
        let account = store.create_account("user@example.com", "pw").unwrap();
        let client = store
            .create_client(&new_client("c1", ClientType::PasswordGrant))
            .unwrap();
        let token = store
            .upsert_token(&account.id, &client.id, &creds("a"))
            .unwrap();

        store.delete_account(&account.id).unwrap();
        assert!(matches!(
            store.get_token(&token.id),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_account(&account.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_code_lifecycle() {
        let store = test_store();
        let client = store
            .create_client(&new_client("dc", ClientType::DeviceCode))
            .unwrap();

        let code = store.create_code(&client.id).unwrap();
        assert_eq!(code.status, CodeStatus::Pending);

        let expires = Utc::now() + Duration::minutes(5);
        let started = store
            .start_code(&code.id, "dev", "USER-1", "https://login/device", expires)
            .unwrap();
        assert_eq!(started.user_code, "USER-1");
        assert_eq!(started.device_code, "dev");

        assert!(matches!(
            store.finish_code(&code.id, CodeStatus::Pending, None),
            Err(StoreError::Invalid(_))
        ));
        store
            .finish_code(&code.id, CodeStatus::Expired, None)
            .unwrap();
        assert_eq!(store.get_code(&code.id).unwrap().status, CodeStatus::Expired);

        // Terminal codes stay terminal.
        assert!(
            store
                .finish_code(&code.id, CodeStatus::Authorized, None)
                .is_err()
        );
    }

    #[test]
    fn test_purge_unauthorized_codes() {
        let store = test_store();
        let client = store
            .create_client(&new_client("dc", ClientType::DeviceCode))
            .unwrap();
        let account = store.create_account("user@example.com", "pw").unwrap();
        let token = store
            .upsert_token(&account.id, &client.id, &creds("a"))
            .unwrap();

        let pending = store.create_code(&client.id).unwrap();
        let authorized = store.create_code(&client.id).unwrap();
        store
            .finish_code(&authorized.id, CodeStatus::Authorized, Some(&token.id))
            .unwrap();

        assert_eq!(store.purge_unauthorized_codes().unwrap(), 1);
        assert!(store.get_code(&pending.id).is_err());
        assert_eq!(
            store.get_code(&authorized.id).unwrap().token.as_deref(),
            Some(token.id.as_str())
        );
    }

    #[test]
    fn test_request_counts_and_purge() {
        let store = test_store();
        let account = store.create_account("user@example.com", "pw").unwrap();
        let client = store
            .create_client(&new_client("c1", ClientType::PasswordGrant))
            .unwrap();
        let token = store
            .upsert_token(&account.id, &client.id, &creds("a"))
            .unwrap();

        let before = Utc::now() - Duration::seconds(1);
        for status in [200, 404, 500] {
            store
                .log_request(&NewRequestLog {
                    token: token.id.clone(),
                    method: "GET".to_string(),
                    url: "https://api/homes".to_string(),
                    status,
                })
                .unwrap();
        }

        assert_eq!(store.count_requests(&token.id, before).unwrap(), 3);
        assert_eq!(store.count_all_requests(before).unwrap(), 3);
        assert_eq!(
            store
                .count_requests(&token.id, Utc::now() + Duration::seconds(1))
                .unwrap(),
            0
        );

        assert_eq!(store.purge_requests_before(before).unwrap(), 0);
        assert_eq!(
            store
                .purge_requests_before(Utc::now() + Duration::seconds(1))
                .unwrap(),
            3
        );
        assert_eq!(store.count_all_requests(before).unwrap(), 0);
    }

    #[test]
    fn test_log_request_unknown_token() {
        let store = test_store();
        let result = store.log_request(&NewRequestLog {
            token: "missing".to_string(),
            method: "GET".to_string(),
            url: "u".to_string(),
            status: 200,
        });
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }
}
