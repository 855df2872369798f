//! Account provisioning: authorize against every password-grant client and
//! record the account's upstream profile.

use chrono::Utc;
use tado_proxy_store::{Account, ClientType, SharedStore};

use crate::error::{AuthError, Result};
use crate::provider::{SharedAuthProvider, SharedProfileApi};

/// Loads tokens and profile data for newly created accounts.
#[derive(Clone)]
pub struct AccountLoader {
    store: SharedStore,
    provider: SharedAuthProvider,
    profile: SharedProfileApi,
}

impl AccountLoader {
    pub fn new(store: SharedStore, provider: SharedAuthProvider, profile: SharedProfileApi) -> Self {
        Self {
            store,
            provider,
            profile,
        }
    }

    /// Create an account and load its data, removing it again on failure.
    pub async fn create_and_load(&self, email: &str, password: &str) -> Result<Account> {
        let account = self.store.create_account(email, password)?;
        self.load_account_data(&account).await?;
        Ok(self.store.get_account(&account.id)?)
    }

    /// Authorize `account` against every enabled password-grant client,
    /// store the tokens and link the account's homes.
    ///
    /// Any failure deletes the account along with whatever was stored for it.
    pub async fn load_account_data(&self, account: &Account) -> Result<()> {
        match self.try_load(account).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(account = %account.email, error = %err, "Failed to load account data");
                if let Err(e) = self.store.delete_account(&account.id) {
                    tracing::error!(account = %account.email, error = %e, "Failed to delete account");
                }
                Err(err)
            }
        }
    }

    async fn try_load(&self, account: &Account) -> Result<()> {
        let clients: Vec<_> = self
            .store
            .list_clients(Some(ClientType::PasswordGrant))?
            .into_iter()
            .filter(|c| !c.disabled)
            .collect();
        if clients.is_empty() {
            return Err(AuthError::Unsupported(
                "no enabled passwordGrant clients configured".to_string(),
            ));
        }

        let mut last = None;
        for client in clients {
            let grant = self
                .provider
                .authorize(&client, &account.email, &account.password)
                .await?;
            let token =
                self.store
                    .upsert_token(&account.id, &client.id, &grant.credentials(Utc::now()))?;
            tracing::info!(
                account = %account.email,
                client_id = %client.client_id,
                token_id = %token.id,
                "Authorized account"
            );
            last = Some((token, client.platform));
        }

        let Some((token, platform)) = last else {
            return Ok(());
        };
        let me = self.profile.get_me(&token.access_token, platform).await?;

        let mut home_ids = Vec::with_capacity(me.homes.len());
        for home in &me.homes {
            home_ids.push(self.store.upsert_home(home.id, &home.name)?.id);
        }
        self.store.set_account_profile(&account.id, &me.id, &home_ids)?;
        tracing::info!(
            account = %account.email,
            tado_id = %me.id,
            homes = home_ids.len(),
            "Loaded account profile"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tado_proxy_store::{Client, NewClient, Platform, RecordStore, SqliteStore, TokenFilter};

    use super::*;
    use crate::oauth::{Me, MeHome, TokenGrant};
    use crate::provider::{AuthProvider, ProfileApi};

    #[derive(Default)]
    struct MockUpstream {
        authorize_calls: AtomicU32,
        reject_password: bool,
    }

    #[async_trait]
    impl AuthProvider for MockUpstream {
        async fn refresh(&self, _client: &Client, _refresh_token: &str) -> Result<TokenGrant> {
            unreachable!("refresh is not used while loading accounts")
        }

        async fn authorize(&self, client: &Client, _email: &str, password: &str) -> Result<TokenGrant> {
            self.authorize_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_password || password != "secret" {
                return Err(AuthError::Upstream {
                    status: 400,
                    body: "invalid credentials".to_string(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("access-{}", client.client_id),
                refresh_token: "refresh".to_string(),
                expires_in: 600,
                user_id: Some("4242".to_string()),
            })
        }
    }

    #[async_trait]
    impl ProfileApi for MockUpstream {
        async fn get_me(&self, _access_token: &str, _platform: Platform) -> Result<Me> {
            Ok(Me {
                id: "4242".to_string(),
                homes: vec![
                    MeHome {
                        id: 100,
                        name: "Flat".to_string(),
                    },
                    MeHome {
                        id: 200,
                        name: "Cabin".to_string(),
                    },
                ],
            })
        }
    }

    fn new_client(client_id: &str, client_type: ClientType, disabled: bool) -> NewClient {
        NewClient {
            name: client_id.to_string(),
            client_id: client_id.to_string(),
            client_type,
            platform: Platform::Web,
            redirect_uri: "https://app.example/redirect".to_string(),
            scope: "home.user offline_access".to_string(),
            daily_limit: None,
            disabled,
        }
    }

    fn loader(upstream: MockUpstream) -> (SharedStore, Arc<MockUpstream>, AccountLoader) {
        let store: SharedStore = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .create_client(&new_client("web", ClientType::PasswordGrant, false))
            .unwrap();
        store
            .create_client(&new_client("mobile", ClientType::PasswordGrant, false))
            .unwrap();
        store
            .create_client(&new_client("old", ClientType::PasswordGrant, true))
            .unwrap();
        store
            .create_client(&new_client("device", ClientType::DeviceCode, false))
            .unwrap();

        let upstream = Arc::new(upstream);
        let loader = AccountLoader::new(store.clone(), upstream.clone(), upstream.clone());
        (store, upstream, loader)
    }

    #[tokio::test]
    async fn test_load_account_data() {
        let (store, upstream, loader) = loader(MockUpstream::default());

        let account = loader.create_and_load("user@example.com", "secret").await.unwrap();
        assert_eq!(account.tado_id.as_deref(), Some("4242"));
        assert_eq!(upstream.authorize_calls.load(Ordering::SeqCst), 2);

        let tokens = store.list_tokens(&TokenFilter::usable()).unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.account == account.id));

        let mut homes: Vec<_> = store
            .list_account_homes(&account.id)
            .unwrap()
            .into_iter()
            .map(|h| h.tado_id)
            .collect();
        homes.sort();
        assert_eq!(homes, vec![100, 200]);
    }

    #[tokio::test]
    async fn test_failed_load_deletes_account() {
        let (store, _, loader) = loader(MockUpstream {
            reject_password: true,
            ..Default::default()
        });

        let err = loader
            .create_and_load("user@example.com", "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Upstream { status: 400, .. }));
        assert!(store.find_account_by_email("user@example.com").unwrap().is_none());
        assert!(store.list_tokens(&TokenFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_password_grant_clients() {
        let store: SharedStore = Arc::new(SqliteStore::open_in_memory().unwrap());
        let upstream = Arc::new(MockUpstream::default());
        let loader = AccountLoader::new(store.clone(), upstream.clone(), upstream);

        let err = loader.create_and_load("user@example.com", "secret").await.unwrap_err();
        assert!(matches!(err, AuthError::Unsupported(_)));
        assert!(store.list_accounts().unwrap().is_empty());
    }
}
