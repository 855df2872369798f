//! Admin API: provisioning of accounts, device codes and token switches.
//!
//! Responses never carry passwords or token material; the record types skip
//! those fields when serialized.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use tado_proxy_store::{Account, Client, Code, Token, TokenFilter};

use crate::error::{Result, ServerError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTokenRequest {
    pub disabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateCodeRequest {
    /// Store id of a deviceCode client.
    pub client: String,
}

/// `GET /admin/clients`
pub async fn list_clients_handler(State(state): State<AppState>) -> Result<Json<Vec<Client>>> {
    Ok(Json(state.store.list_clients(None)?))
}

/// `GET /admin/accounts`
pub async fn list_accounts_handler(State(state): State<AppState>) -> Result<Json<Vec<Account>>> {
    Ok(Json(state.store.list_accounts()?))
}

/// `POST /admin/accounts`
///
/// Creates the account and authorizes it against every password-grant
/// client. The account is removed again when any step fails.
pub async fn create_account_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>)> {
    let email = request.email.trim();
    if email.is_empty() || request.password.is_empty() {
        return Err(ServerError::BadRequest(
            "email and password are required".to_string(),
        ));
    }

    let account = state.accounts.create_and_load(email, &request.password).await?;
    tracing::info!(account = %account.email, "Account created");
    Ok((StatusCode::CREATED, Json(account)))
}

/// `DELETE /admin/accounts/{id}`
pub async fn delete_account_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.store.delete_account(&id)?;
    tracing::info!(account_id = %id, "Account deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /admin/tokens`
pub async fn list_tokens_handler(State(state): State<AppState>) -> Result<Json<Vec<Token>>> {
    Ok(Json(state.store.list_tokens(&TokenFilter::default())?))
}

/// `PATCH /admin/tokens/{id}`
pub async fn update_token_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateTokenRequest>,
) -> Result<Json<Token>> {
    state.store.set_token_disabled(&id, request.disabled)?;
    Ok(Json(state.store.get_token(&id)?))
}

/// `POST /admin/codes`
pub async fn create_code_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateCodeRequest>,
) -> Result<(StatusCode, Json<Code>)> {
    let code = state
        .codes
        .create_code(&request.client, state.shutdown.child_token())
        .await?;
    Ok((StatusCode::CREATED, Json(code)))
}

/// `GET /admin/codes/{id}`
pub async fn get_code_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Code>> {
    Ok(Json(state.store.get_code(&id)?))
}
