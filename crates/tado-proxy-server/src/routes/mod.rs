//! HTTP routes.

pub mod admin;
pub mod health;
pub mod proxy;
pub mod ratelimits;

pub use admin::{
    CreateAccountRequest, CreateCodeRequest, UpdateTokenRequest, create_account_handler,
    create_code_handler, delete_account_handler, get_code_handler, list_accounts_handler,
    list_clients_handler, list_tokens_handler, update_token_handler,
};
pub use health::health_routes;
pub use proxy::proxy_handler;
pub use ratelimits::{StatsResponse, TokenUsage, ratelimits_handler, stats_handler};
