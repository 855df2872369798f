//! Persistent records for tado-proxy.
//!
//! Clients, accounts, homes, tokens, device codes and request logs live in a
//! single SQLite database behind the [`RecordStore`] trait. Schema changes are
//! applied with embedded refinery migrations when a store is opened.

mod error;
mod sqlite;
mod storage;
pub mod types;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use storage::{RecordStore, SharedStore};
pub use types::{
    Account, Client, ClientType, Code, CodeStatus, Home, NewClient, NewRequestLog, Platform,
    RequestLog, Token, TokenCredentials, TokenFilter, TokenStatus,
};
