//! Core library for tixchain accounts.
//!
//! - `api`: HTTP client for the backend auth endpoints
//! - `auth`: the session store and its state types
//! - `storage`: durable credential storage backends
//! - `models`: user and profile records
//! - `config`: on-disk configuration with environment overrides

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;

pub use api::{ApiClient, ApiError, AuthApi};
pub use auth::{
    RestoreFailure, RestoreOutcome, SessionError, SessionSnapshot, SessionStatus, SessionStore,
};
pub use config::{Config, StorageBackend};
pub use models::{ProfileUpdate, User};
pub use storage::{StorageError, TokenStore};
