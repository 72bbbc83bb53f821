//! REST API client module for the tixchain backend.
//!
//! `AuthApi` is the seam the session store talks through; `ApiClient`
//! is its HTTP implementation. The backend issues an opaque bearer
//! token on login/register which is passed back on profile requests.

pub mod client;
pub mod error;

use async_trait::async_trait;

use crate::models::{AuthResponse, ProfileUpdate, User};

pub use client::{ApiClient, DEFAULT_TIMEOUT_SECS};
pub use error::ApiError;

/// Account operations of the backend auth API.
///
/// Implementations may talk to the real REST API or be a test double.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange email and password for a token (POST /auth/login).
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError>;

    /// Create an account and sign in (POST /auth/register).
    async fn register(&self, name: &str, email: &str, password: &str)
        -> Result<AuthResponse, ApiError>;

    /// Fetch the profile the token belongs to (GET /auth/profile).
    async fn get_profile(&self, token: &str) -> Result<User, ApiError>;

    /// Apply a partial profile change (PUT /auth/profile).
    async fn update_profile(&self, token: &str, update: &ProfileUpdate) -> Result<User, ApiError>;
}
