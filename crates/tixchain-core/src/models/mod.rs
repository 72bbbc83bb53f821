//! Data models for tixchain accounts.
//!
//! - `User`: the identity record the backend returns for an account
//! - `ProfileUpdate`: partial set of profile fields to change
//! - `AuthResponse`, `ProfileResponse`: wire envelopes of the auth endpoints

pub mod user;

pub use user::{AuthResponse, ProfileResponse, ProfileUpdate, User};
