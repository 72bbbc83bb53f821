//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionStore`: the single owner of who is signed in, with login,
//!   register, logout, profile update and startup restore
//! - `SessionSnapshot`: the status/identity pair observers receive
//!
//! The bearer token is persisted through an injected `TokenStore` so a
//! later process can restore the session without asking for a password.

pub mod session;

pub use session::{
    RestoreFailure, RestoreOutcome, SessionError, SessionSnapshot, SessionStatus, SessionStore,
};
