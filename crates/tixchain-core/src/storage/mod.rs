//! Durable key-value storage for the session credential.
//!
//! The session store only ever touches storage through [`TokenStore`],
//! which is constructed once and injected. Backends:
//! - `MemoryStore`: process-local, used by tests and throwaway sessions
//! - `FileStore`: JSON document in the cache directory
//! - `EncryptedFileStore`: same layout, values sealed with XChaCha20-Poly1305
//! - `KeyringStore`: OS keychain via `keyring`

pub mod encrypted;
pub mod file;
pub mod keychain;

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

pub use self::encrypted::EncryptedFileStore;
pub use self::file::FileStore;
pub use self::keychain::KeyringStore;

/// Key under which the session credential is stored.
pub const CREDENTIAL_KEY: &str = "token";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store file: {0}")]
    Corrupt(String),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Whole-value string storage. Removing a missing key is not an error.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a credential, as if a previous run had logged in.
    pub fn with_credential(token: &str) -> Self {
        let store = Self::default();
        if let Ok(mut entries) = store.entries.lock() {
            entries.insert(CREDENTIAL_KEY.to_string(), token.to_string());
        }
        store
    }
}

impl TokenStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}
