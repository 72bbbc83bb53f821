//! Passphrase-protected variant of the file backend.
//!
//! The 32-byte key is derived with Argon2id from the passphrase and a
//! random salt kept in the file. Every value is sealed with
//! XChaCha20-Poly1305 under a fresh 24-byte nonce, with the entry key as
//! associated data so ciphertexts cannot be swapped between keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::file::{read_json, read_json_for_update, remove_file, write_json};
use super::{StorageError, TokenStore};

/// Encrypted credential file name in cache directory
pub const VAULT_FILE: &str = "credentials.vault.json";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Vault {
    #[serde(default)]
    salt: String,
    #[serde(default)]
    entries: BTreeMap<String, SealedValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedValue {
    nonce: String,
    ciphertext: String,
    saved_at: DateTime<Utc>,
}

pub struct EncryptedFileStore {
    path: PathBuf,
    salt: [u8; SALT_LEN],
    cipher: XChaCha20Poly1305,
    lock: Mutex<()>,
}

impl EncryptedFileStore {
    /// Open (or prepare to create) the vault at `path`.
    ///
    /// A wrong passphrase is not detected here; it surfaces as
    /// `StorageError::Crypto` on the first `get` of an existing value.
    /// A vault file that no longer parses is discarded with a warning.
    pub fn open(path: PathBuf, passphrase: &str) -> Result<Self, StorageError> {
        let salt = match stored_salt(&path) {
            Ok(Some(salt)) => salt,
            Ok(None) => new_salt(),
            Err(StorageError::Corrupt(reason)) => {
                warn!(%reason, "Discarding corrupt vault file");
                remove_file(&path)?;
                new_salt()
            }
            Err(e) => return Err(e),
        };

        let key = derive_key(passphrase, &salt)?;
        Ok(Self {
            path,
            salt,
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
            lock: Mutex::new(()),
        })
    }

    /// Vault at `<dir>/credentials.vault.json`.
    pub fn open_in_dir(dir: &Path, passphrase: &str) -> Result<Self, StorageError> {
        Self::open(dir.join(VAULT_FILE), passphrase)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seal(&self, key: &str, value: &str) -> Result<SealedValue, StorageError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: value.as_bytes(),
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::Crypto("encryption failed".to_string()))?;

        Ok(SealedValue {
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
            saved_at: Utc::now(),
        })
    }

    fn open_sealed(&self, key: &str, sealed: &SealedValue) -> Result<String, StorageError> {
        let nonce = hex::decode(&sealed.nonce)
            .map_err(|e| StorageError::Corrupt(format!("nonce for {}: {}", key, e)))?;
        if nonce.len() != NONCE_LEN {
            return Err(StorageError::Corrupt(format!("nonce for {} has wrong length", key)));
        }
        let ciphertext = hex::decode(&sealed.ciphertext)
            .map_err(|e| StorageError::Corrupt(format!("ciphertext for {}: {}", key, e)))?;

        let plaintext = self
            .cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| {
                StorageError::Crypto("wrong passphrase or tampered value".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| StorageError::Corrupt(format!("value for {} is not UTF-8", key)))
    }

    fn write(&self, mut vault: Vault) -> Result<(), StorageError> {
        vault.salt = hex::encode(self.salt);
        write_json(&self.path, &vault)
    }
}

impl TokenStore for EncryptedFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let vault: Vault = read_json(&self.path)?;
        vault
            .entries
            .get(key)
            .map(|sealed| self.open_sealed(key, sealed))
            .transpose()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut vault: Vault = read_json_for_update(&self.path)?;
        vault.entries.insert(key.to_string(), self.seal(key, value)?);
        self.write(vault)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut vault: Vault = read_json_for_update(&self.path)?;
        vault.entries.remove(key);
        self.write(vault)
    }
}

/// Salt recorded in an existing vault, or None when there is no vault yet.
fn stored_salt(path: &Path) -> Result<Option<[u8; SALT_LEN]>, StorageError> {
    let vault: Vault = read_json(path)?;
    if vault.salt.is_empty() {
        return Ok(None);
    }
    let decoded = hex::decode(&vault.salt)
        .map_err(|e| StorageError::Corrupt(format!("vault salt: {}", e)))?;
    let salt: [u8; SALT_LEN] = decoded.as_slice().try_into().map_err(|_| {
        StorageError::Corrupt(format!(
            "vault salt has {} bytes, expected {}",
            decoded.len(),
            SALT_LEN
        ))
    })?;
    Ok(Some(salt))
}

fn new_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], StorageError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| StorageError::Crypto(format!("key derivation failed: {}", e)))?;
    Ok(key)
}
