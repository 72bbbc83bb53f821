//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the backend URL, request timeout, credential storage
//! backend, and last used email.
//!
//! Configuration is stored at `~/.config/tixchain/config.json`. The
//! `TIXCHAIN_API_URL` and `TIXCHAIN_STORAGE` environment variables take
//! precedence over the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::{ApiClient, DEFAULT_TIMEOUT_SECS};
use crate::storage::{EncryptedFileStore, FileStore, KeyringStore, MemoryStore, TokenStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tixchain";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";

pub const ENV_API_URL: &str = "TIXCHAIN_API_URL";
pub const ENV_STORAGE: &str = "TIXCHAIN_STORAGE";
pub const ENV_STORE_PASSPHRASE: &str = "TIXCHAIN_STORE_PASSPHRASE";

/// Where the session credential is kept between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    Keyring,
    #[default]
    File,
    EncryptedFile,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" | "keychain" => Ok(StorageBackend::Keyring),
            "file" => Ok(StorageBackend::File),
            "encrypted-file" | "encrypted" => Ok(StorageBackend::EncryptedFile),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub storage: StorageBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            storage: StorageBackend::default(),
            last_email: None,
        }
    }
}

impl Config {
    /// Load from the standard location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Environment values win over the file. An override that does not
    /// parse is skipped with a warning and the file's value stays.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(storage) = lookup(ENV_STORAGE).filter(|v| !v.trim().is_empty()) {
            match storage.parse::<StorageBackend>() {
                Ok(backend) => self.storage = backend,
                Err(e) => warn!(
                    error = %e,
                    keeping = ?self.storage,
                    "Ignoring invalid {}",
                    ENV_STORAGE
                ),
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn api_client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.api_base_url, self.request_timeout())
            .context("Failed to build HTTP client")
    }

    /// Build the configured credential store.
    pub fn open_token_store(&self) -> Result<Arc<dyn TokenStore>> {
        self.open_token_store_in(&self.cache_dir()?, |name| std::env::var(name).ok())
    }

    fn open_token_store_in(
        &self,
        dir: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Arc<dyn TokenStore>> {
        let store: Arc<dyn TokenStore> = match self.storage {
            StorageBackend::Keyring => Arc::new(KeyringStore::new()),
            StorageBackend::File => Arc::new(FileStore::in_dir(dir)),
            StorageBackend::EncryptedFile => {
                let passphrase = lookup(ENV_STORE_PASSPHRASE).ok_or_else(|| {
                    anyhow::anyhow!(
                        "{} must be set to use the encrypted-file storage backend",
                        ENV_STORE_PASSPHRASE
                    )
                })?;
                Arc::new(
                    EncryptedFileStore::open_in_dir(dir, &passphrase)
                        .context("Failed to open encrypted credential store")?,
                )
            }
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}
