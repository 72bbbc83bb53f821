use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{StorageError, TokenStore};

/// Credential file name in cache directory
pub const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
    value: String,
    saved_at: DateTime<Utc>,
}

/// Plain JSON file backend. The whole document is rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Store at `<dir>/credentials.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CREDENTIALS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let doc: BTreeMap<String, StoredValue> = read_json(&self.path)?;
        Ok(doc.get(key).map(|v| v.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut doc: BTreeMap<String, StoredValue> = read_json_for_update(&self.path)?;
        doc.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                saved_at: Utc::now(),
            },
        );
        write_json(&self.path, &doc)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut doc: BTreeMap<String, StoredValue> = read_json_for_update(&self.path)?;
        doc.remove(key);
        if doc.is_empty() {
            debug!(path = ?self.path, "Store is empty, deleting store file");
            return remove_file(&self.path);
        }
        write_json(&self.path, &doc)
    }
}

/// Read a JSON document, treating a missing file as the default value.
pub(crate) fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&contents)
        .map_err(|e| StorageError::Corrupt(format!("{}: {}", path.display(), e)))
}

/// Like `read_json`, but a document that no longer parses is logged and
/// replaced by the default so the next write can recover the file.
pub(crate) fn read_json_for_update<T: DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, StorageError> {
    match read_json(path) {
        Err(StorageError::Corrupt(reason)) => {
            warn!(%reason, "Discarding corrupt store file");
            Ok(T::default())
        }
        other => other,
    }
}

/// Write a JSON document, creating parent directories.
///
/// The document goes to a temp file in the same directory which is then
/// renamed over `path`, so readers see either the old or the new file.
/// Temp files are created owner-only (0600 on unix).
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let contents = serde_json::to_vec_pretty(value)
        .map_err(|e| StorageError::Corrupt(e.to_string()))?;
    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(&contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

pub(crate) fn remove_file(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
