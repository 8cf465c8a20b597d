//! Document storage
//!
//! Named opaque documents (the wallet tree, the credential record). The
//! storage layer never interprets them; the wallet serializes to JSON.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::StorageError;

/// Key-value store of named documents.
pub trait Storage: Send + Sync {
    /// Read a document. `None` if it was never saved.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace a document.
    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Load and deserialize a JSON document.
pub fn load_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    name: &str,
) -> Result<Option<T>, StorageError> {
    match storage.load(name)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and save a JSON document.
pub fn save_json<T: Serialize>(storage: &dyn Storage, name: &str, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    storage.save(name, &bytes)
}

/// One `<name>.json` file per document under a data directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl Storage for FileStorage {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(name);
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("Loaded {} from {}", name, path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(name);
        let tmp = self.dir.join(format!("{}.json.tmp", name));

        // Owner-only: documents carry encrypted key material
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&tmp, bytes)?;
        }

        fs::rename(&tmp, &path)?;
        debug!("Saved {} to {}", name, path.display());
        Ok(())
    }
}

/// In-memory storage. Clones share the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    documents: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let documents = self
            .documents
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "storage lock poisoned"))?;
        Ok(documents.get(name).cloned())
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "storage lock poisoned"))?;
        documents.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}
