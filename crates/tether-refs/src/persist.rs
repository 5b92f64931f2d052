//! # Reference Persistence
//!
//! Storage for references that outlive the host process. A persisted
//! reference is rehydrated from its backend when declared and saved after
//! every applied change.
//!
//! [`JsonFileStore`] keeps every persisted reference in one JSON object on
//! disk, rewritten atomically (temp file, sync, rename) on each save.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} does not hold a JSON object")]
    NotAnObject { path: PathBuf },
}

/// Where persisted reference values live.
pub trait RefPersistence: Send + Sync {
    /// Stored value under `storage_key`, if any.
    fn load(&self, storage_key: &str) -> Result<Option<Value>, PersistError>;

    fn save(&self, storage_key: &str, value: &Value) -> Result<(), PersistError>;
}

/// How a reference is persisted.
#[derive(Clone)]
pub struct PersistOptions {
    pub backend: Arc<dyn RefPersistence>,
    /// Key in the backend; `ref-<key>` when unset
    pub storage_key: Option<String>,
}

impl PersistOptions {
    pub fn new(backend: Arc<dyn RefPersistence>) -> Self {
        Self {
            backend,
            storage_key: None,
        }
    }

    pub fn with_storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = Some(storage_key.into());
        self
    }

    pub(crate) fn resolve_key(&self, ref_key: &str) -> String {
        self.storage_key
            .clone()
            .unwrap_or_else(|| format!("ref-{ref_key}"))
    }
}

/// All persisted references in a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>, PersistError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(PersistError::Io {
                    action: "read",
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_str(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(PersistError::NotAnObject {
                path: self.path.clone(),
            }),
            Err(source) => Err(PersistError::Json {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_all(&self, map: &Map<String, Value>) -> Result<(), PersistError> {
        let io = |action: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistError::Io {
                action,
                path,
                source,
            }
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io("create directory", parent))?;
            }
        }

        let serialized = serde_json::to_string_pretty(map).map_err(|source| PersistError::Json {
            path: self.path.clone(),
            source,
        })?;

        let temp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)
                .map_err(io("create", &temp))?;
            file.write_all(serialized.as_bytes())
                .map_err(io("write", &temp))?;
            file.sync_all().map_err(io("sync", &temp))?;
        }
        fs::rename(&temp, &self.path).map_err(io("replace", &self.path))?;
        Ok(())
    }
}

impl RefPersistence for JsonFileStore {
    fn load(&self, storage_key: &str) -> Result<Option<Value>, PersistError> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(storage_key))
    }

    fn save(&self, storage_key: &str, value: &Value) -> Result<(), PersistError> {
        let _guard = self.lock.lock();
        let mut map = self.read_all()?;
        map.insert(storage_key.to_string(), value.clone());
        self.write_all(&map)?;
        debug!(storage_key, path = %self.path.display(), "Persisted reference");
        Ok(())
    }
}
