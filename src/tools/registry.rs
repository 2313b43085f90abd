//! Tool registration records and the pluggable `Store` contract (spec.md
//! §3 "Tool registration", §4.9 persistence Non-goal, SPEC_FULL.md §A.5).
//!
//! Grounded on the teacher's channel/state CRUD shape for the trait split
//! (a narrow async contract plus an in-memory reference implementation
//! guarded by `parking_lot::RwLock`); the JSON file store is this crate's
//! own minimal stand-in for "a SQLite/file store appears only as the
//! `Store` contract".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::secret::{self, SecretKey};
use crate::tools::manifest::Manifest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ready,
    Unhealthy,
    Disabled,
    Unverified,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayRef {
    pub path: String,
}

/// A named tool registration: the unit of CRUD for the tool service
/// (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolRegistration {
    pub name: String,
    pub origin: String,
    pub manifest: Manifest,
    pub config: FxHashMap<String, String>,
    pub status: ToolStatus,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_failures: u32,
    pub overlay: Option<OverlayRef>,
}

impl ToolRegistration {
    pub fn new(name: impl Into<String>, origin: impl Into<String>, manifest: Manifest) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            manifest,
            config: FxHashMap::default(),
            status: ToolStatus::Unverified,
            enabled: true,
            registered_at: Utc::now(),
            last_health_check: None,
            health_failures: 0,
            overlay: None,
        }
    }

    /// Replaces every sensitive field's value with its encrypted form
    /// (spec.md §6 "Config... sensitive values encrypted with prefix
    /// `enc:v1:<base64>`"). Idempotent: already-encrypted values pass
    /// through [`secret::encrypt`] unchanged detection via `is_encrypted`.
    pub fn encrypt_sensitive(&mut self, key: &SecretKey) -> Result<(), secret::SecretError> {
        for (field_name, value) in self.config.iter_mut() {
            let is_sensitive = self.manifest.config.get(field_name).map(|f| f.sensitive).unwrap_or(false);
            if is_sensitive && !secret::is_encrypted(value) {
                *value = secret::encrypt(key, value)?;
            }
        }
        Ok(())
    }

    /// Returns a copy with every sensitive field decrypted, for in-memory
    /// use (spec.md §3 "plaintext only appears in in-memory objects after
    /// decoding").
    pub fn decrypted(&self, key: &SecretKey) -> Result<Self, secret::SecretError> {
        let mut copy = self.clone();
        for (field_name, value) in copy.config.iter_mut() {
            let is_sensitive = copy.manifest.config.get(field_name).map(|f| f.sensitive).unwrap_or(false);
            if is_sensitive {
                *value = secret::decrypt(key, value)?;
            }
        }
        Ok(copy)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("tool '{0}' already exists")]
    AlreadyExists(String),
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("secret codec error: {0}")]
    Secret(#[from] secret::SecretError),
}

/// CRUD contract over [`ToolRegistration`]s (SPEC_FULL.md §A.5). The two
/// implementations in this module are reference adapters; concrete storage
/// driver selection (SQL, etc.) is out of scope (spec.md §1).
#[async_trait]
pub trait Store: Send + Sync {
    async fn list(&self) -> Result<Vec<ToolRegistration>, StoreError>;
    async fn get(&self, name: &str) -> Result<Option<ToolRegistration>, StoreError>;
    async fn put(&self, registration: ToolRegistration) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// In-memory reference store, used by default and in tests.
#[derive(Default)]
pub struct InMemoryToolStore {
    entries: RwLock<FxHashMap<String, ToolRegistration>>,
}

impl InMemoryToolStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for InMemoryToolStore {
    async fn list(&self) -> Result<Vec<ToolRegistration>, StoreError> {
        let mut out: Vec<_> = self.entries.read().values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get(&self, name: &str) -> Result<Option<ToolRegistration>, StoreError> {
        Ok(self.entries.read().get(name).cloned())
    }

    async fn put(&self, registration: ToolRegistration) -> Result<(), StoreError> {
        self.entries.write().insert(registration.name.clone(), registration);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.entries.write().remove(name).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct FileDocument {
    version: String,
    tools: Vec<ToolRegistration>,
}

/// JSON-file-backed store persisting the `{version: "1", tools: [...]}`
/// document (spec.md §6), sorted by name on every write. Sensitive config
/// values are expected to already be encrypted by the caller
/// ([`ToolRegistration::encrypt_sensitive`]) before `put` — this store
/// never sees plaintext.
pub struct FileToolStore {
    path: PathBuf,
    write_lock: AsyncMutex<()>,
}

impl FileToolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: AsyncMutex::new(()),
        }
    }

    fn read_document(&self) -> Result<FileDocument, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| StoreError::Io(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileDocument {
                version: "1".to_string(),
                tools: Vec::new(),
            }),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn write_document(&self, mut document: FileDocument) -> Result<(), StoreError> {
        document.tools.sort_by(|a, b| a.name.cmp(&b.name));
        let text = serde_json::to_string_pretty(&document).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl Store for FileToolStore {
    async fn list(&self) -> Result<Vec<ToolRegistration>, StoreError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.read_document()?.tools)
    }

    async fn get(&self, name: &str) -> Result<Option<ToolRegistration>, StoreError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.read_document()?.tools.into_iter().find(|t| t.name == name))
    }

    async fn put(&self, registration: ToolRegistration) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document()?;
        document.tools.retain(|t| t.name != registration.name);
        document.tools.push(registration);
        self.write_document(document)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document()?;
        let before = document.tools.len();
        document.tools.retain(|t| t.name != name);
        if document.tools.len() == before {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.write_document(document)
    }
}
