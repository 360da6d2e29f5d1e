//! Object storage abstraction.
//!
//! Every persisted artifact (model outputs, blind assignments, the score
//! ledger, rendered videos) is a named object in an [`ObjectStore`]. Reads
//! return an [`ObjectVersion`] token and writes can be made conditional on
//! it, which is how the score ledger detects concurrent writers.
//!
//! Two backends live here: [`MemoryStore`] (tests, dry runs) and
//! [`LocalStore`] (a directory tree). The S3 backend is in
//! `blindeval-cloud`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::hashing::sha256_hex;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Opaque version token of a stored object (ETag, content hash, counter).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectVersion(pub String);

/// An object body together with the version it was read at.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub version: ObjectVersion,
}

/// Write precondition for [`ObjectStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutMode {
    /// Unconditional write (last writer wins).
    Overwrite,
    /// Write only if no object exists under the key.
    Create,
    /// Write only if the current object still has this version.
    IfMatch(ObjectVersion),
}

/// Errors from object store backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("write precondition failed for '{key}'")]
    PreconditionFailed { key: String },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A flat keyed blob store with optimistic-concurrency writes.
///
/// Keys use `/` as separator and never start with `/`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object. Returns `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError>;

    /// Write an object, honouring the given precondition.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        mode: PutMode,
    ) -> Result<ObjectVersion, StorageError>;

    /// List all keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Human-readable location, used in log lines.
    fn describe(&self) -> String;

    /// Location of one object as a URI (`s3://bucket/key`,
    /// `file:///root/key`), handed to model services that fetch inputs
    /// themselves.
    fn object_uri(&self, key: &str) -> String {
        let base = self.describe();
        if base.ends_with('/') {
            format!("{base}{key}")
        } else {
            format!("{base}/{key}")
        }
    }

    /// Copy an object to a local file.
    async fn download_to(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let object = self.get(key).await?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(key, source))?;
        }
        tokio::fs::write(path, &object.body)
            .await
            .map_err(|source| io_error(key, source))
    }

    /// Upload a local file as an object.
    async fn upload_from(
        &self,
        key: &str,
        path: &Path,
        mode: PutMode,
    ) -> Result<ObjectVersion, StorageError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|source| io_error(key, source))?;
        self.put(key, body, mode).await
    }
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}

/// Reject keys that are empty, absolute, or escape their prefix.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Join key segments with `/`, skipping empty segments and trimming
/// stray separators.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local store backed by a `BTreeMap`. Versions are a counter.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: BTreeMap<String, (Vec<u8>, u64)>,
    next_version: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        validate_key(key)?;
        let inner = self.lock()?;
        Ok(inner.objects.get(key).map(|(body, v)| StoredObject {
            body: body.clone(),
            version: ObjectVersion(format!("v{v}")),
        }))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        mode: PutMode,
    ) -> Result<ObjectVersion, StorageError> {
        validate_key(key)?;
        let mut inner = self.lock()?;
        let current = inner
            .objects
            .get(key)
            .map(|(_, v)| ObjectVersion(format!("v{v}")));

        let allowed = match (&mode, &current) {
            (PutMode::Overwrite, _) => true,
            (PutMode::Create, existing) => existing.is_none(),
            (PutMode::IfMatch(expected), Some(actual)) => expected == actual,
            (PutMode::IfMatch(_), None) => false,
        };
        if !allowed {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
            });
        }

        inner.next_version += 1;
        let version = inner.next_version;
        inner.objects.insert(key.to_string(), (body, version));
        Ok(ObjectVersion(format!("v{version}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

// ---------------------------------------------------------------------------
// Local filesystem backend
// ---------------------------------------------------------------------------

/// Store rooted at a local directory. Object versions are the SHA-256 of
/// the content.
///
/// `IfMatch` is checked with a read-compare-rename sequence, which is
/// atomic per process but not across processes sharing the directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    async fn write_replace(&self, key: &str, path: &Path, body: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("obj")
        ));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|source| io_error(key, source))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|source| io_error(key, source))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => {
                let version = ObjectVersion(sha256_hex(&body));
                Ok(Some(StoredObject { body, version }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_error(key, source)),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        mode: PutMode,
    ) -> Result<ObjectVersion, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(key, source))?;
        }
        let version = ObjectVersion(sha256_hex(&body));

        match mode {
            PutMode::Overwrite => self.write_replace(key, &path, &body).await?,
            PutMode::Create => {
                let file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .await;
                let mut file = match file {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(StorageError::PreconditionFailed {
                            key: key.to_string(),
                        });
                    }
                    Err(source) => return Err(io_error(key, source)),
                };
                file.write_all(&body)
                    .await
                    .map_err(|source| io_error(key, source))?;
                file.flush().await.map_err(|source| io_error(key, source))?;
            }
            PutMode::IfMatch(expected) => {
                let current = self.get(key).await?;
                match current {
                    Some(obj) if obj.version == expected => {
                        self.write_replace(key, &path, &body).await?
                    }
                    _ => {
                        return Err(StorageError::PreconditionFailed {
                            key: key.to_string(),
                        })
                    }
                }
            }
        }

        Ok(version)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut stack = vec![(self.root.clone(), String::new())];

        while let Some((dir, key_prefix)) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(io_error(&key_prefix, source)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| io_error(&key_prefix, source))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let key = if key_prefix.is_empty() {
                    name
                } else {
                    format!("{key_prefix}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|source| io_error(&key, source))?;
                if file_type.is_dir() {
                    // Only descend where the prefix can still match.
                    if key.starts_with(prefix) || prefix.starts_with(&format!("{key}/")) {
                        stack.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) && !key.ends_with(".tmp") {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
