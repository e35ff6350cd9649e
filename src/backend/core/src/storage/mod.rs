//! Artifact storage backends.
//!
//! Exports and contractor documents live outside the database. Every backend
//! keys objects as `<tenant>/<filename>` and hands that key back as the
//! object's `path`, so a row written through one backend can be deleted
//! through another configured against the same bucket or root.
//!
//! - **LocalStorage**: files under a root directory
//! - **HttpObjectStorage**: bucket-style object store over HTTP
//! - **MemoryStorage**: in-process map, used by tests

mod http;
mod local;

pub use http::HttpObjectStorage;
pub use local::LocalStorage;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::{ErrorCode, Result, SitegateError};
use crate::jobs::TenantId;

/// Location and size of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
    pub size: u64,
}

/// Contract every storage backend satisfies identically.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `content` for a tenant under `filename`.
    async fn write(&self, tenant_id: TenantId, filename: &str, content: &[u8]) -> Result<StoredObject>;

    /// Remove an object. Removing an object that is already gone succeeds.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Build the backend selected in configuration.
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        StorageBackendKind::Local => Ok(Arc::new(LocalStorage::new(&config.local_root))),
        StorageBackendKind::Object => {
            let endpoint = config.object_endpoint.as_deref().ok_or_else(|| {
                SitegateError::configuration("storage.object_endpoint is required for object storage")
            })?;
            let bucket = config.object_bucket.as_deref().ok_or_else(|| {
                SitegateError::configuration("storage.object_bucket is required for object storage")
            })?;
            let mut storage = HttpObjectStorage::new(endpoint, bucket)?;
            if let Some(token) = &config.object_token {
                storage = storage.with_token(token.clone());
            }
            Ok(Arc::new(storage))
        }
    }
}

/// Object key of a tenant file.
pub fn object_key(tenant_id: TenantId, filename: &str) -> Result<String> {
    validate_filename(filename)?;
    Ok(format!("{}/{}", tenant_id, filename))
}

fn validate_filename(filename: &str) -> Result<()> {
    let invalid = filename.is_empty()
        || filename.starts_with('.')
        || filename.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SitegateError::new(
            ErrorCode::InvalidStoragePath,
            format!("invalid storage filename: {:?}", filename),
        ));
    }
    Ok(())
}

/// Check a stored key for traversal before touching the backend.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains(['\\', '\0'])
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(SitegateError::new(
            ErrorCode::InvalidStoragePath,
            format!("invalid storage key: {:?}", key),
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage kept in a map. Writes and deletes can be switched to fail.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an object directly, bypassing `write`.
    pub fn insert(&self, path: impl Into<String>, content: Vec<u8>) {
        self.objects.lock().insert(path.into(), content);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn write(&self, tenant_id: TenantId, filename: &str, content: &[u8]) -> Result<StoredObject> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SitegateError::storage_write("memory storage write disabled"));
        }
        let path = object_key(tenant_id, filename)?;
        self.objects.lock().insert(path.clone(), content.to_vec());
        Ok(StoredObject {
            path,
            size: content.len() as u64,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SitegateError::storage_delete("memory storage delete disabled"));
        }
        self.objects.lock().remove(path);
        Ok(())
    }
}
