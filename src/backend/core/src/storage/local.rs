//! Local filesystem storage.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::{object_key, validate_key, StorageBackend, StoredObject};
use crate::error::{Result, SitegateError};
use crate::jobs::TenantId;

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn write(&self, tenant_id: TenantId, filename: &str, content: &[u8]) -> Result<StoredObject> {
        let key = object_key(tenant_id, filename)?;
        let target = self.resolve(&key)?;
        let dir = target
            .parent()
            .ok_or_else(|| SitegateError::storage_write("storage path has no parent"))?;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SitegateError::storage_write("failed to create storage directory").with_source(e))?;

        // Readers never observe a partially written file.
        let tmp = dir.join(format!(".{}.{}.tmp", filename, Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SitegateError::storage_write("failed to write object").with_source(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SitegateError::storage_write("failed to move object into place").with_source(e));
        }

        debug!(path = %key, size = content.len(), "Stored object on local disk");
        Ok(StoredObject {
            path: key,
            size: content.len() as u64,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SitegateError::storage_delete("failed to delete object").with_source(e)),
        }
    }
}
