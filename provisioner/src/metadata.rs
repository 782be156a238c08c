// Instance metadata persistence
//
// One JSON document per document root, named by the SHA-256 of the root path.

use async_trait::async_trait;
use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, ProvisionResult};
use crate::installation::files;
use crate::models::instance::InstanceMeta;
use crate::security::crypto;

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn load(&self, root: &Path) -> ProvisionResult<Option<InstanceMeta>>;
    async fn save(&self, root: &Path, meta: &InstanceMeta) -> ProvisionResult<()>;
    /// Returns whether anything was removed.
    async fn remove(&self, root: &Path) -> ProvisionResult<bool>;
}

#[derive(Debug, Clone)]
pub struct FileMetaStore {
    dir: PathBuf,
}

impl FileMetaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, root: &Path) -> PathBuf {
        let key = crypto::sha256_hex(root.to_string_lossy().trim_end_matches('/').as_bytes());
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl MetaStore for FileMetaStore {
    async fn load(&self, root: &Path) -> ProvisionResult<Option<InstanceMeta>> {
        let path = self.path_for(root);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProvisionError::MetadataFailed(format!(
                    "read {:?}: {}",
                    path, e
                )))
            }
        };
        match serde_json::from_slice::<InstanceMeta>(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                // A corrupt record should not block status or reinstall.
                warn!(
                    "[PHASE: metadata] [STEP: load] Ignoring unreadable metadata (path={:?}, error={})",
                    path, e
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, root: &Path, meta: &InstanceMeta) -> ProvisionResult<()> {
        let path = self.path_for(root);
        let bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| ProvisionError::MetadataFailed(e.to_string()))?;
        files::write_file_atomic(&path, &bytes, "write_instance_meta")
            .await
            .map_err(|e| ProvisionError::MetadataFailed(format!("{:#}", e)))?;
        debug!(
            "[PHASE: metadata] [STEP: save] Saved metadata for {:?} at {:?}",
            root, path
        );
        Ok(())
    }

    async fn remove(&self, root: &Path) -> ProvisionResult<bool> {
        let path = self.path_for(root);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProvisionError::MetadataFailed(format!(
                "remove {:?}: {}",
                path, e
            ))),
        }
    }
}
