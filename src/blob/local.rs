//! Local filesystem backend
//!
//! Layout: `{root}/{course}/{hash12}-{uuid}.json`. Handles carry the path
//! relative to the root.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::{file_safe, hash_fragment, BackendKind, BlobBackend, BlobHandle};
use crate::error::{Result, StorageError};

pub struct LocalStore {
    root_dir: PathBuf,
}

impl LocalStore {
    /// Create a local store rooted at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized local blob store");

        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Resolve a handle id to a path that stays inside the root
    fn resolve(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        let contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !contained {
            return Err(StorageError::InvalidHandle(format!("local-{}", id)));
        }
        Ok(self.root_dir.join(relative))
    }
}

#[async_trait]
impl BlobBackend for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn put(&self, course_id: &str, hash: &str, bytes: &[u8]) -> Result<BlobHandle> {
        let course_dir = file_safe(course_id);
        let filename = format!("{}-{}.json", hash_fragment(hash, 12), uuid::Uuid::new_v4());
        let id = format!("{}/{}", course_dir, filename);

        fs::create_dir_all(self.root_dir.join(&course_dir)).await?;
        fs::write(self.resolve(&id)?, bytes).await?;

        debug!(course_id = %course_id, id = %id, size = bytes.len(), "Wrote local blob");
        Ok(BlobHandle::new(BackendKind::Local, id))
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        let path = self.resolve(&handle.id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::BlobNotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
