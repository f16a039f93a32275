//! Backend chain with integrity verification

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{compute_hash, verify_bytes, BackendKind, BlobBackend, BlobHandle, LocalStore, R2Store, TelegramTransport};
use crate::codec::CourseBlob;
use crate::config::Config;
use crate::error::{Result, StorageError};

/// Result of storing a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub handle: BlobHandle,
    /// Hash of the bytes that were sent, whichever backend took them
    pub hash: String,
    pub backend: BackendKind,
    pub size_bytes: u64,
}

struct ChainEntry {
    backend: Arc<dyn BlobBackend>,
    /// Read-only entries serve old handles but never take new blobs
    writable: bool,
}

/// Ordered chain of blob backends
pub struct BlobStore {
    chain: Vec<ChainEntry>,
    request_timeout: Duration,
}

/// Builder for [`BlobStore`]
pub struct BlobStoreBuilder {
    chain: Vec<ChainEntry>,
    request_timeout: Duration,
}

impl Default for BlobStoreBuilder {
    fn default() -> Self {
        Self {
            chain: Vec::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl BlobStoreBuilder {
    /// Append a backend that takes writes. Call order is chain order.
    pub fn backend(mut self, backend: Arc<dyn BlobBackend>) -> Self {
        self.chain.push(ChainEntry {
            backend,
            writable: true,
        });
        self
    }

    /// Append the local fallback; it only takes writes when `permitted`
    pub fn local_fallback(mut self, backend: Arc<dyn BlobBackend>, permitted: bool) -> Self {
        self.chain.push(ChainEntry {
            backend,
            writable: permitted,
        });
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> BlobStore {
        BlobStore {
            chain: self.chain,
            request_timeout: self.request_timeout,
        }
    }
}

impl BlobStore {
    pub fn builder() -> BlobStoreBuilder {
        BlobStoreBuilder::default()
    }

    /// Chain from configuration: telegram, then r2, then local (writes only
    /// in development)
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::builder().request_timeout(config.sync.request_timeout());

        if let Some(telegram) = &config.telegram {
            builder = builder.backend(Arc::new(TelegramTransport::new(telegram)?));
        }
        if let Some(r2) = &config.r2 {
            builder = builder.backend(Arc::new(R2Store::new(r2)?));
        }
        let local = LocalStore::new(config.blobs_dir()).await?;
        builder = builder.local_fallback(Arc::new(local), config.local_fallback_enabled());

        let store = builder.build();
        if store.writable_backends().is_empty() {
            warn!("No writable blob backend configured; every put will fail");
        }
        Ok(store)
    }

    /// Backends that accept new blobs, in chain order
    pub fn writable_backends(&self) -> Vec<BackendKind> {
        self.chain
            .iter()
            .filter(|entry| entry.writable)
            .map(|entry| entry.backend.kind())
            .collect()
    }

    /// Serialize, hash and store a course blob
    pub async fn put(&self, course_id: &str, blob: &CourseBlob) -> Result<PutReceipt> {
        let bytes = blob.to_canonical_bytes()?;
        self.put_bytes(course_id, &bytes).await
    }

    /// Store already-serialized bytes, trying each writable backend in turn
    pub async fn put_bytes(&self, course_id: &str, bytes: &[u8]) -> Result<PutReceipt> {
        let hash = compute_hash(bytes);
        let mut failures = Vec::new();

        for entry in self.chain.iter().filter(|entry| entry.writable) {
            let kind = entry.backend.kind();
            let attempt = tokio::time::timeout(
                self.request_timeout,
                entry.backend.put(course_id, &hash, bytes),
            )
            .await;

            match attempt {
                Ok(Ok(handle)) => {
                    info!(
                        course_id = %course_id,
                        backend = %kind,
                        handle = %handle,
                        hash = %hash,
                        size = bytes.len(),
                        "Stored course blob"
                    );
                    return Ok(PutReceipt {
                        handle,
                        hash,
                        backend: kind,
                        size_bytes: bytes.len() as u64,
                    });
                }
                Ok(Err(e)) => {
                    warn!(course_id = %course_id, backend = %kind, error = %e, "Blob put failed, trying next backend");
                    failures.push(format!("{}: {}", kind, e));
                }
                Err(_) => {
                    warn!(course_id = %course_id, backend = %kind, "Blob put timed out, trying next backend");
                    failures.push(format!("{}: timed out after {:?}", kind, self.request_timeout));
                }
            }
        }

        if failures.is_empty() {
            return Err(StorageError::Config("no writable blob backend configured".into()));
        }
        error!(course_id = %course_id, attempts = failures.len(), "Blob backend chain exhausted");
        Err(StorageError::ChainExhausted { failures })
    }

    /// Fetch and verify a blob.
    ///
    /// Distinct failures: `BlobNotFound` (no such object), `Unavailable` /
    /// `Timeout` (transport), `HashMismatch` (corruption). A mismatch is
    /// never repaired here.
    pub async fn get(&self, handle: &BlobHandle, expected_hash: &str) -> Result<CourseBlob> {
        let bytes = self.get_bytes(handle).await?;

        if !verify_bytes(&bytes, expected_hash) {
            let actual = compute_hash(&bytes);
            error!(handle = %handle, expected = %expected_hash, actual = %actual, "Blob hash mismatch");
            return Err(StorageError::HashMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }

        CourseBlob::from_bytes(&bytes)
    }

    async fn get_bytes(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        let entry = self
            .chain
            .iter()
            .find(|entry| entry.backend.kind() == handle.backend)
            .ok_or_else(|| StorageError::unavailable(handle.backend.to_string(), "backend not configured"))?;

        debug!(handle = %handle, "Fetching blob");
        match tokio::time::timeout(self.request_timeout, entry.backend.get(handle)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(format!("get {}", handle))),
        }
    }
}
