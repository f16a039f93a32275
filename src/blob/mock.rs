//! In-memory backend for tests and offline tooling

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{BackendKind, BlobBackend, BlobHandle};
use crate::error::{Result, StorageError};

/// Mock backend that keeps objects in memory.
///
/// Availability can be toggled at runtime and calls are counted, so tests
/// can check which links of the chain were tried.
pub struct MockBackend {
    kind: BackendKind,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_count: AtomicU32,
    get_count: AtomicU32,
    available: AtomicBool,
    delay: Option<Duration>,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            objects: Mutex::new(HashMap::new()),
            put_count: AtomicU32::new(0),
            get_count: AtomicU32::new(0),
            available: AtomicBool::new(true),
            delay: None,
        }
    }

    /// Start available or not
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> u32 {
        self.put_count.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> u32 {
        self.get_count.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    /// Flip one byte of a stored object
    pub fn corrupt(&self, handle: &BlobHandle) {
        if let Ok(mut objects) = self.objects.lock() {
            if let Some(bytes) = objects.get_mut(&handle.id) {
                if let Some(byte) = bytes.last_mut() {
                    *byte ^= 0x01;
                }
            }
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::unavailable(self.kind.to_string(), "mock backend offline"))
        }
    }
}

#[async_trait]
impl BlobBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn put(&self, course_id: &str, _hash: &str, bytes: &[u8]) -> Result<BlobHandle> {
        let n = self.put_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.pause().await;
        self.check_available()?;

        let id = format!("{}-mock-{}", course_id, n);
        self.objects
            .lock()
            .map_err(|_| StorageError::unavailable(self.kind.to_string(), "mock store poisoned"))?
            .insert(id.clone(), bytes.to_vec());
        Ok(BlobHandle::new(self.kind, id))
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_available()?;

        self.objects
            .lock()
            .map_err(|_| StorageError::unavailable(self.kind.to_string(), "mock store poisoned"))?
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| StorageError::BlobNotFound(handle.to_string()))
    }
}
