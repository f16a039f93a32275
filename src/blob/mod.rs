//! Blob storage abstraction
//!
//! A course blob is written whole to the first backend in the chain that
//! accepts it:
//!
//! ```text
//! put(course, blob)
//!   │ canonical bytes + sha256
//!   ▼
//! ┌───────────┐  fail  ┌──────────┐  fail  ┌────────────────────────┐
//! │ telegram  │ ─────► │ r2 (s3)  │ ─────► │ local fs (dev only)    │
//! └───────────┘        └──────────┘        └────────────────────────┘
//!       │ ok                │ ok                    │ ok
//!       └──────────► PutReceipt { handle, hash } ◄──┘
//! ```
//!
//! Blobs are immutable. A retried `put` creates another object with another
//! handle, so retries never corrupt anything already published.

mod local;
mod mock;
mod r2;
mod store;
mod telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::codec::CourseBlob;
use crate::error::{Result, StorageError};

pub use local::LocalStore;
pub use mock::MockBackend;
pub use r2::R2Store;
pub use store::{BlobStore, BlobStoreBuilder, PutReceipt};
pub use telegram::TelegramTransport;

/// Hash prefix shared by every content hash
pub const HASH_PREFIX: &str = "sha256-";

/// Which backend holds a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Telegram,
    R2,
    Local,
}

impl BackendKind {
    /// Handle prefix for this backend
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Telegram => "tg",
            Self::R2 => "r2",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Telegram => "telegram",
            Self::R2 => "r2",
            Self::Local => "local",
        };
        f.write_str(name)
    }
}

/// Backend-specific reference to a stored blob.
///
/// Rendered as `tg-{file_id}`, `r2-{folder}:{filename}` or `local-{path}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobHandle {
    pub backend: BackendKind,
    pub id: String,
}

impl BlobHandle {
    pub fn new(backend: BackendKind, id: impl Into<String>) -> Self {
        Self {
            backend,
            id: id.into(),
        }
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.backend.prefix(), self.id)
    }
}

impl FromStr for BlobHandle {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, id) = s
            .split_once('-')
            .ok_or_else(|| StorageError::InvalidHandle(s.to_string()))?;
        let backend = match prefix {
            "tg" => BackendKind::Telegram,
            "r2" => BackendKind::R2,
            "local" => BackendKind::Local,
            _ => return Err(StorageError::InvalidHandle(s.to_string())),
        };
        if id.is_empty() {
            return Err(StorageError::InvalidHandle(s.to_string()));
        }
        Ok(Self::new(backend, id))
    }
}

impl Serialize for BlobHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlobHandle {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One storage backend in the chain
#[async_trait]
pub trait BlobBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Store `bytes` as a brand-new object
    async fn put(&self, course_id: &str, hash: &str, bytes: &[u8]) -> Result<BlobHandle>;

    /// Fetch the raw bytes behind a handle.
    ///
    /// Must return `BlobNotFound` for a missing object and `Unavailable` for
    /// transport trouble.
    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>>;
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
}

/// Recompute the hash of exactly these bytes and compare
pub fn verify_bytes(bytes: &[u8], hash: &str) -> bool {
    compute_hash(bytes) == hash
}

/// Whether `hash` is the content hash of the blob's canonical serialization
pub fn verify(blob: &CourseBlob, hash: &str) -> bool {
    blob.to_canonical_bytes()
        .map(|bytes| verify_bytes(&bytes, hash))
        .unwrap_or(false)
}

/// First `len` hex chars of a content hash, for captions and filenames
pub(crate) fn hash_fragment(hash: &str, len: usize) -> &str {
    let hex = hash.strip_prefix(HASH_PREFIX).unwrap_or(hash);
    &hex[..len.min(hex.len())]
}

/// Course id reduced to filename-safe characters
pub(crate) fn file_safe(course_id: &str) -> String {
    course_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
