//! Course metadata index
//!
//! Holds the mutable per-course record and the pointer to its current blob.
//! Writes are merges: a patch only touches the fields it names, so a
//! metadata-only update racing a pointer publish never clobbers it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::Tree;
use std::path::Path;
use tracing::{debug, info};

use crate::blob::{BackendKind, BlobHandle};
use crate::error::{Result, StorageError};

/// Where the current blob of a course lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPointer {
    pub backend: BackendKind,
    pub handle: BlobHandle,
    pub hash: String,
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
}

/// Per-course record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CourseMeta {
    pub course_id: String,
    pub title: String,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub instructor: Option<String>,
    pub category: Option<String>,
    pub level: Option<String>,
    pub duration_minutes: Option<u32>,
    pub price_cents: Option<u64>,
    pub published: bool,
    pub enrollment_count: u64,
    pub rating_average: Option<f64>,
    pub rating_count: u64,
    /// Current blob
    pub blob_pointer: Option<BlobPointer>,
    /// Last-known-good blob, kept when a new pointer is published
    pub previous_pointer: Option<BlobPointer>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CourseMeta {
    pub fn new(course_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Document store keyed by course id
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    async fn get(&self, course_id: &str) -> Result<Option<CourseMeta>>;

    /// Apply a JSON merge patch (RFC 7386). Creates the record if missing.
    async fn merge(&self, course_id: &str, patch: Value) -> Result<CourseMeta>;

    /// Atomically point the course at a new blob.
    ///
    /// The old pointer becomes `previous_pointer`. Every other field is
    /// left as is.
    async fn publish_pointer(&self, course_id: &str, pointer: BlobPointer) -> Result<CourseMeta>;

    /// Atomically bump the enrollment count
    async fn record_enrollment(&self, course_id: &str) -> Result<u64>;

    async fn list(&self) -> Result<Vec<CourseMeta>>;
}

/// sled-backed metadata index
pub struct SledMetadataIndex {
    courses: Tree,
}

impl SledMetadataIndex {
    /// Open or create metadata database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened metadata index");
        Ok(Self {
            courses: db.open_tree("courses")?,
        })
    }

    /// In-memory index for tests
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            courses: db.open_tree("courses")?,
        })
    }

    fn decode(bytes: &[u8]) -> Result<CourseMeta> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Read-modify-write under compare-and-swap; retried on contention
    fn update<F>(&self, course_id: &str, mut apply: F) -> Result<CourseMeta>
    where
        F: FnMut(&mut CourseMeta) -> Result<()>,
    {
        loop {
            let current = self.courses.get(course_id.as_bytes())?;
            let mut meta = match &current {
                Some(bytes) => Self::decode(bytes)?,
                None => CourseMeta::new(course_id, ""),
            };

            apply(&mut meta)?;
            meta.course_id = course_id.to_string();
            meta.updated_at = Some(Utc::now());

            let encoded = rmp_serde::to_vec_named(&meta)?;
            match self
                .courses
                .compare_and_swap(course_id.as_bytes(), current, Some(encoded))?
            {
                Ok(()) => return Ok(meta),
                Err(_) => debug!(course_id = %course_id, "Metadata write contended, retrying"),
            }
        }
    }
}

/// RFC 7386 merge: objects merge key by key, `null` clears, anything else replaces
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(fields) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        fields.remove(key);
                    } else {
                        merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl MetadataIndex for SledMetadataIndex {
    async fn get(&self, course_id: &str) -> Result<Option<CourseMeta>> {
        match self.courses.get(course_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn merge(&self, course_id: &str, patch: Value) -> Result<CourseMeta> {
        if !patch.is_object() {
            return Err(StorageError::Index("metadata patch must be a JSON object".into()));
        }
        for protected in ["courseId", "blobPointer", "previousPointer"] {
            if patch.get(protected).is_some() {
                return Err(StorageError::Index(format!(
                    "{} cannot be set through a metadata patch",
                    protected
                )));
            }
        }

        self.update(course_id, |meta| {
            let mut doc = serde_json::to_value(&*meta)?;
            merge_patch(&mut doc, &patch);
            *meta = serde_json::from_value(doc)
                .map_err(|e| StorageError::Index(format!("invalid metadata patch: {}", e)))?;
            Ok(())
        })
    }

    async fn publish_pointer(&self, course_id: &str, pointer: BlobPointer) -> Result<CourseMeta> {
        let meta = self.update(course_id, |meta| {
            if meta.blob_pointer.as_ref() != Some(&pointer) {
                meta.previous_pointer = meta.blob_pointer.take();
                meta.blob_pointer = Some(pointer.clone());
            }
            Ok(())
        })?;
        info!(course_id = %course_id, handle = %pointer.handle, hash = %pointer.hash, "Published blob pointer");
        Ok(meta)
    }

    async fn record_enrollment(&self, course_id: &str) -> Result<u64> {
        let meta = self.update(course_id, |meta| {
            meta.enrollment_count += 1;
            Ok(())
        })?;
        Ok(meta.enrollment_count)
    }

    async fn list(&self) -> Result<Vec<CourseMeta>> {
        let mut result = Vec::new();
        for item in self.courses.iter() {
            let (_, value) = item?;
            result.push(Self::decode(&value)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn pointer(id: &str, hash: &str) -> BlobPointer {
        BlobPointer {
            backend: BackendKind::Telegram,
            handle: BlobHandle::new(BackendKind::Telegram, id),
            hash: hash.to_string(),
            schema_version: 2,
        }
    }

    #[tokio::test]
    async fn test_merge_is_not_destructive() {
        let index = SledMetadataIndex::temporary().unwrap();

        index
            .merge("c1", json!({ "title": "Rust 101", "published": true, "level": "beginner" }))
            .await
            .unwrap();
        let meta = index
            .merge("c1", json!({ "description": "Ownership and borrowing", "level": null }))
            .await
            .unwrap();

        assert_eq!(meta.title, "Rust 101");
        assert!(meta.published);
        assert_eq!(meta.description.as_deref(), Some("Ownership and borrowing"));
        assert_eq!(meta.level, None);
        assert_eq!(index.get("c1").await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_merge_rejects_pointer_fields_and_bad_patches() {
        let index = SledMetadataIndex::temporary().unwrap();

        assert!(matches!(
            index.merge("c1", json!({ "blobPointer": null })).await,
            Err(StorageError::Index(_))
        ));
        assert!(matches!(
            index.merge("c1", json!(["title"])).await,
            Err(StorageError::Index(_))
        ));
        assert!(matches!(
            index.merge("c1", json!({ "published": "yes" })).await,
            Err(StorageError::Index(_))
        ));
        assert!(index.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_keeps_previous_pointer_and_other_fields() {
        let index = SledMetadataIndex::temporary().unwrap();
        index.merge("c1", json!({ "title": "Rust 101" })).await.unwrap();

        index.publish_pointer("c1", pointer("a", "sha256-aa")).await.unwrap();
        let meta = index.publish_pointer("c1", pointer("b", "sha256-bb")).await.unwrap();

        assert_eq!(meta.title, "Rust 101");
        assert_eq!(meta.blob_pointer, Some(pointer("b", "sha256-bb")));
        assert_eq!(meta.previous_pointer, Some(pointer("a", "sha256-aa")));

        // Republishing the same pointer does not lose the last-known-good one
        let meta = index.publish_pointer("c1", pointer("b", "sha256-bb")).await.unwrap();
        assert_eq!(meta.previous_pointer, Some(pointer("a", "sha256-aa")));
    }

    #[tokio::test]
    async fn test_concurrent_enrollments_and_publish_all_land() {
        let index = Arc::new(SledMetadataIndex::temporary().unwrap());
        index.merge("c1", json!({ "title": "Rust 101" })).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let index = index.clone();
            tasks.push(tokio::spawn(async move { index.record_enrollment("c1").await }));
        }
        let publisher = {
            let index = index.clone();
            tokio::spawn(async move { index.publish_pointer("c1", pointer("x", "sha256-xx")).await })
        };

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        publisher.await.unwrap().unwrap();

        let meta = index.get("c1").await.unwrap().unwrap();
        assert_eq!(meta.enrollment_count, 20);
        assert_eq!(meta.blob_pointer, Some(pointer("x", "sha256-xx")));
    }

    #[tokio::test]
    async fn test_list_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let index = SledMetadataIndex::open(dir.path().join("metadata.sled")).unwrap();
            index.merge("c1", json!({ "title": "One" })).await.unwrap();
            index.merge("c2", json!({ "title": "Two" })).await.unwrap();
        }

        let index = SledMetadataIndex::open(dir.path().join("metadata.sled")).unwrap();
        let titles: Vec<String> = index.list().await.unwrap().into_iter().map(|m| m.title).collect();
        assert_eq!(titles, vec!["One".to_string(), "Two".to_string()]);
    }
}
