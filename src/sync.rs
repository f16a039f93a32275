//! Sync pass and read path
//!
//! ```text
//! write:  unit cache (dirty) ─► assemble blob ─► blob store put ─► publish pointer ─► mark synced
//! read:   metadata pointer ─► blob store get (verify) ─► overlay cached units ─► course
//! ```
//!
//! One sync per course runs at a time; different courses sync concurrently.
//! Dirty flags are cleared only after the pointer is published, and only
//! for the unit revisions that went into the blob.

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::blob::{compute_hash, BlobStore};
use crate::codec::{dirty_set, Block, BlockCodec, CourseBlob, Lesson, SCHEMA_VERSION};
use crate::config::SyncSection;
use crate::error::{Result, StorageError};
use crate::metadata::{BlobPointer, CourseMeta, MetadataIndex};
use crate::unit_cache::{CacheEntry, SyncedUnit, UnitCache, UnitKind, UnitPayload};

/// Outcome of one sync pass
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub course_id: String,
    /// New pointer, or `None` when there was nothing to sync
    pub pointer: Option<BlobPointer>,
    /// Units whose dirty flag was cleared
    pub synced_units: usize,
    /// Units still dirty afterwards (edited while the pass ran)
    pub still_dirty: usize,
    pub pruned_blocks: usize,
}

/// Which blob a loaded course came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSource {
    Current,
    /// Last-known-good pointer; the current one failed
    Previous,
    /// No remote blob; cached units only
    CacheOnly,
}

#[derive(Debug, Clone)]
pub struct LoadedCourse {
    pub blob: CourseBlob,
    pub source: BlobSource,
    pub meta: Option<CourseMeta>,
    /// Lessons whose derived blocks had drifted and were regenerated
    pub regenerated: Vec<String>,
}

/// Units written by an edit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditOutcome {
    pub changed_blocks: Vec<String>,
    pub lesson_saved: bool,
}

pub struct SyncEngine {
    units: Arc<UnitCache>,
    blobs: Arc<BlobStore>,
    index: Arc<dyn MetadataIndex>,
    settings: SyncSection,
    course_locks: DashMap<String, Arc<Mutex<()>>>,
    consecutive_failures: DashMap<String, u32>,
}

impl SyncEngine {
    pub fn new(
        units: Arc<UnitCache>,
        blobs: Arc<BlobStore>,
        index: Arc<dyn MetadataIndex>,
        settings: SyncSection,
    ) -> Self {
        Self {
            units,
            blobs,
            index,
            settings,
            course_locks: DashMap::new(),
            consecutive_failures: DashMap::new(),
        }
    }

    pub fn units(&self) -> &UnitCache {
        &self.units
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn index(&self) -> &dyn MetadataIndex {
        self.index.as_ref()
    }

    fn course_lock(&self, course_id: &str) -> Arc<Mutex<()>> {
        self.course_locks
            .entry(course_id.to_string())
            .or_default()
            .clone()
    }

    /// Failed passes since the last successful one
    pub fn consecutive_failures(&self, course_id: &str) -> u32 {
        self.consecutive_failures
            .get(course_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    fn record_outcome(&self, course_id: &str, result: &Result<SyncReport>) {
        match result {
            Ok(_) => {
                self.consecutive_failures.remove(course_id);
            }
            Err(e) => {
                let mut count = self.consecutive_failures.entry(course_id.to_string()).or_insert(0);
                *count += 1;
                if *count >= self.settings.warn_after_failures {
                    warn!(
                        course_id = %course_id,
                        failures = *count,
                        error = %e,
                        "Course has not synced after repeated attempts; local edits are safe but unpublished"
                    );
                } else {
                    debug!(course_id = %course_id, failures = *count, error = %e, "Sync pass failed");
                }
            }
        }
    }

    /// Drop the course's lock once no pass holds or awaits it
    fn release_course_lock(&self, course_id: &str) {
        self.course_locks
            .remove_if(course_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Run one sync pass for a course
    pub async fn sync_course(&self, course_id: &str) -> Result<SyncReport> {
        let result = {
            let lock = self.course_lock(course_id);
            let _guard = lock.lock().await;
            self.sync_locked(course_id).await
        };
        self.release_course_lock(course_id);

        self.record_outcome(course_id, &result);
        result
    }

    /// Sync, retrying transient failures with linear backoff
    pub async fn sync_with_retry(&self, course_id: &str) -> Result<SyncReport> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.sync_course(course_id).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.settings.retry_backoff() * attempt;
                    debug!(course_id = %course_id, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying sync");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_locked(&self, course_id: &str) -> Result<SyncReport> {
        // One read gives both the blob overlay and the dirty snapshot
        let cached = self.units.course_units(course_id)?;
        let snapshot: Vec<SyncedUnit> = cached
            .iter()
            .filter(|entry| entry.dirty)
            .map(SyncedUnit::from)
            .collect();

        if snapshot.is_empty() {
            debug!(course_id = %course_id, "Nothing to sync");
            return Ok(SyncReport {
                course_id: course_id.to_string(),
                pointer: None,
                synced_units: 0,
                still_dirty: 0,
                pruned_blocks: 0,
            });
        }

        let meta = self.get_meta(course_id).await?;
        let base = match &meta {
            Some(meta) => self
                .remote_blob(meta, false)
                .await?
                .map(|(blob, _)| blob)
                .unwrap_or_default(),
            None => CourseBlob::new(),
        };

        let mut blob = overlay(base, &cached);
        let regenerated = rederive_all(course_id, &mut blob);
        blob.schema_version = SCHEMA_VERSION;
        let pruned_blocks = blob.prune_orphans();

        let bytes = blob.to_canonical_bytes()?;
        let local_hash = compute_hash(&bytes);
        let receipt = self.blobs.put_bytes(course_id, &bytes).await?;
        if receipt.hash != local_hash {
            error!(course_id = %course_id, local = %local_hash, stored = %receipt.hash, "Stored blob hash differs from local hash");
            return Err(StorageError::HashMismatch {
                expected: local_hash,
                actual: receipt.hash,
            });
        }

        let pointer = BlobPointer {
            backend: receipt.backend,
            handle: receipt.handle.clone(),
            hash: receipt.hash.clone(),
            schema_version: SCHEMA_VERSION,
        };
        let published =
            tokio::time::timeout(self.settings.request_timeout(), self.index.publish_pointer(course_id, pointer.clone()))
                .await;
        match published {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(course_id = %course_id, handle = %receipt.handle, error = %e, "Pointer update failed; new blob left orphaned");
                return Err(e);
            }
            Err(_) => {
                warn!(course_id = %course_id, handle = %receipt.handle, "Pointer update timed out; new blob left orphaned");
                return Err(StorageError::Timeout(format!("publish pointer for {}", course_id)));
            }
        }

        let synced_units = self.units.mark_synced(course_id, &snapshot)?;
        let still_dirty = self.units.get_dirty_units(course_id)?.len();

        info!(
            course_id = %course_id,
            handle = %pointer.handle,
            hash = %pointer.hash,
            synced_units,
            still_dirty,
            pruned_blocks,
            regenerated = regenerated.len(),
            "Course synced"
        );

        Ok(SyncReport {
            course_id: course_id.to_string(),
            pointer: Some(pointer),
            synced_units,
            still_dirty,
            pruned_blocks,
        })
    }

    async fn get_meta(&self, course_id: &str) -> Result<Option<CourseMeta>> {
        match tokio::time::timeout(self.settings.request_timeout(), self.index.get(course_id)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(format!("metadata for {}", course_id))),
        }
    }

    /// Fetch the blob the course points at.
    ///
    /// Integrity and not-found failures fall back to the previous pointer.
    /// Transport failures fall back only when `fallback_on_transient`; a sync
    /// must not rebuild on an older blob just because the current one is
    /// briefly unreachable.
    async fn remote_blob(
        &self,
        meta: &CourseMeta,
        fallback_on_transient: bool,
    ) -> Result<Option<(CourseBlob, BlobSource)>> {
        let Some(current) = &meta.blob_pointer else {
            return Ok(None);
        };

        let err = match self.blobs.get(&current.handle, &current.hash).await {
            Ok(blob) => return Ok(Some((blob, BlobSource::Current))),
            Err(e) => e,
        };

        let Some(previous) = &meta.previous_pointer else {
            return Err(err);
        };
        if err.is_transient() && !fallback_on_transient {
            return Err(err);
        }

        match &err {
            StorageError::HashMismatch { .. } => error!(
                course_id = %meta.course_id,
                handle = %current.handle,
                error = %err,
                "Current blob is corrupt, falling back to last-known-good"
            ),
            _ => warn!(
                course_id = %meta.course_id,
                handle = %current.handle,
                error = %err,
                "Current blob unreadable, falling back to last-known-good"
            ),
        }

        match self.blobs.get(&previous.handle, &previous.hash).await {
            Ok(blob) => Ok(Some((blob, BlobSource::Previous))),
            Err(previous_err) => {
                warn!(course_id = %meta.course_id, error = %previous_err, "Last-known-good blob unreadable too");
                Err(err)
            }
        }
    }

    /// Load a course for display or editing.
    ///
    /// Remote blob first, then the local cache on top, so the editor always
    /// sees its own latest edits.
    pub async fn load_course(&self, course_id: &str) -> Result<LoadedCourse> {
        let cached = self.units.course_units(course_id)?;
        let meta = match self.get_meta(course_id).await {
            Ok(meta) => meta,
            Err(e) if !cached.is_empty() => {
                warn!(course_id = %course_id, error = %e, "Metadata unavailable, serving cached units");
                None
            }
            Err(e) => return Err(e),
        };

        let remote = match &meta {
            Some(meta) => match self.remote_blob(meta, true).await {
                Ok(remote) => remote,
                Err(e) if !cached.is_empty() => {
                    warn!(course_id = %course_id, error = %e, "Remote blob unavailable, serving cached units");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let (base, source) = match remote {
            Some((blob, source)) => (blob, source),
            None if meta.is_none() && cached.is_empty() => {
                return Err(StorageError::CourseNotFound(course_id.to_string()));
            }
            None => (CourseBlob::new(), BlobSource::CacheOnly),
        };

        let mut blob = overlay(base, &cached);
        let mut codec = BlockCodec::new(course_id).with_reserved_ids(ids_in_use(&blob));
        let regenerated = codec.inconsistent_lessons(&blob);
        for lesson_id in &regenerated {
            warn!(course_id = %course_id, lesson_id = %lesson_id, "Lesson blocks drifted from its rich document, regenerating");
            rederive_one(&mut codec, &mut blob, lesson_id);
        }

        Ok(LoadedCourse {
            blob,
            source,
            meta,
            regenerated,
        })
    }

    /// Seed the unit cache with the remote blob as clean units.
    /// Units with unsynced local edits are left alone. Returns units written.
    pub async fn hydrate(&self, course_id: &str) -> Result<usize> {
        let meta = self
            .get_meta(course_id)
            .await?
            .ok_or_else(|| StorageError::CourseNotFound(course_id.to_string()))?;
        let Some((blob, source)) = self.remote_blob(&meta, true).await? else {
            return Ok(0);
        };

        let mut written = 0;
        for lesson in blob.lessons.into_values() {
            if self.units.put_clean(course_id, UnitPayload::Lesson(lesson))?.is_some() {
                written += 1;
            }
        }
        for block in blob.blocks.into_values() {
            if self.units.put_clean(course_id, UnitPayload::Block(block))?.is_some() {
                written += 1;
            }
        }

        info!(course_id = %course_id, units = written, source = ?source, "Hydrated unit cache");
        Ok(written)
    }

    /// Save an edited lesson, writing only the blocks that actually changed.
    ///
    /// Rich-document lessons get their blocks re-derived (ids kept
    /// positionally); blocks-only lessons save just their structure.
    pub fn apply_lesson_edit(&self, course_id: &str, mut lesson: Lesson) -> Result<EditOutcome> {
        let codec = BlockCodec::new(course_id).with_reserved_ids(self.cached_ids_in_use(course_id)?);
        let derived = codec.rederive_lesson(&mut lesson).unwrap_or_default();

        let previous = self.cached_blocks(course_id, derived.iter().map(|block| block.id.as_str()))?;
        let changed = dirty_set(&previous, &derived);
        for block in derived.into_iter().filter(|block| changed.contains(&block.id)) {
            self.units.save_unit(course_id, UnitPayload::Block(block))?;
        }

        let lesson_changed = match self.units.get_unit(course_id, UnitKind::Lesson, &lesson.id)? {
            Some(UnitPayload::Lesson(cached)) => cached != lesson,
            _ => true,
        };
        if lesson_changed {
            self.units.save_unit(course_id, UnitPayload::Lesson(lesson))?;
        }

        debug!(course_id = %course_id, changed = changed.len(), lesson_saved = lesson_changed, "Applied lesson edit");
        Ok(EditOutcome {
            changed_blocks: changed,
            lesson_saved: lesson_changed,
        })
    }

    /// Save edited blocks of a blocks-only lesson; unchanged ones are skipped.
    ///
    /// Blocks derived from a rich-document lesson are refused; those change
    /// only through [`SyncEngine::apply_lesson_edit`].
    pub fn apply_block_edits(&self, course_id: &str, blocks: Vec<Block>) -> Result<Vec<String>> {
        for entry in self.units.course_units(course_id)? {
            let UnitPayload::Lesson(lesson) = &entry.payload else {
                continue;
            };
            if lesson.rich_doc_tree().is_none() {
                continue;
            }
            if blocks.iter().any(|block| lesson.block_ids().contains(&block.id)) {
                return Err(StorageError::InconsistentLesson {
                    lesson_id: lesson.id.clone(),
                });
            }
        }

        let previous = self.cached_blocks(course_id, blocks.iter().map(|block| block.id.as_str()))?;
        let blocks: Vec<Block> = blocks.into_iter().map(Block::normalized).collect();
        let changed = dirty_set(&previous, &blocks);
        for block in blocks.into_iter().filter(|block| changed.contains(&block.id)) {
            self.units.save_unit(course_id, UnitPayload::Block(block))?;
        }
        Ok(changed)
    }

    /// Block ids the cache knows for a course, stored or referenced
    fn cached_ids_in_use(&self, course_id: &str) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for entry in self.units.course_units(course_id)? {
            match &entry.payload {
                UnitPayload::Block(block) => {
                    ids.insert(block.id.clone());
                }
                UnitPayload::Lesson(lesson) => ids.extend(lesson.block_ids().iter().cloned()),
            }
        }
        Ok(ids)
    }

    fn cached_blocks<'a>(
        &self,
        course_id: &str,
        ids: impl Iterator<Item = &'a str>,
    ) -> Result<BTreeMap<String, Block>> {
        let mut previous = BTreeMap::new();
        for id in ids {
            if let Some(UnitPayload::Block(block)) = self.units.get_unit(course_id, UnitKind::Block, id)? {
                previous.insert(id.to_string(), block);
            }
        }
        Ok(previous)
    }
}

/// Lay cached units over a base blob
fn overlay(mut blob: CourseBlob, cached: &[CacheEntry]) -> CourseBlob {
    for entry in cached {
        match &entry.payload {
            UnitPayload::Block(block) => blob.insert_block(block.clone()),
            UnitPayload::Lesson(lesson) => blob.insert_lesson(lesson.clone()),
        }
    }
    blob
}

/// Every block id a blob stores or a lesson references
fn ids_in_use(blob: &CourseBlob) -> BTreeSet<String> {
    blob.blocks
        .keys()
        .cloned()
        .chain(blob.lessons.values().flat_map(|lesson| lesson.block_ids().iter().cloned()))
        .collect()
}

/// Regenerate the derived blocks of every rich-document lesson
fn rederive_all(course_id: &str, blob: &mut CourseBlob) -> Vec<String> {
    let mut codec = BlockCodec::new(course_id).with_reserved_ids(ids_in_use(blob));
    let lesson_ids: Vec<String> = codec.inconsistent_lessons(blob);
    for lesson_id in &lesson_ids {
        rederive_one(&mut codec, blob, lesson_id);
    }
    lesson_ids
}

/// Regenerate one lesson; its new ids become unavailable to later lessons
fn rederive_one(codec: &mut BlockCodec, blob: &mut CourseBlob, lesson_id: &str) {
    let Some(lesson) = blob.lessons.get_mut(lesson_id) else {
        return;
    };
    if let Some(blocks) = codec.rederive_lesson(lesson) {
        codec.reserve(blocks.iter().map(|block| block.id.clone()));
        for block in blocks {
            blob.blocks.insert(block.id.clone(), block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BackendKind, MockBackend};
    use crate::codec::{BlockType, RichNode};
    use crate::metadata::SledMetadataIndex;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Harness {
        engine: Arc<SyncEngine>,
        primary: Arc<MockBackend>,
        index: Arc<SledMetadataIndex>,
    }

    fn settings() -> SyncSection {
        SyncSection {
            request_timeout_secs: 5,
            max_attempts: 3,
            retry_backoff_ms: 1,
            warn_after_failures: 2,
        }
    }

    fn harness_with(primary: MockBackend) -> Harness {
        let primary = Arc::new(primary);
        let index = Arc::new(SledMetadataIndex::temporary().unwrap());
        let blobs = Arc::new(BlobStore::builder().backend(primary.clone()).build());
        let engine = Arc::new(SyncEngine::new(
            Arc::new(UnitCache::temporary().unwrap()),
            blobs,
            index.clone(),
            settings(),
        ));
        Harness { engine, primary, index }
    }

    fn harness() -> Harness {
        harness_with(MockBackend::new(BackendKind::Telegram))
    }

    fn doc(paragraphs: &[&str]) -> RichNode {
        RichNode::doc(paragraphs.iter().map(|text| RichNode::paragraph(*text)).collect())
    }

    #[tokio::test]
    async fn test_sync_publishes_and_clears_dirty() {
        let h = harness();
        h.engine
            .apply_lesson_edit("course-1", Lesson::rich_doc("l1", "Intro", doc(&["Hello", "World"])))
            .unwrap();

        let report = h.engine.sync_course("course-1").await.unwrap();

        assert_eq!(report.synced_units, 3);
        assert_eq!(report.still_dirty, 0);
        let pointer = report.pointer.unwrap();
        let meta = h.index.get("course-1").await.unwrap().unwrap();
        assert_eq!(meta.blob_pointer, Some(pointer.clone()));

        let stored = h.engine.blobs().get(&pointer.handle, &pointer.hash).await.unwrap();
        assert_eq!(stored.lesson_blocks("l1").len(), 2);
        assert!(h.engine.units().get_dirty_units("course-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_dirty_means_no_put() {
        let h = harness();
        let report = h.engine.sync_course("course-1").await.unwrap();
        assert!(report.pointer.is_none());
        assert_eq!(h.primary.put_count(), 0);
    }

    #[tokio::test]
    async fn test_edit_writes_only_changed_blocks() {
        let h = harness();
        let first = h
            .engine
            .apply_lesson_edit("course-1", Lesson::rich_doc("l1", "Intro", doc(&["One", "Two", "Three"])))
            .unwrap();
        assert_eq!(first.changed_blocks.len(), 3);
        h.engine.sync_course("course-1").await.unwrap();

        let loaded = h.engine.load_course("course-1").await.unwrap();
        let mut lesson = loaded.blob.lessons["l1"].clone();
        if let crate::codec::LessonBody::RichDoc { rich_doc, .. } = &mut lesson.body {
            *rich_doc = doc(&["One", "Two (edited)", "Three"]);
        }

        let outcome = h.engine.apply_lesson_edit("course-1", lesson).unwrap();
        assert_eq!(outcome.changed_blocks.len(), 1);
        assert!(outcome.lesson_saved);

        let dirty_blocks: Vec<String> = h
            .engine
            .units()
            .get_dirty_units("course-1")
            .unwrap()
            .iter()
            .filter(|entry| entry.kind() == UnitKind::Block)
            .map(|entry| entry.unit_id().to_string())
            .collect();
        assert_eq!(dirty_blocks, outcome.changed_blocks);
    }

    #[tokio::test]
    async fn test_concurrent_syncs_of_one_course_are_serialized() {
        let h = harness_with(MockBackend::new(BackendKind::Telegram).with_delay(Duration::from_millis(40)));
        h.engine
            .apply_block_edits("course-1", vec![Block::new("b1", BlockType::Paragraph, "x")])
            .unwrap();

        let a = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.sync_course("course-1").await })
        };
        let b = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.sync_course("course-1").await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(h.primary.put_count(), 1);
        assert_eq!(a.pointer.is_some() as u8 + b.pointer.is_some() as u8, 1);
    }

    #[tokio::test]
    async fn test_put_failure_keeps_units_dirty_and_escalates() {
        let h = harness_with(MockBackend::new(BackendKind::Telegram).with_available(false));
        h.engine
            .apply_block_edits("course-1", vec![Block::new("b1", BlockType::Paragraph, "x")])
            .unwrap();

        let err = h.engine.sync_with_retry("course-1").await.unwrap_err();
        assert!(matches!(err, StorageError::ChainExhausted { .. }));
        assert_eq!(h.primary.put_count(), 3);
        assert_eq!(h.engine.consecutive_failures("course-1"), 3);
        assert_eq!(h.engine.units().get_dirty_units("course-1").unwrap().len(), 1);

        h.primary.set_available(true);
        h.engine.sync_course("course-1").await.unwrap();
        assert_eq!(h.engine.consecutive_failures("course-1"), 0);
    }

    /// Index whose reads or pointer updates can be made to fail
    struct FlakyIndex {
        inner: SledMetadataIndex,
        fail_get: AtomicBool,
        fail_publish: AtomicBool,
    }

    impl FlakyIndex {
        fn new() -> Self {
            Self {
                inner: SledMetadataIndex::temporary().unwrap(),
                fail_get: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MetadataIndex for FlakyIndex {
        async fn get(&self, course_id: &str) -> Result<Option<CourseMeta>> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(StorageError::Index("index unreachable".into()));
            }
            self.inner.get(course_id).await
        }
        async fn merge(&self, course_id: &str, patch: Value) -> Result<CourseMeta> {
            self.inner.merge(course_id, patch).await
        }
        async fn publish_pointer(&self, course_id: &str, pointer: BlobPointer) -> Result<CourseMeta> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(StorageError::Index("write rejected".into()));
            }
            self.inner.publish_pointer(course_id, pointer).await
        }
        async fn record_enrollment(&self, course_id: &str) -> Result<u64> {
            self.inner.record_enrollment(course_id).await
        }
        async fn list(&self) -> Result<Vec<CourseMeta>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_failed_pointer_update_keeps_prior_pointer() {
        let primary = Arc::new(MockBackend::new(BackendKind::Telegram));
        let index = Arc::new(FlakyIndex::new());
        let engine = SyncEngine::new(
            Arc::new(UnitCache::temporary().unwrap()),
            Arc::new(BlobStore::builder().backend(primary.clone()).build()),
            index.clone(),
            settings(),
        );

        engine
            .apply_block_edits("c1", vec![Block::new("b1", BlockType::Paragraph, "v1")])
            .unwrap();
        engine
            .apply_lesson_edit("c1", Lesson::legacy("l1", "Intro", vec!["b1".into()]))
            .unwrap();
        let first = engine.sync_course("c1").await.unwrap().pointer.unwrap();

        index.fail_publish.store(true, Ordering::SeqCst);
        engine
            .apply_block_edits("c1", vec![Block::new("b1", BlockType::Paragraph, "v2")])
            .unwrap();
        assert!(engine.sync_course("c1").await.is_err());

        // Blob was written but nobody points at it
        assert_eq!(primary.put_count(), 2);
        let meta = index.get("c1").await.unwrap().unwrap();
        assert_eq!(meta.blob_pointer, Some(first));
        assert_eq!(engine.units().get_dirty_units("c1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_serves_cache_when_index_unreachable() {
        let index = Arc::new(FlakyIndex::new());
        let engine = SyncEngine::new(
            Arc::new(UnitCache::temporary().unwrap()),
            Arc::new(BlobStore::builder().backend(Arc::new(MockBackend::new(BackendKind::Telegram))).build()),
            index.clone(),
            settings(),
        );
        engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "Intro", doc(&["offline"])))
            .unwrap();
        engine.sync_course("c1").await.unwrap();

        index.fail_get.store(true, Ordering::SeqCst);
        let loaded = engine.load_course("c1").await.unwrap();
        assert_eq!(loaded.source, BlobSource::CacheOnly);
        let texts: Vec<&str> = loaded.blob.lesson_blocks("l1").iter().map(|b| b.value.as_str()).collect();
        assert_eq!(texts, vec!["offline"]);

        // Nothing cached: the index error is the answer
        engine.units().clear_course("c1").unwrap();
        assert!(matches!(engine.load_course("c1").await, Err(StorageError::Index(_))));
    }

    #[tokio::test]
    async fn test_new_lessons_never_share_block_ids() {
        let h = harness();
        let one = h
            .engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "One", doc(&["lesson one text"])))
            .unwrap();
        let two = h
            .engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l2", "Two", doc(&["lesson two text"])).with_position(1))
            .unwrap();
        assert!(one.changed_blocks.iter().all(|id| !two.changed_blocks.contains(id)));

        let pointer = h.engine.sync_course("c1").await.unwrap().pointer.unwrap();
        let stored = h.engine.blobs().get(&pointer.handle, &pointer.hash).await.unwrap();

        assert_eq!(stored.blocks.len(), 2);
        let texts = |lesson: &str| -> Vec<String> {
            stored.lesson_blocks(lesson).iter().map(|b| b.value.clone()).collect()
        };
        assert_eq!(texts("l1"), vec!["lesson one text".to_string()]);
        assert_eq!(texts("l2"), vec!["lesson two text".to_string()]);
    }

    #[tokio::test]
    async fn test_course_lock_released_after_sync() {
        let h = harness();
        h.engine
            .apply_block_edits("c1", vec![Block::new("b1", BlockType::Paragraph, "x")])
            .unwrap();
        h.engine.sync_course("c1").await.unwrap();
        h.engine.sync_course("c2").await.unwrap();

        assert!(h.engine.course_locks.is_empty());
    }

    #[tokio::test]
    async fn test_load_falls_back_to_previous_pointer_on_corruption() {
        let h = harness();
        h.engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "Intro", doc(&["v1"])))
            .unwrap();
        h.engine.sync_course("c1").await.unwrap();
        h.engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "Intro", doc(&["v2"])))
            .unwrap();
        let second = h.engine.sync_course("c1").await.unwrap().pointer.unwrap();

        h.primary.corrupt(&second.handle);
        h.engine.units().clear_course("c1").unwrap();

        let loaded = h.engine.load_course("c1").await.unwrap();
        assert_eq!(loaded.source, BlobSource::Previous);
        let texts: Vec<&str> = loaded.blob.lesson_blocks("l1").iter().map(|b| b.value.as_str()).collect();
        assert_eq!(texts, vec!["v1"]);

        // The pointer itself is never rewritten
        let meta = h.index.get("c1").await.unwrap().unwrap();
        assert_eq!(meta.blob_pointer, Some(second));
    }

    #[tokio::test]
    async fn test_load_prefers_local_edits_and_reports_missing_course() {
        let h = harness();
        assert!(matches!(
            h.engine.load_course("nope").await,
            Err(StorageError::CourseNotFound(_))
        ));

        h.engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "Intro", doc(&["remote"])))
            .unwrap();
        h.engine.sync_course("c1").await.unwrap();
        h.engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "Intro", doc(&["local"])))
            .unwrap();

        let loaded = h.engine.load_course("c1").await.unwrap();
        assert_eq!(loaded.source, BlobSource::Current);
        let texts: Vec<&str> = loaded.blob.lesson_blocks("l1").iter().map(|b| b.value.as_str()).collect();
        assert_eq!(texts, vec!["local"]);
    }

    #[tokio::test]
    async fn test_hydrate_seeds_clean_units() {
        let h = harness();
        h.engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "Intro", doc(&["a", "b"])))
            .unwrap();
        h.engine.sync_course("c1").await.unwrap();
        h.engine.units().clear_course("c1").unwrap();

        let written = h.engine.hydrate("c1").await.unwrap();

        assert_eq!(written, 3);
        assert!(h.engine.units().get_dirty_units("c1").unwrap().is_empty());
        assert_eq!(h.engine.units().course_units("c1").unwrap().len(), 3);
    }

    #[test]
    fn test_block_edits_refused_for_rich_doc_lessons() {
        let h = harness();
        h.engine
            .apply_lesson_edit("c1", Lesson::legacy("legacy", "Old", vec!["b1".into()]))
            .unwrap();
        let outcome = h
            .engine
            .apply_lesson_edit("c1", Lesson::rich_doc("l1", "Intro", doc(&["derived"])))
            .unwrap();
        let derived_id = outcome.changed_blocks[0].clone();

        let changed = h
            .engine
            .apply_block_edits("c1", vec![Block::new("b1", BlockType::Paragraph, "hand written")])
            .unwrap();
        assert_eq!(changed, vec!["b1".to_string()]);

        let refused = h
            .engine
            .apply_block_edits("c1", vec![Block::new(derived_id, BlockType::Paragraph, "hand edit")]);
        assert!(matches!(
            refused,
            Err(StorageError::InconsistentLesson { lesson_id }) if lesson_id == "l1"
        ));
    }
}
