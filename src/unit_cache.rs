//! Per-unit offline cache
//!
//! Every block and lesson the editor touches is written here first, with a
//! dirty flag, so editing never waits on the network. A sync pass later
//! reads the dirty units and clears them once the remote write is confirmed.
//!
//! Layout (sled trees), where `{c}` is `{len(course)}:{course}:`:
//! - `blocks`:  `{c}{blockId}`  -> CacheEntry
//! - `lessons`: `{c}{lessonId}` -> CacheEntry
//! - `dirty`:   `{c}{kind}:{unitId}` -> primary key
//!
//! The length prefix keeps keys unambiguous when ids contain `:`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info};

use crate::codec::{Block, Lesson};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Block,
    Lesson,
}

impl UnitKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Lesson => "lesson",
        }
    }
}

/// What a cached unit holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum UnitPayload {
    Block(Block),
    Lesson(Lesson),
}

impl UnitPayload {
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Block(_) => UnitKind::Block,
            Self::Lesson(_) => UnitKind::Lesson,
        }
    }

    pub fn unit_id(&self) -> &str {
        match self {
            Self::Block(block) => &block.id,
            Self::Lesson(lesson) => &lesson.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `{len(courseId)}:{courseId}:{unitId}`
    pub key: String,
    pub course_id: String,
    pub payload: UnitPayload,
    pub last_modified: DateTime<Utc>,
    pub dirty: bool,
    /// Bumped on every local write
    pub revision: u64,
}

impl CacheEntry {
    pub fn kind(&self) -> UnitKind {
        self.payload.kind()
    }

    pub fn unit_id(&self) -> &str {
        self.payload.unit_id()
    }
}

/// A unit revision that made it into a persisted blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedUnit {
    pub kind: UnitKind,
    pub unit_id: String,
    pub revision: u64,
}

impl From<&CacheEntry> for SyncedUnit {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            kind: entry.kind(),
            unit_id: entry.unit_id().to_string(),
            revision: entry.revision,
        }
    }
}

fn course_prefix(course_id: &str) -> String {
    format!("{}:{}:", course_id.len(), course_id)
}

fn unit_key(course_id: &str, unit_id: &str) -> String {
    format!("{}{}", course_prefix(course_id), unit_id)
}

fn dirty_prefix(course_id: &str, kind: UnitKind) -> String {
    format!("{}{}:", course_prefix(course_id), kind.as_str())
}

fn dirty_key(course_id: &str, kind: UnitKind, unit_id: &str) -> String {
    format!("{}{}", dirty_prefix(course_id, kind), unit_id)
}

fn transaction_error(err: TransactionError<StorageError>) -> StorageError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StorageError::Database(e),
    }
}

pub struct UnitCache {
    db: Db,
    blocks: Tree,
    lessons: Tree,
    dirty: Tree,
}

impl UnitCache {
    /// Open or create the cache database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened unit cache");
        Self::with_db(db)
    }

    /// In-memory cache for tests
    pub fn temporary() -> Result<Self> {
        Self::with_db(sled::Config::new().temporary(true).open()?)
    }

    fn with_db(db: Db) -> Result<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            lessons: db.open_tree("lessons")?,
            dirty: db.open_tree("dirty")?,
            db,
        })
    }

    fn tree(&self, kind: UnitKind) -> &Tree {
        match kind {
            UnitKind::Block => &self.blocks,
            UnitKind::Lesson => &self.lessons,
        }
    }

    fn decode(bytes: &[u8]) -> Result<CacheEntry> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Record a local edit. Always marks the unit dirty.
    ///
    /// Returns once the write is flushed to disk; never touches the network.
    pub fn save_unit(&self, course_id: &str, payload: UnitPayload) -> Result<CacheEntry> {
        let entry = self
            .write(course_id, payload, true)?
            .ok_or_else(|| StorageError::Index("dirty write was skipped".into()))?;
        self.db.flush()?;
        debug!(course_id = %course_id, unit_id = %entry.unit_id(), revision = entry.revision, "Saved unit");
        Ok(entry)
    }

    /// Store a unit as already persisted remotely.
    ///
    /// Skipped (returns `None`) when a dirty local edit of the unit exists.
    pub fn put_clean(&self, course_id: &str, payload: UnitPayload) -> Result<Option<CacheEntry>> {
        self.write(course_id, payload, false)
    }

    /// Write an entry and its dirty marker together. A clean write never
    /// replaces a dirty unit.
    fn write(&self, course_id: &str, payload: UnitPayload, dirty: bool) -> Result<Option<CacheEntry>> {
        let kind = payload.kind();
        let key = unit_key(course_id, payload.unit_id());
        let marker = dirty_key(course_id, kind, payload.unit_id());
        let entry = CacheEntry {
            key: key.clone(),
            course_id: course_id.to_string(),
            payload,
            last_modified: Utc::now(),
            dirty,
            revision: self.db.generate_id()?,
        };
        let encoded = rmp_serde::to_vec_named(&entry)?;

        let written = (self.tree(kind), &self.dirty)
            .transaction(|(units, dirty_index)| {
                if dirty {
                    dirty_index.insert(marker.as_bytes(), key.as_bytes())?;
                } else if dirty_index.get(marker.as_bytes())?.is_some() {
                    return Ok(false);
                }
                units.insert(key.as_bytes(), encoded.as_slice())?;
                Ok::<_, ConflictableTransactionError<StorageError>>(true)
            })
            .map_err(transaction_error)?;

        Ok(written.then_some(entry))
    }

    pub fn get_entry(&self, course_id: &str, kind: UnitKind, unit_id: &str) -> Result<Option<CacheEntry>> {
        match self.tree(kind).get(unit_key(course_id, unit_id).as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_unit(&self, course_id: &str, kind: UnitKind, unit_id: &str) -> Result<Option<UnitPayload>> {
        Ok(self.get_entry(course_id, kind, unit_id)?.map(|entry| entry.payload))
    }

    /// Snapshot of every dirty unit of a course, lessons first
    pub fn get_dirty_units(&self, course_id: &str) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for kind in [UnitKind::Lesson, UnitKind::Block] {
            let prefix = dirty_prefix(course_id, kind);
            for item in self.dirty.scan_prefix(prefix.as_bytes()) {
                let (_, key) = item?;
                if let Some(bytes) = self.tree(kind).get(&key)? {
                    let entry = Self::decode(&bytes)?;
                    if entry.course_id == course_id && entry.dirty {
                        entries.push(entry);
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Every cached unit of a course, dirty or not
    pub fn course_units(&self, course_id: &str) -> Result<Vec<CacheEntry>> {
        let prefix = course_prefix(course_id);
        let mut entries = Vec::new();
        for tree in [&self.lessons, &self.blocks] {
            for item in tree.scan_prefix(prefix.as_bytes()) {
                let (_, bytes) = item?;
                let entry = Self::decode(&bytes)?;
                if entry.course_id == course_id {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Clear the dirty flag of units whose revision is still the synced one.
    ///
    /// A unit rewritten after the snapshot was taken has a newer revision and
    /// stays dirty. Returns how many units were cleared.
    pub fn mark_synced(&self, course_id: &str, units: &[SyncedUnit]) -> Result<usize> {
        let mut cleared = 0;
        for unit in units {
            let key = unit_key(course_id, &unit.unit_id);
            let marker = dirty_key(course_id, unit.kind, &unit.unit_id);

            let was_cleared = (self.tree(unit.kind), &self.dirty)
                .transaction(|(entries, dirty_index)| {
                    let Some(bytes) = entries.get(key.as_bytes())? else {
                        return Ok(false);
                    };
                    let mut entry = Self::decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                    if entry.revision != unit.revision || !entry.dirty {
                        return Ok(false);
                    }
                    entry.dirty = false;
                    let encoded = rmp_serde::to_vec_named(&entry)
                        .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
                    entries.insert(key.as_bytes(), encoded)?;
                    dirty_index.remove(marker.as_bytes())?;
                    Ok(true)
                })
                .map_err(transaction_error)?;

            if was_cleared {
                cleared += 1;
            } else {
                debug!(course_id = %course_id, unit_id = %unit.unit_id, "Unit changed during sync, left dirty");
            }
        }
        self.db.flush()?;
        Ok(cleared)
    }

    /// Drop every block and lesson of a course. Returns how many units went.
    pub fn clear_course(&self, course_id: &str) -> Result<usize> {
        let entries = self.course_units(course_id)?;
        for entry in &entries {
            let kind = entry.kind();
            (self.tree(kind), &self.dirty)
                .transaction(|(units, dirty_index)| {
                    units.remove(entry.key.as_bytes())?;
                    dirty_index.remove(dirty_key(course_id, kind, entry.unit_id()).as_bytes())?;
                    Ok::<_, ConflictableTransactionError<StorageError>>(())
                })
                .map_err(transaction_error)?;
        }
        self.db.flush()?;
        info!(course_id = %course_id, units = entries.len(), "Cleared course cache");
        Ok(entries.len())
    }
}
