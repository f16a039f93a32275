//! Courseware Storage - offline-first storage for course content
//!
//! Editors work against a local unit cache; a sync pass assembles the cached
//! units into one immutable course blob, pushes it down the backend chain and
//! publishes a pointer to it in the metadata index.
//!
//! ## Architecture
//!
//! - **Block codec**: rich editor documents ⇄ flat typed blocks
//! - **Blob store**: telegram → r2 → local filesystem, hash-verified reads
//! - **Metadata index**: per-course record plus current/previous blob pointer
//! - **Unit cache**: per-lesson and per-block records with dirty flags
//! - **Aggregate cache**: stale-while-revalidate for expensive read views
//!
//! ## Data Flow
//!
//! ```text
//! editor ──► SyncEngine::apply_lesson_edit ──► UnitCache (dirty)
//!                                                  │
//!                              SyncEngine::sync_course
//!                                                  ▼
//!            CourseBlob ──► BlobStore::put ──► MetadataIndex::publish_pointer
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! {data_dir}/
//! ├── blobs/                 # Local fallback backend (development only)
//! │   └── {course}/{hash12}-{uuid}.json
//! ├── units.sled/            # Unit cache
//! ├── metadata.sled/         # Metadata index
//! └── config.toml            # Configuration
//! ```

pub mod aggregate_cache;
pub mod blob;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod metadata;
pub mod sync;
pub mod unit_cache;

// Re-exports
pub use aggregate_cache::{AggregateCache, AggregateCacheConfig, CacheStats, Freshness};
pub use blob::{BackendKind, BlobBackend, BlobHandle, BlobStore, PutReceipt};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Block, BlockCodec, BlockType, CourseBlob, Lesson, RichNode};
pub use config::Config;
pub use error::{Result, StorageError};
pub use metadata::{BlobPointer, CourseMeta, MetadataIndex, SledMetadataIndex};
pub use sync::{BlobSource, LoadedCourse, SyncEngine, SyncReport};
pub use unit_cache::{CacheEntry, UnitCache, UnitKind, UnitPayload};
