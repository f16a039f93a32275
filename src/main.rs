//! Courseware Storage operator CLI
//!
//! Inspect, verify and sync courses against the configured backends.
//!
//! ## Usage
//!
//! ```bash
//! # Push unsynced edits of a course
//! courseware-storage sync intro-to-rust
//!
//! # Load a course (remote blob + local edits) and print a summary
//! courseware-storage inspect intro-to-rust
//!
//! # Re-download the current blob and check its hash and lesson blocks
//! courseware-storage verify intro-to-rust
//!
//! # Development mode with a custom data directory
//! courseware-storage --env development --data-dir /tmp/courseware dirty intro-to-rust
//! ```

use clap::{Parser, Subcommand};
use courseware_storage::{
    BlobStore, BlockCodec, Config, MetadataIndex, SledMetadataIndex, SyncEngine, UnitCache,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courseware-storage")]
#[command(about = "Offline-first course content storage")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (sled databases and local blobs)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Deployment environment (production, development)
    #[arg(long = "env", env = "COURSEWARE_ENV")]
    environment: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the course as an editor would see it
    Inspect {
        course_id: String,
    },

    /// Check the published blob against its recorded hash
    Verify {
        course_id: String,
    },

    /// Push dirty units and publish a new blob pointer
    Sync {
        course_id: String,
    },

    /// Seed the local cache from the published blob
    Hydrate {
        course_id: String,
    },

    /// List units with unsynced edits
    Dirty {
        course_id: String,
    },

    /// Drop every cached unit of a course, including unsynced edits
    Clear {
        course_id: String,
    },

    /// Print the metadata record
    Meta {
        course_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("courseware_storage=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env()?;

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(environment) = &args.environment {
        config.environment = environment.parse()?;
    }

    info!(
        data_dir = %config.storage.data_dir.display(),
        environment = ?config.environment,
        telegram = config.telegram.is_some(),
        r2 = config.r2.is_some(),
        "Starting courseware-storage"
    );

    tokio::fs::create_dir_all(&config.storage.data_dir).await?;

    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let blobs = Arc::new(BlobStore::from_config(&config).await?);
    let units = Arc::new(UnitCache::open(config.unit_cache_path())?);
    let index: Arc<dyn MetadataIndex> = Arc::new(SledMetadataIndex::open(config.metadata_db_path())?);
    let engine = SyncEngine::new(units, blobs, index, config.sync.clone());

    match args.command {
        Command::Inspect { course_id } => {
            let loaded = engine.load_course(&course_id).await?;
            println!("course:  {}", course_id);
            println!("source:  {:?}", loaded.source);
            if let Some(pointer) = loaded.meta.as_ref().and_then(|meta| meta.blob_pointer.as_ref()) {
                println!("blob:    {} ({})", pointer.handle, pointer.hash);
            }
            for lesson in loaded.blob.ordered_lessons() {
                println!(
                    "  [{}] {} ({} blocks)",
                    lesson.id,
                    lesson.title,
                    loaded.blob.lesson_blocks(&lesson.id).len()
                );
            }
            if !loaded.regenerated.is_empty() {
                println!("regenerated: {}", loaded.regenerated.join(", "));
            }
        }

        Command::Verify { course_id } => {
            let meta = engine
                .index()
                .get(&course_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("course not found: {}", course_id))?;
            let pointer = meta
                .blob_pointer
                .ok_or_else(|| anyhow::anyhow!("course {} has no published blob", course_id))?;

            let blob = engine.blobs().get(&pointer.handle, &pointer.hash).await?;
            let drifted = BlockCodec::new(&course_id).inconsistent_lessons(&blob);
            println!("{} ok: {} lessons, {} blocks", pointer.handle, blob.lessons.len(), blob.blocks.len());
            if !drifted.is_empty() {
                println!("lessons with drifted blocks: {}", drifted.join(", "));
            }
        }

        Command::Sync { course_id } => {
            let report = engine.sync_with_retry(&course_id).await?;
            match &report.pointer {
                Some(pointer) => println!(
                    "published {} ({}); {} units synced, {} still dirty, {} orphan blocks pruned",
                    pointer.handle, pointer.hash, report.synced_units, report.still_dirty, report.pruned_blocks
                ),
                None => println!("nothing to sync"),
            }
        }

        Command::Hydrate { course_id } => {
            let written = engine.hydrate(&course_id).await?;
            println!("{} units cached", written);
        }

        Command::Dirty { course_id } => {
            let dirty = engine.units().get_dirty_units(&course_id)?;
            for entry in &dirty {
                println!("{:?}\t{}\t{}", entry.kind(), entry.unit_id(), entry.last_modified);
            }
            println!("{} dirty units", dirty.len());
        }

        Command::Clear { course_id } => {
            let removed = engine.units().clear_course(&course_id)?;
            println!("{} units removed", removed);
        }

        Command::Meta { course_id } => match engine.index().get(&course_id).await? {
            Some(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
            None => println!("course not found: {}", course_id),
        },
    }

    Ok(())
}
