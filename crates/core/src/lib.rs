//! # mirrorsync-core
//!
//! Mirrors a set of monitored folders into a backup tree that keeps their
//! relative layout. A small SQLite store remembers what was copied last time,
//! so each run only copies new or changed files, removes backups of deleted
//! files, and prunes backup directories that no longer exist in the source.
//!
//! ```rust,no_run
//! use mirrorsync_core::{LocalDisk, ReconcileEngine, StateStore, TracingSink};
//! use std::sync::Arc;
//!
//! # fn main() -> mirrorsync_core::Result<()> {
//! let store = StateStore::open("db.sqlite3")?;
//! let mut engine = ReconcileEngine::new(store, LocalDisk::new(), "/mnt/backup", Arc::new(TracingSink));
//! let report = engine.run(&["/home/me/Documents", "/home/me/Pictures"])?;
//! println!("{} change(s)", report.writes());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod partition;
pub mod report;
pub mod scanner;
pub mod storage;
pub mod store;

pub use config::{LogLevel, MirrorConfig};
pub use engine::ReconcileEngine;
pub use error::{MirrorError, Result};
pub use hasher::{ContentHash, Fingerprinter};
pub use logging::{init_logging, EventSink, MemorySink, RotatingFile, TracingSink};
pub use partition::{partition_folders, Partition};
pub use report::{PartitionReport, SyncReport, SyncStats};
pub use storage::{BackupEntry, DirOutcome, LocalDisk, RemoveOutcome, StorageBackend};
pub use store::{FileRecord, StateStore};
