//! Reconciliation of the backup tree against the monitored folders.
//!
//! Each partition goes through three passes in order: mirror directories,
//! diff files against the stored records, then drop records whose source is
//! gone. Store changes for a partition are committed together. Once every
//! partition is committed, backup directories that no longer correspond to a
//! source directory of any partition are pruned.

use crate::hasher::{ContentHash, Fingerprinter};
use crate::logging::EventSink;
use crate::partition::{self, partition_folders_with, Partition};
use crate::report::{PartitionReport, SyncReport, SyncStats};
use crate::scanner::{scan_partition, TreeSnapshot};
use crate::storage::{DirOutcome, RemoveOutcome, StorageBackend};
use crate::store::{FileRecord, StateStore, StoreBatch};
use crate::{MirrorError, Result};
use chrono::{DateTime, Local};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type RootResolver = Box<dyn Fn(&Path) -> PathBuf + Send + Sync>;

pub struct ReconcileEngine<B: StorageBackend> {
    store: StateStore,
    backend: B,
    fingerprinter: Fingerprinter,
    sink: Arc<dyn EventSink>,
    backup_root: PathBuf,
    root_of: RootResolver,
}

impl<B: StorageBackend> ReconcileEngine<B> {
    pub fn new(
        store: StateStore,
        backend: B,
        backup_root: impl Into<PathBuf>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            backend,
            fingerprinter: Fingerprinter::new(),
            sink,
            backup_root: backup_root.into(),
            root_of: Box::new(partition::root_of),
        }
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    /// Replace how a folder's filesystem root is identified. Folders with
    /// different roots land in different partitions.
    pub fn with_root_resolver(
        mut self,
        root_of: impl Fn(&Path) -> PathBuf + Send + Sync + 'static,
    ) -> Self {
        self.root_of = Box::new(root_of);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn into_store(self) -> StateStore {
        self.store
    }

    /// Converge the backup tree onto `folders`. Configuration and store
    /// errors abort the run; per-file failures are logged and counted.
    pub fn run<P: AsRef<Path>>(&mut self, folders: &[P]) -> Result<SyncReport> {
        let partitions = partition_folders_with(folders, &*self.root_of)?;
        let backup_root = self.prepare_backup_root(&partitions)?;

        let mut report = SyncReport::default();
        let mut valid_dirs = HashSet::new();

        for partition in &partitions {
            let (stats, partition_dirs) = self.reconcile_partition(partition, &backup_root)?;
            valid_dirs.extend(partition_dirs);
            report.partitions.push(PartitionReport {
                root: partition.root().to_path_buf(),
                ancestor: partition.ancestor().to_path_buf(),
                stats,
            });
        }

        // Mirror subtrees of different roots can coincide.
        for (partition, partition_report) in partitions.iter().zip(report.partitions.iter_mut()) {
            self.prune_partition(partition, &backup_root, &valid_dirs, &mut partition_report.stats);
        }

        report.orphans = self.sweep_orphans(&partitions, &backup_root, &valid_dirs)?;
        Ok(report)
    }

    fn prepare_backup_root(&self, partitions: &[Partition]) -> Result<PathBuf> {
        if self.backup_root.as_os_str().is_empty() {
            return Err(MirrorError::Config("backup_path must not be empty".to_string()));
        }

        let resolved = resolve_path(&self.backup_root).map_err(|e| {
            MirrorError::Config(format!(
                "Backup path {} cannot be resolved: {}",
                self.backup_root.display(),
                e
            ))
        })?;
        check_overlap(&resolved, partitions)?;

        if let DirOutcome::Created = self.backend.create_dir_all(&resolved).map_err(|e| {
            MirrorError::Config(format!(
                "Backup path {} cannot be created: {}",
                self.backup_root.display(),
                e
            ))
        })? {
            self.sink
                .info(&format!("Created directory: {}", resolved.display()));
        }

        let backup_root = dunce::canonicalize(&resolved).map_err(|e| {
            MirrorError::Config(format!(
                "Backup path {} is not accessible: {}",
                self.backup_root.display(),
                e
            ))
        })?;
        check_overlap(&backup_root, partitions)?;

        Ok(backup_root)
    }

    fn reconcile_partition(
        &mut self,
        partition: &Partition,
        backup_root: &Path,
    ) -> Result<(SyncStats, HashSet<PathBuf>)> {
        let snapshot = scan_partition(partition, self.sink.as_ref());

        let records: BTreeMap<PathBuf, FileRecord> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|record| partition.contains(&record.original_path))
            .map(|record| (record.original_path.clone(), record))
            .collect();

        let batch = self.store.batch()?;
        let mut pass = PartitionPass {
            partition,
            backup_root,
            backend: &self.backend,
            fingerprinter: &self.fingerprinter,
            sink: self.sink.as_ref(),
            snapshot: &snapshot,
            valid_dirs: HashSet::new(),
            current_paths: HashSet::new(),
            displaced: HashSet::new(),
            deferred: Vec::new(),
            stats: SyncStats::default(),
        };

        pass.mirror_directories();
        pass.diff_files(&batch, &records)?;
        pass.remove_deleted(&batch, &records)?;
        pass.place_deferred(&batch, &records)?;
        batch.commit()?;

        Ok((pass.stats, pass.valid_dirs))
    }

    /// Remove empty backup directories under the partition's mirror
    /// subtrees that no partition produced this run.
    fn prune_partition(
        &self,
        partition: &Partition,
        backup_root: &Path,
        valid_dirs: &HashSet<PathBuf>,
        stats: &mut SyncStats,
    ) {
        for root in partition.walk_roots() {
            if let Some(mirror_root) = partition.mirror_path(root, backup_root) {
                prune_empty_dirs(
                    &self.backend,
                    self.sink.as_ref(),
                    &mirror_root,
                    false,
                    valid_dirs,
                    stats,
                );
            }
        }
    }

    /// Drop records that no monitored folder covers any more, along with their
    /// backup copies and any directories that become empty.
    fn sweep_orphans(
        &mut self,
        partitions: &[Partition],
        backup_root: &Path,
        valid_dirs: &HashSet<PathBuf>,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        let orphans: Vec<FileRecord> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|record| !partitions.iter().any(|p| p.contains(&record.original_path)))
            .collect();

        if orphans.is_empty() {
            return Ok(stats);
        }

        let batch = self.store.batch()?;
        for record in &orphans {
            if !remove_backup(&self.backend, self.sink.as_ref(), &record.backup_path, &mut stats) {
                continue;
            }
            batch.delete(&record.original_path)?;
            stats.records_purged += 1;
            self.sink.info(&format!(
                "Removed backup of unmonitored file: {}",
                record.original_path.display()
            ));

            let mut dir = record.backup_path.parent();
            while let Some(current) = dir {
                if current == backup_root
                    || !current.starts_with(backup_root)
                    || valid_dirs.contains(current)
                {
                    break;
                }
                match self.backend.remove_dir_if_empty(current) {
                    Ok(RemoveOutcome::Removed) => {
                        stats.dirs_pruned += 1;
                        self.sink
                            .info(&format!("Removed empty directory: {}", current.display()));
                    }
                    Ok(RemoveOutcome::AlreadyAbsent) => {}
                    Ok(RemoveOutcome::NotEmpty) | Err(_) => break,
                }
                dir = current.parent();
            }
        }
        batch.commit()?;

        Ok(stats)
    }
}

/// Working state for one partition's reconciliation.
struct PartitionPass<'a, B: StorageBackend> {
    partition: &'a Partition,
    backup_root: &'a Path,
    backend: &'a B,
    fingerprinter: &'a Fingerprinter,
    sink: &'a dyn EventSink,
    snapshot: &'a TreeSnapshot,
    valid_dirs: HashSet<PathBuf>,
    current_paths: HashSet<PathBuf>,
    /// Backup files removed to make room for a directory of the same name.
    displaced: HashSet<PathBuf>,
    /// Sources whose mirror path is still occupied by a stale directory.
    deferred: Vec<(PathBuf, ContentHash)>,
    stats: SyncStats,
}

impl<'a, B: StorageBackend> PartitionPass<'a, B> {
    fn mirror_directories(&mut self) {
        let snapshot = self.snapshot;
        for dir in &snapshot.dirs {
            let Some(mirror) = self.partition.mirror_path(dir, self.backup_root) else {
                continue;
            };

            if self.backend.exists(&mirror) && !self.backend.is_dir(&mirror) {
                self.clear_file_in_the_way(&mirror);
            }

            match self.backend.create_dir_all(&mirror) {
                Ok(DirOutcome::Created) => {
                    self.stats.dirs_created += 1;
                    self.sink
                        .info(&format!("Created directory: {}", mirror.display()));
                }
                Ok(DirOutcome::AlreadyExists) => {}
                Err(e) => {
                    self.sink
                        .error(&format!("Failed to create directory {}: {}", mirror.display(), e));
                }
            }

            self.valid_dirs.insert(mirror);
        }
    }

    /// A source file became a directory: its old backup copy occupies the
    /// mirror path.
    fn clear_file_in_the_way(&mut self, mirror: &Path) {
        match self.backend.remove_file(mirror) {
            Ok(_) => {
                self.sink.info(&format!(
                    "Removed backup file replaced by a directory: {}",
                    mirror.display()
                ));
                self.displaced.insert(mirror.to_path_buf());
            }
            Err(e) => {
                self.sink
                    .error(&format!("Failed to clear {} for a directory: {}", mirror.display(), e));
            }
        }
    }

    fn diff_files(
        &mut self,
        batch: &StoreBatch<'_>,
        records: &BTreeMap<PathBuf, FileRecord>,
    ) -> Result<()> {
        let snapshot = self.snapshot;
        for path in &snapshot.files {
            if !self.current_paths.insert(path.clone()) {
                continue;
            }

            let hash = match self.fingerprinter.fingerprint(path) {
                Ok(hash) => hash,
                Err(e) => {
                    self.fail(path, &e);
                    continue;
                }
            };

            match records.get(path) {
                None => self.copy_and_record(batch, path, hash, None)?,
                Some(record) if record.content_hash != hash => {
                    self.copy_and_record(batch, path, hash, Some(record))?
                }
                Some(record) => self.check_unchanged(path, record),
            }
        }

        Ok(())
    }

    fn check_unchanged(&mut self, path: &Path, record: &FileRecord) {
        if self.backend.exists(&record.backup_path) {
            self.stats.files_unchanged += 1;
            self.sink.debug(&format!("Unchanged: {}", path.display()));
            return;
        }

        match self.backend.copy_file(path, &record.backup_path) {
            Ok(()) => {
                self.stats.files_restored += 1;
                self.sink.info(&format!(
                    "Restored missing backup: {} -> {}",
                    path.display(),
                    record.backup_path.display()
                ));
            }
            Err(e) => self.fail(path, &e),
        }
    }

    fn copy_and_record(
        &mut self,
        batch: &StoreBatch<'_>,
        source: &Path,
        hash: ContentHash,
        previous: Option<&FileRecord>,
    ) -> Result<()> {
        let Some(mirror) = self.partition.mirror_path(source, self.backup_root) else {
            return Ok(());
        };

        if self.backend.is_dir(&mirror) {
            self.deferred.push((source.to_path_buf(), hash));
            return Ok(());
        }

        let modified_time = match modified_time(source) {
            Ok(modified_time) => modified_time,
            Err(e) => {
                self.fail(source, &e);
                return Ok(());
            }
        };

        if let Err(e) = self.backend.copy_file(source, &mirror) {
            self.fail(source, &e);
            return Ok(());
        }

        batch.upsert(&FileRecord::new(source, &mirror, modified_time, hash))?;

        match previous {
            None => {
                self.stats.files_copied += 1;
                self.sink.info(&format!(
                    "Backed up file: {} -> {}",
                    source.display(),
                    mirror.display()
                ));
            }
            Some(previous) => {
                self.stats.files_updated += 1;
                self.sink.info(&format!(
                    "Updated file: {} -> {}",
                    source.display(),
                    mirror.display()
                ));
                if previous.backup_path != mirror {
                    remove_backup(self.backend, self.sink, &previous.backup_path, &mut self.stats);
                }
            }
        }

        Ok(())
    }

    fn remove_deleted(
        &mut self,
        batch: &StoreBatch<'_>,
        records: &BTreeMap<PathBuf, FileRecord>,
    ) -> Result<()> {
        for (path, record) in records {
            if self.current_paths.contains(path) || self.snapshot.is_unreadable(path) {
                continue;
            }

            let cleared = self.displaced.contains(&record.backup_path)
                || remove_backup(self.backend, self.sink, &record.backup_path, &mut self.stats);
            if !cleared {
                continue;
            }

            batch.delete(path)?;
            self.stats.backups_removed += 1;
            self.sink.info(&format!(
                "Removed backup: {} (source {} is gone)",
                record.backup_path.display(),
                path.display()
            ));
        }

        Ok(())
    }

    /// A source directory became a file. Once the deletion pass has emptied
    /// the stale mirror directory it is removed and the file copied in.
    fn place_deferred(
        &mut self,
        batch: &StoreBatch<'_>,
        records: &BTreeMap<PathBuf, FileRecord>,
    ) -> Result<()> {
        for (source, hash) in std::mem::take(&mut self.deferred) {
            let Some(mirror) = self.partition.mirror_path(&source, self.backup_root) else {
                continue;
            };

            prune_empty_dirs(
                self.backend,
                self.sink,
                &mirror,
                true,
                &self.valid_dirs,
                &mut self.stats,
            );

            if self.backend.is_dir(&mirror) {
                let err = MirrorError::file_op(
                    &mirror,
                    io::Error::new(ErrorKind::AlreadyExists, "backup path is a non-empty directory"),
                );
                self.fail(&source, &err);
                continue;
            }

            self.copy_and_record(batch, &source, hash, records.get(&source))?;
        }

        Ok(())
    }

    fn fail(&mut self, path: &Path, error: &MirrorError) {
        self.stats.files_failed += 1;
        self.sink
            .error(&format!("Failed to back up {}: {}", path.display(), error));
    }
}

/// Remove empty directories below `top`, deepest first, until a full pass
/// removes nothing. `top` itself is a candidate only when `include_top` is
/// set. Directories in `keep` are never removed.
fn prune_empty_dirs<B: StorageBackend>(
    backend: &B,
    sink: &dyn EventSink,
    top: &Path,
    include_top: bool,
    keep: &HashSet<PathBuf>,
    stats: &mut SyncStats,
) {
    loop {
        let mut dirs = Vec::new();
        collect_dirs(backend, sink, top, &mut dirs);
        if include_top && backend.is_dir(top) {
            dirs.push(top.to_path_buf());
        }
        dirs.sort_by_key(|dir| Reverse(dir.components().count()));

        let mut removed = 0;
        for dir in &dirs {
            if keep.contains(dir) {
                continue;
            }
            match backend.remove_dir_if_empty(dir) {
                Ok(RemoveOutcome::Removed) => {
                    removed += 1;
                    stats.dirs_pruned += 1;
                    sink.info(&format!("Removed empty directory: {}", dir.display()));
                }
                Ok(RemoveOutcome::NotEmpty) | Ok(RemoveOutcome::AlreadyAbsent) => {}
                Err(e) => {
                    sink.warning(&format!("Failed to remove directory {}: {}", dir.display(), e));
                }
            }
        }

        if removed == 0 {
            break;
        }
    }
}

fn collect_dirs<B: StorageBackend>(
    backend: &B,
    sink: &dyn EventSink,
    dir: &Path,
    out: &mut Vec<PathBuf>,
) {
    let entries = match backend.list_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            sink.warning(&format!("Failed to list {}: {}", dir.display(), e));
            return;
        }
    };

    for entry in entries.into_iter().filter(|entry| entry.is_dir) {
        collect_dirs(backend, sink, &entry.path, out);
        out.push(entry.path);
    }
}

/// Delete one backup copy. A copy that is already gone counts as removed.
/// Returns false only on a genuine I/O failure, in which case the caller
/// keeps the record so the next run retries.
fn remove_backup<B: StorageBackend>(
    backend: &B,
    sink: &dyn EventSink,
    path: &Path,
    stats: &mut SyncStats,
) -> bool {
    match backend.remove_file(path) {
        Ok(RemoveOutcome::Removed) | Ok(RemoveOutcome::NotEmpty) => true,
        Ok(RemoveOutcome::AlreadyAbsent) => {
            stats.missing_backups += 1;
            sink.warning(&format!("Backup file already missing: {}", path.display()));
            true
        }
        Err(e) => {
            stats.files_failed += 1;
            sink.error(&format!("Failed to remove backup {}: {}", path.display(), e));
            false
        }
    }
}

fn check_overlap(backup_root: &Path, partitions: &[Partition]) -> Result<()> {
    for folder in partitions.iter().flat_map(|p| p.folders()) {
        if backup_root.starts_with(folder) || folder.starts_with(backup_root) {
            return Err(MirrorError::Config(format!(
                "Backup path {} overlaps monitored folder {}",
                backup_root.display(),
                folder.display()
            )));
        }
    }
    Ok(())
}

/// Absolute form of `path` without creating anything: the deepest existing
/// ancestor is canonicalised and the missing tail appended.
fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };

    let mut missing: Vec<OsString> = Vec::new();
    let mut existing = absolute.as_path();
    loop {
        match dunce::canonicalize(existing) {
            Ok(mut resolved) => {
                resolved.extend(missing.iter().rev());
                return Ok(resolved);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(e);
                };
                missing.push(name.to_os_string());
                existing = parent;
            }
            Err(e) => return Err(e),
        }
    }
}

fn modified_time(path: &Path) -> Result<String> {
    let modified = fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|e| MirrorError::file_op(path, e))?;
    Ok(DateTime::<Local>::from(modified).to_rfc3339())
}
