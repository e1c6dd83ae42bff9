use serde::Serialize;
use std::path::PathBuf;

/// Counters for one reconciliation step.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub dirs_created: usize,
    pub files_copied: usize,
    pub files_updated: usize,
    pub files_restored: usize,
    pub files_unchanged: usize,
    pub backups_removed: usize,
    pub missing_backups: usize,
    pub dirs_pruned: usize,
    pub files_failed: usize,
    pub records_purged: usize,
}

impl SyncStats {
    /// Operations that changed the backup tree or the state store.
    pub fn writes(&self) -> usize {
        self.dirs_created
            + self.files_copied
            + self.files_updated
            + self.files_restored
            + self.backups_removed
            + self.dirs_pruned
            + self.records_purged
    }

    pub fn absorb(&mut self, other: &SyncStats) {
        self.dirs_created += other.dirs_created;
        self.files_copied += other.files_copied;
        self.files_updated += other.files_updated;
        self.files_restored += other.files_restored;
        self.files_unchanged += other.files_unchanged;
        self.backups_removed += other.backups_removed;
        self.missing_backups += other.missing_backups;
        self.dirs_pruned += other.dirs_pruned;
        self.files_failed += other.files_failed;
        self.records_purged += other.records_purged;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub root: PathBuf,
    pub ancestor: PathBuf,
    pub stats: SyncStats,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub partitions: Vec<PartitionReport>,
    /// Records whose source lies under no monitored folder any more.
    pub orphans: SyncStats,
}

impl SyncReport {
    pub fn totals(&self) -> SyncStats {
        let mut totals = self.orphans.clone();
        for partition in &self.partitions {
            totals.absorb(&partition.stats);
        }
        totals
    }

    pub fn writes(&self) -> usize {
        self.totals().writes()
    }

    pub fn is_clean(&self) -> bool {
        self.totals().files_failed == 0
    }
}
