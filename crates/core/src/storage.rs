//! Backup-side filesystem operations.
//!
//! The engine only touches the backup tree through [`StorageBackend`], so a
//! different target only needs another implementation of the trait.

use crate::{MirrorError, Result};
use filetime::FileTime;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    AlreadyAbsent,
    /// Directory still has entries; nothing was removed.
    NotEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

pub trait StorageBackend {
    /// Create `path` and any missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<DirOutcome>;

    /// Copy content and timestamps from `from` to `to`, replacing `to`.
    /// Either the whole copy lands or `to` is left as it was.
    fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<RemoveOutcome>;

    fn remove_dir_if_empty(&self, path: &Path) -> Result<RemoveOutcome>;

    /// Immediate children of a directory; empty when it does not exist.
    fn list_dir(&self, path: &Path) -> Result<Vec<BackupEntry>>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;
}

/// Backend writing to a locally mounted filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDisk;

impl LocalDisk {
    pub fn new() -> Self {
        Self
    }
}

fn has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

impl StorageBackend for LocalDisk {
    fn create_dir_all(&self, path: &Path) -> Result<DirOutcome> {
        if path.is_dir() {
            return Ok(DirOutcome::AlreadyExists);
        }

        fs::create_dir_all(path).map_err(|e| MirrorError::file_op(path, e))?;
        Ok(DirOutcome::Created)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        let parent = to.parent().ok_or_else(|| {
            MirrorError::file_op(to, io::Error::new(ErrorKind::InvalidInput, "no parent directory"))
        })?;
        fs::create_dir_all(parent).map_err(|e| MirrorError::file_op(parent, e))?;

        let metadata = fs::metadata(from).map_err(|e| MirrorError::file_op(from, e))?;
        let mut source = fs::File::open(from).map_err(|e| MirrorError::file_op(from, e))?;

        // Stage next to the destination so the final rename stays on one filesystem.
        let mut staged = NamedTempFile::new_in(parent).map_err(|e| MirrorError::file_op(parent, e))?;
        io::copy(&mut source, staged.as_file_mut()).map_err(|e| MirrorError::file_op(from, e))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| MirrorError::file_op(staged.path(), e))?;
        filetime::set_file_times(
            staged.path(),
            FileTime::from_last_access_time(&metadata),
            FileTime::from_last_modification_time(&metadata),
        )
        .map_err(|e| MirrorError::file_op(staged.path(), e))?;
        fs::set_permissions(staged.path(), metadata.permissions())
            .map_err(|e| MirrorError::file_op(staged.path(), e))?;

        staged
            .persist(to)
            .map_err(|e| MirrorError::file_op(to, e.error))?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<RemoveOutcome> {
        match fs::remove_file(path) {
            Ok(()) => Ok(RemoveOutcome::Removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RemoveOutcome::AlreadyAbsent),
            Err(e) => Err(MirrorError::file_op(path, e)),
        }
    }

    fn remove_dir_if_empty(&self, path: &Path) -> Result<RemoveOutcome> {
        match fs::remove_dir(path) {
            Ok(()) => Ok(RemoveOutcome::Removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RemoveOutcome::AlreadyAbsent),
            Err(_) if has_entries(path) => Ok(RemoveOutcome::NotEmpty),
            Err(e) => Err(MirrorError::file_op(path, e)),
        }
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<BackupEntry>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MirrorError::file_op(path, e)),
        };

        let mut listing = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MirrorError::file_op(path, e))?;
            let file_type = entry.file_type().map_err(|e| MirrorError::file_op(entry.path(), e))?;
            listing.push(BackupEntry {
                path: entry.path(),
                is_dir: file_type.is_dir(),
            });
        }

        listing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_create_dir_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b");
        let disk = LocalDisk::new();

        assert_eq!(disk.create_dir_all(&target).unwrap(), DirOutcome::Created);
        assert_eq!(disk.create_dir_all(&target).unwrap(), DirOutcome::AlreadyExists);
        assert!(target.is_dir());
    }

    #[test]
    fn test_copy_preserves_content_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("source.txt");
        let to = dir.path().join("mirror").join("deep").join("source.txt");
        fs::write(&from, "payload").unwrap();

        let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(86_400));
        filetime::set_file_mtime(&from, old).unwrap();

        LocalDisk::new().copy_file(&from, &to).unwrap();

        assert_eq!(fs::read_to_string(&to).unwrap(), "payload");
        let copied = FileTime::from_last_modification_time(&fs::metadata(&to).unwrap());
        assert_eq!(copied.unix_seconds(), old.unix_seconds());
    }

    #[test]
    fn test_copy_overwrites_destination() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("new.txt");
        let to = dir.path().join("old.txt");
        fs::write(&from, "new").unwrap();
        fs::write(&to, "old contents").unwrap();

        LocalDisk::new().copy_file(&from, &to).unwrap();
        assert_eq!(fs::read_to_string(&to).unwrap(), "new");
        // only the destination remains; the staged temp file was renamed away
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_failed_copy_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("kept.txt");
        fs::write(&to, "original").unwrap();

        let result = LocalDisk::new().copy_file(&dir.path().join("missing"), &to);
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&to).unwrap(), "original");
    }

    #[test]
    fn test_remove_file_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        fs::write(&path, "x").unwrap();

        let disk = LocalDisk::new();
        assert_eq!(disk.remove_file(&path).unwrap(), RemoveOutcome::Removed);
        assert_eq!(disk.remove_file(&path).unwrap(), RemoveOutcome::AlreadyAbsent);
    }

    #[test]
    fn test_remove_dir_only_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("full");
        fs::create_dir(&full).unwrap();
        fs::write(full.join("f"), "x").unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();

        let disk = LocalDisk::new();
        assert_eq!(disk.remove_dir_if_empty(&full).unwrap(), RemoveOutcome::NotEmpty);
        assert!(full.is_dir());
        assert_eq!(disk.remove_dir_if_empty(&empty).unwrap(), RemoveOutcome::Removed);
        assert_eq!(disk.remove_dir_if_empty(&empty).unwrap(), RemoveOutcome::AlreadyAbsent);
    }

    #[test]
    fn test_list_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let disk = LocalDisk::new();
        let listing = disk.list_dir(dir.path()).unwrap();
        assert_eq!(
            listing,
            vec![
                BackupEntry { path: dir.path().join("a.txt"), is_dir: false },
                BackupEntry { path: dir.path().join("sub"), is_dir: true },
            ]
        );
        assert!(disk.list_dir(&dir.path().join("missing")).unwrap().is_empty());
        assert!(disk.is_dir(&dir.path().join("sub")));
        assert!(!disk.is_dir(&dir.path().join("a.txt")));
        assert!(disk.exists(&dir.path().join("a.txt")));
    }
}
