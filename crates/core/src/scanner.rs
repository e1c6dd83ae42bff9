use crate::logging::EventSink;
use crate::partition::Partition;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One walk over a partition's folders.
#[derive(Debug, Default, Clone)]
pub struct TreeSnapshot {
    /// Every directory, monitored folders included, parents before children.
    pub dirs: Vec<PathBuf>,
    /// Regular files, plus symlinks that resolve to one. Linked directories
    /// are never descended into.
    pub files: Vec<PathBuf>,
    /// Paths the walk could not read. Records below them must not be treated
    /// as deleted.
    pub unreadable: Vec<PathBuf>,
}

impl TreeSnapshot {
    pub fn is_unreadable(&self, path: &Path) -> bool {
        self.unreadable.iter().any(|bad| path.starts_with(bad))
    }
}

pub fn scan_partition(partition: &Partition, sink: &dyn EventSink) -> TreeSnapshot {
    let mut snapshot = TreeSnapshot::default();

    for root in partition.walk_roots() {
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let bad = e.path().unwrap_or(root).to_path_buf();
                    sink.warning(&format!("Skipping unreadable path {}: {}", bad.display(), e));
                    snapshot.unreadable.push(bad);
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                snapshot.dirs.push(entry.into_path());
            } else if file_type.is_file()
                || (file_type.is_symlink() && links_to_file(entry.path()))
            {
                snapshot.files.push(entry.into_path());
            } else {
                sink.debug(&format!("Skipping non-regular entry: {}", entry.path().display()));
            }
        }
    }

    snapshot
}

fn links_to_file(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}
