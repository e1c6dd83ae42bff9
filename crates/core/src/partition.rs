//! Grouping of monitored folders by filesystem root.
//!
//! Each partition carries the common ancestor used to turn a source path into
//! its mirror path. Partitions never share an ancestor, so folders on
//! different drives cannot end up under a false common parent.

use crate::{MirrorError, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    root: PathBuf,
    ancestor: PathBuf,
    folders: Vec<PathBuf>,
}

impl Partition {
    /// Filesystem root shared by every folder (`/`, `C:\`, ...).
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ancestor(&self) -> &Path {
        &self.ancestor
    }

    /// Canonical monitored folders in configuration order.
    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }

    /// Folders that are not nested inside another folder of this partition.
    /// Walking only these visits every file exactly once.
    pub fn walk_roots(&self) -> Vec<&Path> {
        self.folders
            .iter()
            .filter(|folder| {
                !self
                    .folders
                    .iter()
                    .any(|other| other != *folder && folder.starts_with(other))
            })
            .map(PathBuf::as_path)
            .collect()
    }

    /// Whether `path` lies inside one of the monitored folders.
    pub fn contains(&self, path: &Path) -> bool {
        self.folders.iter().any(|folder| path.starts_with(folder))
    }

    /// `backup_root / (source relative to the ancestor)`.
    pub fn mirror_path(&self, source: &Path, backup_root: &Path) -> Option<PathBuf> {
        source
            .strip_prefix(&self.ancestor)
            .ok()
            .map(|relative| backup_root.join(relative))
    }
}

/// Canonicalise `folders` and split them into one partition per root.
pub fn partition_folders<P: AsRef<Path>>(folders: &[P]) -> Result<Vec<Partition>> {
    partition_folders_with(folders, root_of)
}

/// Like [`partition_folders`], with a caller-supplied root identifier.
pub(crate) fn partition_folders_with<P, F>(folders: &[P], root_of: F) -> Result<Vec<Partition>>
where
    P: AsRef<Path>,
    F: Fn(&Path) -> PathBuf,
{
    if folders.is_empty() {
        return Err(MirrorError::Config("No folders configured for backup".to_string()));
    }

    let mut canonical = Vec::with_capacity(folders.len());
    for folder in folders {
        let folder = folder.as_ref();
        let resolved = dunce::canonicalize(folder).map_err(|e| {
            MirrorError::Config(format!("Folder {} is not accessible: {}", folder.display(), e))
        })?;

        if !resolved.is_dir() {
            return Err(MirrorError::Config(format!(
                "Folder {} is not a directory",
                folder.display()
            )));
        }

        canonical.push(resolved);
    }

    Ok(group_by_root(canonical, root_of))
}

pub(crate) fn group_by_root<F>(folders: Vec<PathBuf>, root_of: F) -> Vec<Partition>
where
    F: Fn(&Path) -> PathBuf,
{
    let mut groups: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();

    for folder in folders {
        let group = groups.entry(root_of(&folder)).or_default();
        if !group.contains(&folder) {
            group.push(folder);
        }
    }

    groups
        .into_iter()
        .map(|(root, folders)| {
            let ancestor = common_ancestor(&folders);
            debug!(
                "Partition {}: {} folder(s), ancestor {}",
                root.display(),
                folders.len(),
                ancestor.display()
            );
            Partition {
                root,
                ancestor,
                folders,
            }
        })
        .collect()
}

/// Leading prefix and root-directory components of an absolute path.
pub(crate) fn root_of(path: &Path) -> PathBuf {
    path.components()
        .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        .collect()
}

/// Deepest common prefix of every folder's parent. For one folder this is its
/// parent, so the folder keeps its own name under the backup root.
fn common_ancestor(folders: &[PathBuf]) -> PathBuf {
    let mut parents = folders
        .iter()
        .map(|folder| folder.parent().unwrap_or(folder).to_path_buf());

    let Some(first) = parents.next() else {
        return PathBuf::new();
    };

    parents.fold(first, |acc, parent| {
        acc.components()
            .zip(parent.components())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    /// Treat the first directory under `/` as the drive.
    fn fake_drive(path: &Path) -> PathBuf {
        path.components().take(2).collect()
    }

    #[rstest]
    #[case(&["/data/photos"], "/data")]
    #[case(&["/data/photos", "/data/docs"], "/data")]
    #[case(&["/data/a/x", "/data/a/y", "/data/a/z/deep"], "/data/a")]
    #[case(&["/data/a", "/data/a/nested"], "/data")]
    #[case(&["/data/ab", "/data/abc"], "/data")]
    #[case(&["/home/u/docs", "/srv/shared"], "/")]
    fn test_common_ancestor(#[case] folders: &[&str], #[case] expected: &str) {
        assert_eq!(common_ancestor(&paths(folders)), PathBuf::from(expected));
    }

    #[test]
    fn test_root_folder_is_its_own_ancestor() {
        assert_eq!(common_ancestor(&paths(&["/"])), PathBuf::from("/"));
    }

    #[test]
    fn test_mirror_path_keeps_folder_name() {
        let partitions = group_by_root(paths(&["/data/src"]), root_of);
        assert_eq!(partitions.len(), 1);

        let mirror = partitions[0]
            .mirror_path(Path::new("/data/src/folder1/file.txt"), Path::new("/backup"))
            .unwrap();
        assert_eq!(mirror, PathBuf::from("/backup/src/folder1/file.txt"));
        assert_eq!(
            partitions[0].mirror_path(Path::new("/elsewhere/file"), Path::new("/backup")),
            None
        );
    }

    #[test]
    fn test_distinct_roots_are_isolated() {
        let partitions = group_by_root(
            paths(&["/c/Users/me/docs", "/d/photos/2024", "/c/Users/me/music"]),
            fake_drive,
        );

        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].root(), Path::new("/c"));
        assert_eq!(partitions[0].ancestor(), Path::new("/c/Users/me"));
        assert_eq!(
            partitions[0].folders(),
            &paths(&["/c/Users/me/docs", "/c/Users/me/music"])[..]
        );
        assert_eq!(partitions[1].root(), Path::new("/d"));
        assert_eq!(partitions[1].ancestor(), Path::new("/d/photos"));

        let backup = Path::new("/backup");
        assert_eq!(
            partitions[1].mirror_path(Path::new("/d/photos/2024/img.jpg"), backup),
            Some(PathBuf::from("/backup/2024/img.jpg"))
        );
        assert_eq!(
            partitions[0].mirror_path(Path::new("/c/Users/me/docs/cv.pdf"), backup),
            Some(PathBuf::from("/backup/docs/cv.pdf"))
        );
        assert!(!partitions[0].contains(Path::new("/d/photos/2024/img.jpg")));
    }

    #[test]
    fn test_duplicates_collapse_and_nested_folders_are_not_walked() {
        let partitions = group_by_root(
            paths(&["/data/a", "/data/a/inner", "/data/a", "/data/b"]),
            root_of,
        );

        assert_eq!(partitions.len(), 1);
        let partition = &partitions[0];
        assert_eq!(partition.folders().len(), 3);
        assert_eq!(
            partition.walk_roots(),
            vec![Path::new("/data/a"), Path::new("/data/b")]
        );
        assert!(partition.contains(Path::new("/data/a/inner/file")));
    }

    #[test]
    fn test_partition_folders_rejects_empty_list() {
        let folders: Vec<PathBuf> = Vec::new();
        assert!(matches!(partition_folders(&folders), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_partition_folders_rejects_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(partition_folders(&[missing]), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_partition_folders_rejects_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(partition_folders(&[file]), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_partition_folders_canonicalises() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        let dotted = dir.path().join("src").join("..").join("src");

        let partitions = partition_folders(&[dotted]).unwrap();
        let canonical = dunce::canonicalize(&src).unwrap();
        assert_eq!(partitions[0].folders(), &[canonical.clone()][..]);
        assert_eq!(partitions[0].ancestor(), canonical.parent().unwrap());
    }
}
