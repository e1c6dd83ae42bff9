//! SQLite-backed record of what was mirrored on the last run.

use crate::hasher::ContentHash;
use crate::Result;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        original_path TEXT,
        backup_path TEXT,
        last_modified TEXT,
        file_hash TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_files_original_path ON files (original_path);
";

/// One tracked source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Assigned by the store; `None` until inserted.
    pub id: Option<i64>,
    #[serde(serialize_with = "serialize_path")]
    pub original_path: PathBuf,
    #[serde(serialize_with = "serialize_path")]
    pub backup_path: PathBuf,
    pub modified_time: String,
    #[serde(serialize_with = "serialize_hash")]
    pub content_hash: ContentHash,
}

fn serialize_hash<S: serde::Serializer>(
    hash: &ContentHash,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(hash.as_str())
}

fn serialize_path<P: AsRef<Path>, S: serde::Serializer>(
    path: &P,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&path.as_ref().to_string_lossy())
}

impl FileRecord {
    pub fn new(
        original_path: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
        modified_time: impl Into<String>,
        content_hash: ContentHash,
    ) -> Self {
        Self {
            id: None,
            original_path: original_path.into(),
            backup_path: backup_path.into(),
            modified_time: modified_time.into(),
            content_hash,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            original_path: path_from_column(row, 1)?,
            backup_path: path_from_column(row, 2)?,
            modified_time: row.get(3)?,
            content_hash: ContentHash::from_hex(row.get::<_, String>(4)?),
        })
    }
}

/// Paths are stored as TEXT when they are valid UTF-8 and as a BLOB of the
/// raw OS encoding otherwise, so every path round-trips exactly.
fn path_value(path: &Path) -> Value {
    match path.to_str() {
        Some(text) => Value::Text(text.to_string()),
        None => Value::Blob(os_bytes(path)),
    }
}

fn path_from_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<PathBuf> {
    match row.get_ref(idx)? {
        ValueRef::Text(text) => Ok(PathBuf::from(String::from_utf8_lossy(text).into_owned())),
        ValueRef::Blob(bytes) => Ok(PathBuf::from(os_string_from_bytes(bytes))),
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "path".to_string(),
            other.data_type(),
        )),
    }
}

#[cfg(unix)]
fn os_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn os_string_from_bytes(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes.to_vec())
}

#[cfg(windows)]
fn os_bytes(path: &Path) -> Vec<u8> {
    use std::os::windows::ffi::OsStrExt;
    path.as_os_str()
        .encode_wide()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

#[cfg(windows)]
fn os_string_from_bytes(bytes: &[u8]) -> OsString {
    use std::os::windows::ffi::OsStringExt;
    let wide: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    OsString::from_wide(&wide)
}

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening state store at {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Every record, ordered by source path.
    pub fn load_all(&self) -> Result<Vec<FileRecord>> {
        let mut statement = self.conn.prepare(
            "SELECT id, original_path, backup_path, last_modified, file_hash
             FROM files ORDER BY original_path, id",
        )?;

        let records = statement
            .query_map([], FileRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get(&self, original_path: &Path) -> Result<Option<FileRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, original_path, backup_path, last_modified, file_hash
                 FROM files WHERE original_path = ?1 ORDER BY id DESC LIMIT 1",
                params![path_value(original_path)],
                FileRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Start a group of changes that become durable together on `commit`.
    pub fn batch(&mut self) -> Result<StoreBatch<'_>> {
        Ok(StoreBatch {
            tx: self.conn.transaction()?,
        })
    }
}

/// Open transaction over the `files` table. Dropped without `commit`, every
/// change is rolled back.
pub struct StoreBatch<'a> {
    tx: Transaction<'a>,
}

impl StoreBatch<'_> {
    /// Insert `record`, replacing any existing rows for its source path.
    /// Returns the new surrogate id.
    pub fn upsert(&self, record: &FileRecord) -> Result<i64> {
        let original = path_value(&record.original_path);
        self.tx.execute(
            "DELETE FROM files WHERE original_path = ?1",
            params![original],
        )?;
        self.tx.execute(
            "INSERT INTO files (original_path, backup_path, last_modified, file_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                original,
                path_value(&record.backup_path),
                record.modified_time,
                record.content_hash.as_str(),
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, original_path: &Path) -> Result<bool> {
        let removed = self.tx.execute(
            "DELETE FROM files WHERE original_path = ?1",
            params![path_value(original_path)],
        )?;
        Ok(removed > 0)
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(original: &str, hash: &str) -> FileRecord {
        FileRecord::new(
            original,
            format!("/backup{}", original),
            "2024-05-01T10:00:00+00:00",
            ContentHash::from_hex(hash),
        )
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.is_empty().unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_and_load() {
        let mut store = StateStore::open_in_memory().unwrap();
        let batch = store.batch().unwrap();
        let id = batch.upsert(&record("/src/a.txt", "aa")).unwrap();
        batch.upsert(&record("/src/b.txt", "bb")).unwrap();
        batch.commit().unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, Some(id));
        assert_eq!(records[0].original_path, PathBuf::from("/src/a.txt"));
        assert_eq!(records[0].backup_path, PathBuf::from("/backup/src/a.txt"));
        assert_eq!(records[1].content_hash.as_str(), "bb");
    }

    #[test]
    fn test_upsert_replaces_existing_row() {
        let mut store = StateStore::open_in_memory().unwrap();
        let batch = store.batch().unwrap();
        let first = batch.upsert(&record("/src/a.txt", "old")).unwrap();
        let second = batch.upsert(&record("/src/a.txt", "new")).unwrap();
        batch.commit().unwrap();

        assert!(second > first);
        assert_eq!(store.len().unwrap(), 1);
        let current = store.get(Path::new("/src/a.txt")).unwrap().unwrap();
        assert_eq!(current.content_hash.as_str(), "new");
        assert_eq!(current.id, Some(second));
    }

    #[test]
    fn test_delete() {
        let mut store = StateStore::open_in_memory().unwrap();
        let batch = store.batch().unwrap();
        batch.upsert(&record("/src/a.txt", "aa")).unwrap();
        assert!(batch.delete(Path::new("/src/a.txt")).unwrap());
        assert!(!batch.delete(Path::new("/src/a.txt")).unwrap());
        batch.commit().unwrap();

        assert!(store.get(Path::new("/src/a.txt")).unwrap().is_none());
    }

    #[test]
    fn test_uncommitted_batch_rolls_back() {
        let mut store = StateStore::open_in_memory().unwrap();
        {
            let batch = store.batch().unwrap();
            batch.upsert(&record("/src/a.txt", "aa")).unwrap();
        }
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db.sqlite3");

        {
            let mut store = StateStore::open(&db).unwrap();
            let batch = store.batch().unwrap();
            batch.upsert(&record("/src/a.txt", "aa")).unwrap();
            batch.commit().unwrap();
        }

        let store = StateStore::open(&db).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_round_trip() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let original = Path::new("/src").join(OsStr::from_bytes(b"bad\xffname.txt"));
        let backup = Path::new("/backup/src").join(OsStr::from_bytes(b"bad\xffname.txt"));

        let mut store = StateStore::open_in_memory().unwrap();
        let batch = store.batch().unwrap();
        batch
            .upsert(&FileRecord::new(
                &original,
                &backup,
                "2024-05-01T10:00:00+00:00",
                ContentHash::from_hex("aa"),
            ))
            .unwrap();
        batch.commit().unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_path, original);
        assert_eq!(records[0].backup_path, backup);
        assert!(store.get(&original).unwrap().is_some());

        let batch = store.batch().unwrap();
        assert!(batch.delete(&original).unwrap());
        batch.commit().unwrap();
        assert!(store.is_empty().unwrap());
    }
}
