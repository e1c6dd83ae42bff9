//! Log sinks handed to the engine, and the process-wide subscriber setup used
//! by the CLI.

use crate::config::LogLevel;
use crate::{MirrorError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Receiver for the engine's leveled progress messages.
pub trait EventSink: Send + Sync {
    fn emit(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.emit(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.emit(LogLevel::Info, message);
    }

    fn warning(&self, message: &str) {
        self.emit(LogLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.emit(LogLevel::Error, message);
    }
}

/// Forwards events to whatever `tracing` subscriber is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "mirrorsync", "{}", message),
            LogLevel::Info => tracing::info!(target: "mirrorsync", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "mirrorsync", "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(target: "mirrorsync", "{}", message)
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(LogLevel, String)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message)
            .collect()
    }

    pub fn clear(&self) {
        match self.events.lock() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, level: LogLevel, message: &str) {
        match self.events.lock() {
            Ok(mut events) => events.push((level, message.to_string())),
            Err(poisoned) => poisoned.into_inner().push((level, message.to_string())),
        }
    }
}

/// Size at which the log file is rotated.
pub const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
/// Rotated files kept next to the live one (`sync.log.1` .. `sync.log.5`).
pub const ROTATED_BACKUPS: usize = 5;

/// Append-only log file that rolls over to numbered backups once it would
/// grow past `max_bytes`.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    backups: usize,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            max_bytes,
            backups,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backups == 0 {
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Install the global subscriber: coloured console output at `level`
/// (overridable through `RUST_LOG`), plus a rotating log file that always
/// captures INFO and above.
pub fn init_logging(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_tracing().to_string().to_lowercase()));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| {
                    MirrorError::Logging(format!("Failed to create log directory: {}", e))
                })?;
            }

            let file = RotatingFile::open(path, ROTATE_AT_BYTES, ROTATED_BACKUPS).map_err(|e| {
                MirrorError::Logging(format!("Failed to open log file {}: {}", path.display(), e))
            })?;

            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::INFO),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| MirrorError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.info("Created directory: /b/src");
        sink.warning("Backup file already missing: /b/src/a.txt");
        sink.emit(LogLevel::Critical, "store gone");

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, LogLevel::Info);
        assert_eq!(
            sink.messages_at(LogLevel::Warning),
            vec!["Backup file already missing: /b/src/a.txt".to_string()]
        );

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_rotating_file_rolls_over_and_caps_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.log");
        let mut log = RotatingFile::open(&path, 10, 2).unwrap();

        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            log.write_all(line.as_bytes()).unwrap();
        }
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "dddddddd\n");
        assert_eq!(fs::read_to_string(dir.path().join("sync.log.1")).unwrap(), "cccccccc\n");
        assert_eq!(fs::read_to_string(dir.path().join("sync.log.2")).unwrap(), "bbbbbbbb\n");
        assert!(!dir.path().join("sync.log.3").exists());
    }

    #[test]
    fn test_rotating_file_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.log");
        fs::write(&path, "old\n").unwrap();

        let mut log = RotatingFile::open(&path, 1024, 5).unwrap();
        log.write_all(b"new\n").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "old\nnew\n");
        assert!(!dir.path().join("sync.log.1").exists());
    }

    #[test]
    fn test_tracing_sink_without_subscriber_is_silent() {
        TracingSink.info("nobody listening");
        TracingSink.emit(LogLevel::Critical, "still fine");
    }
}
