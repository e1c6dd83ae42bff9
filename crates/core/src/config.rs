use crate::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

const DEFAULT_DATABASE: &str = "db.sqlite3";

/// Severity levels accepted in the `log_level` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    pub fn to_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(MirrorError::Config(format!("Unknown log level: {}", other))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub folders: Vec<PathBuf>,
    pub backup_path: PathBuf,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

impl MirrorConfig {
    pub fn new(folders: Vec<PathBuf>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            folders,
            backup_path: backup_path.into(),
            log_level: LogLevel::default(),
            log_file: None,
            database_path: default_database_path(),
        }
    }

    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::from_yaml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| MirrorError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Pick the config file: explicit path, then `./config.yaml`, then the
    /// per-user config directory.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let local = PathBuf::from("config.yaml");
        if local.exists() {
            return Ok(local);
        }

        Self::default_path()
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| MirrorError::Config("Could not determine config directory".to_string()))?;

        Ok(config_dir.join("mirrorsync").join("config.yaml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.folders.is_empty() {
            return Err(MirrorError::Config("No folders configured for backup".to_string()));
        }

        if self.backup_path.as_os_str().is_empty() {
            return Err(MirrorError::Config("backup_path must not be empty".to_string()));
        }

        for folder in &self.folders {
            if folder.as_os_str().is_empty() {
                return Err(MirrorError::Config("Folder entries must not be empty".to_string()));
            }
            if folder.is_relative() {
                warn!("Folder {} is relative to the working directory", folder.display());
            }
        }

        Ok(())
    }

    /// Starter config written by `mirrorsync init`.
    pub fn template() -> &'static str {
        "# Folders to mirror. Relative paths resolve against the working directory.\n\
         folders:\n  \
           - /path/to/Documents\n\
         # Destination root for the mirrored tree.\n\
         backup_path: /path/to/backup\n\
         # DEBUG, INFO, WARNING, ERROR or CRITICAL\n\
         log_level: INFO\n\
         # log_file: sync.log\n\
         # database_path: db.sqlite3\n"
    }
}
