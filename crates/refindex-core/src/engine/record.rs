//! Engine Metadata Records.
//!
//! One small JSON file per running engine, named `<prefix>-<ownerPid>.json`.
//! Records are written atomically:
//! 1. Write to a temp file with a PID+TID suffix
//! 2. fsync so the data reaches disk
//! 3. Rename over the target path
//!
//! so a crash mid-write never leaves a half-written record for the reaper.

use crate::config::EngineDefaults;
use crate::error::{RefIndexError, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use tracing::debug;

/// Ownership record of a running embedded engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetadataRecord {
    pub owner_pid: u32,
    /// TCP port on 127.0.0.1, for engines that listen on one.
    #[serde(default)]
    pub engine_port: Option<u16>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl EngineMetadataRecord {
    pub fn new(owner_pid: u32, engine_port: Option<u16>, data_dir: Option<PathBuf>) -> Self {
        Self {
            owner_pid,
            engine_port,
            started_at: Utc::now(),
            data_dir,
        }
    }

    /// File name of the record for `owner_pid`.
    pub fn file_name(prefix: &str, owner_pid: u32) -> String {
        format!(
            "{}-{}.{}",
            prefix,
            owner_pid,
            EngineDefaults::METADATA_EXTENSION
        )
    }

    pub fn path_in(dir: &Path, prefix: &str, owner_pid: u32) -> PathBuf {
        dir.join(Self::file_name(prefix, owner_pid))
    }

    /// Owner pid encoded in a record file name, or `None` if the name is not
    /// `<prefix>-<digits>.json`.
    pub fn owner_pid_from_file_name(prefix: &str, name: &str) -> Option<u32> {
        name.strip_prefix(prefix)?
            .strip_prefix('-')?
            .strip_suffix(EngineDefaults::METADATA_EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    pub fn read(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|e| RefIndexError::Io {
        message: format!("Failed to read {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e),
    })?;
    serde_json::from_str(&contents).map_err(|e| RefIndexError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })
}

/// Write data to a JSON file atomically.
fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| RefIndexError::Io {
                message: format!("Failed to create directory {}", parent.display()),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let temp_path = path.with_extension(format!("json.{}.{}.tmp", process::id(), thread_id()));

    let serialized = serde_json::to_string_pretty(data).map_err(|e| RefIndexError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| RefIndexError::Io {
                message: format!("Failed to create temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;

        file.write_all(serialized.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| RefIndexError::Io {
                message: format!("Failed to write temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        RefIndexError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    format!("{:?}", thread::current().id()).hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = EngineMetadataRecord::path_in(temp_dir.path(), "refindex-engine", 4242);
        let record = EngineMetadataRecord::new(4242, Some(5433), Some(temp_dir.path().into()));

        record.write(&path).unwrap();
        assert!(path.ends_with("refindex-engine-4242.json"));
        assert_eq!(EngineMetadataRecord::read(&path).unwrap(), record);

        // No temp files left behind.
        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_camel_case_wire_format() {
        let json = r#"{"ownerPid": 12, "enginePort": 5433, "startedAt": "2024-01-01T00:00:00Z"}"#;
        let record: EngineMetadataRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.owner_pid, 12);
        assert_eq!(record.engine_port, Some(5433));
        assert_eq!(record.data_dir, None);

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("ownerPid").is_some());
        assert!(value.get("startedAt").is_some());
    }

    #[test]
    fn test_owner_pid_from_file_name() {
        let prefix = "refindex-engine";
        assert_eq!(
            EngineMetadataRecord::owner_pid_from_file_name(prefix, "refindex-engine-12.json"),
            Some(12)
        );
        assert_eq!(
            EngineMetadataRecord::owner_pid_from_file_name(prefix, "refindex-engine-abc.json"),
            None
        );
        assert_eq!(
            EngineMetadataRecord::owner_pid_from_file_name(
                prefix,
                "refindex-engine-12.json.12.99.tmp"
            ),
            None
        );
        assert_eq!(
            EngineMetadataRecord::owner_pid_from_file_name(prefix, "other-12.json"),
            None
        );
    }
}
