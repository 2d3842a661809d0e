//! Platform-specific path utilities.

use crate::config::AppConfig;
use crate::error::{RefIndexError, Result};
use std::path::PathBuf;

/// Get the refindex data directory.
///
/// # Platform Behavior
/// - **Linux**: `~/.local/share/refindex` (XDG_DATA_HOME)
/// - **Windows**: `%APPDATA%\refindex`
/// - **macOS**: `~/Library/Application Support/refindex`
pub fn app_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| RefIndexError::Config {
        message: "Could not determine platform data directory".to_string(),
    })?;
    Ok(data_dir.join(AppConfig::APP_DIR_NAME))
}

/// Directory for per-run state: engine data directories and metadata records.
///
/// This is the system temp directory, so records left by a crashed run are
/// found by every later run of any user session on the machine.
pub fn runtime_dir() -> PathBuf {
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_data_dir_contains_app_name() {
        if let Ok(dir) = app_data_dir() {
            assert!(
                dir.to_string_lossy().contains("refindex"),
                "Data dir should contain 'refindex': {:?}",
                dir
            );
        }
    }

    #[test]
    fn test_runtime_dir_exists() {
        assert!(runtime_dir().exists());
    }
}
