//! Centralized configuration for refindex.
//!
//! Compile-time defaults live on unit structs as associated constants. The
//! runtime option structs below start from those defaults and are what the
//! engine, reaper and index manager actually consume.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_DIR_NAME: &'static str = "refindex";
}

/// Embedded engine defaults.
pub struct EngineDefaults;

impl EngineDefaults {
    /// File name prefix shared by every Engine Metadata Record.
    pub const METADATA_PREFIX: &'static str = "refindex-engine";
    pub const METADATA_EXTENSION: &'static str = "json";
    pub const DATA_DIR_PREFIX: &'static str = "engine";
    pub const DATABASE_FILENAME: &'static str = "fields.sqlite";
    pub const START_TIMEOUT: Duration = Duration::from_secs(30);
    pub const POOL_SIZE: usize = 4;
    pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long a separate engine host gets to exit after SIGTERM.
    pub const STOP_GRACE: Duration = Duration::from_secs(3);
    /// Executable name of the separate engine host.
    pub const HOST_BINARY_NAME: &'static str = "refindex-engine";
    /// First word pair of the line a host prints once it listens.
    pub const HOST_READY_PREFIX: &'static str = "refindex-engine ready";
}

/// Stale instance reaper defaults.
pub struct ReaperDefaults;

impl ReaperDefaults {
    pub const KILL_GRACE: Duration = Duration::from_secs(3);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
    /// Substring a listener's command line must contain before it is killed.
    pub const ENGINE_COMMAND_MARKER: &'static str = "refindex";
}

/// Index defaults.
pub struct IndexDefaults;

impl IndexDefaults {
    pub const DOCUMENT_INDEX_DIR_NAME: &'static str = "document-index";
    pub const DOCUMENT_DATABASE_FILENAME: &'static str = "documents.sqlite";
    pub const WRITE_LOCK_FILENAME: &'static str = "write.lock";
    pub const KEYWORD_SEPARATOR: char = ',';
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
    pub const EXTRACTABLE_EXTENSIONS: &'static [&'static str] =
        &["txt", "text", "md", "markdown", "tex", "bib", "html", "htm", "csv", "rst"];
    /// Pages in extracted text are separated by form feeds.
    pub const PAGE_SEPARATOR: char = '\x0c';
}

/// Well-known field names of bibliographic records.
pub struct FieldNames;

impl FieldNames {
    pub const CITATION_KEY: &'static str = "citationkey";
    pub const KEYWORDS: &'static str = "keywords";
    pub const GROUPS: &'static str = "groups";
    pub const FILE: &'static str = "file";
    pub const AUTHOR: &'static str = "author";
    pub const EDITOR: &'static str = "editor";
    /// Pseudo-field meaning "any field except groups".
    pub const ANY: &'static str = "any";
    /// Pseudo-field addressing linked-document text.
    pub const CONTENT: &'static str = "content";

    /// Fields holding `and`-joined person names.
    pub fn is_person_field(field: &str) -> bool {
        matches!(field, Self::AUTHOR | Self::EDITOR)
    }
}

/// Options for the embedded engine supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Root under which the per-run data directory is created.
    pub data_dir: PathBuf,
    /// Directory holding Engine Metadata Records.
    pub metadata_dir: PathBuf,
    pub metadata_prefix: String,
    pub start_timeout: Duration,
    pub pool_size: usize,
    pub acquire_timeout: Duration,
    /// Run the engine as a separate host process from this executable
    /// instead of inside the current process.
    pub host_program: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let tmp = crate::platform::paths::runtime_dir();
        Self {
            data_dir: tmp.clone(),
            metadata_dir: tmp,
            metadata_prefix: EngineDefaults::METADATA_PREFIX.to_string(),
            start_timeout: EngineDefaults::START_TIMEOUT,
            pool_size: EngineDefaults::POOL_SIZE,
            acquire_timeout: EngineDefaults::ACQUIRE_TIMEOUT,
            host_program: None,
        }
    }
}

impl EngineOptions {
    /// Options rooted at a single directory (data and metadata side by side).
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            data_dir: dir.clone(),
            metadata_dir: dir,
            ..Self::default()
        }
    }
}

/// Options for the stale instance reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperOptions {
    pub metadata_dir: PathBuf,
    pub metadata_prefix: String,
    pub kill_grace: Duration,
    pub connect_timeout: Duration,
    pub engine_command_marker: String,
}

impl Default for ReaperOptions {
    fn default() -> Self {
        Self {
            metadata_dir: crate::platform::paths::runtime_dir(),
            metadata_prefix: EngineDefaults::METADATA_PREFIX.to_string(),
            kill_grace: ReaperDefaults::KILL_GRACE,
            connect_timeout: ReaperDefaults::CONNECT_TIMEOUT,
            engine_command_marker: ReaperDefaults::ENGINE_COMMAND_MARKER.to_string(),
        }
    }
}

impl ReaperOptions {
    /// Reaper options matching the record location of an engine.
    pub fn for_engine(engine: &EngineOptions) -> Self {
        Self {
            metadata_dir: engine.metadata_dir.clone(),
            metadata_prefix: engine.metadata_prefix.clone(),
            ..Self::default()
        }
    }
}

/// Options for the index manager and its two backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Whether linked documents are indexed at all.
    pub fulltext_enabled: bool,
    /// Directory of the persistent full-text index.
    pub document_index_dir: PathBuf,
    pub keyword_separator: char,
    pub extractable_extensions: Vec<String>,
    pub event_capacity: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            fulltext_enabled: true,
            document_index_dir: crate::platform::paths::app_data_dir()
                .map(|dir| dir.join(IndexDefaults::DOCUMENT_INDEX_DIR_NAME))
                .unwrap_or_else(|_| {
                    crate::platform::paths::runtime_dir()
                        .join(IndexDefaults::DOCUMENT_INDEX_DIR_NAME)
                }),
            keyword_separator: IndexDefaults::KEYWORD_SEPARATOR,
            extractable_extensions: IndexDefaults::EXTRACTABLE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            event_capacity: IndexDefaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl IndexOptions {
    /// Options with the document index placed under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            document_index_dir: dir.as_ref().join(IndexDefaults::DOCUMENT_INDEX_DIR_NAME),
            ..Self::default()
        }
    }
}
