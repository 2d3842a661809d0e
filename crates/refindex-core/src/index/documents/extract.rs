//! Text extraction from linked documents.

use crate::config::IndexDefaults;
use crate::error::{RefIndexError, Result};
use std::path::Path;

/// Turns a document into the text of its pages.
pub trait TextExtractor: Send + Sync {
    /// Whether `path` looks like something this extractor can read.
    fn supports(&self, path: &Path) -> bool;

    /// Page texts in order. Page numbers are the 1-based positions.
    fn extract(&self, path: &Path) -> Result<Vec<String>>;
}

/// Reads UTF-8 text files, splitting pages on form feeds.
#[derive(Debug, Clone)]
pub struct PlainTextExtractor {
    extensions: Vec<String>,
}

impl PlainTextExtractor {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }
}

impl Default for PlainTextExtractor {
    fn default() -> Self {
        Self::new(IndexDefaults::EXTRACTABLE_EXTENSIONS)
    }
}

impl TextExtractor for PlainTextExtractor {
    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.contains(&ext))
    }

    fn extract(&self, path: &Path) -> Result<Vec<String>> {
        if !self.supports(path) {
            return Err(RefIndexError::ExtractionFailure {
                path: path.to_path_buf(),
                message: "unsupported file type".to_string(),
            });
        }
        let bytes = std::fs::read(path).map_err(|e| RefIndexError::ExtractionFailure {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let text = String::from_utf8(bytes).map_err(|_| RefIndexError::ExtractionFailure {
            path: path.to_path_buf(),
            message: "not valid UTF-8".to_string(),
        })?;
        Ok(text
            .split(IndexDefaults::PAGE_SEPARATOR)
            .map(str::to_string)
            .collect())
    }
}
