//! Fallback used when another process owns the writable document index.

use super::run_search;
use super::schema::{DocumentSchema, DocumentSchemaConfig};
use crate::cancel::CancellationToken;
use crate::config::EngineDefaults;
use crate::engine::register_functions;
use crate::error::Result;
use crate::index::traits::{BackendHit, IndexReport, IndexStats, Indexer, IndexerState, Searcher};
use crate::model::{Entity, FieldChange};
use crate::query::{Backend, CompiledQuery};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Serves searches from whatever the last writer left behind. Every mutation
/// is a no-op.
pub struct ReadOnlyDocumentIndex {
    reader: Mutex<Option<Connection>>,
    schema: DocumentSchemaConfig,
    reason: String,
    closed: AtomicBool,
}

impl ReadOnlyDocumentIndex {
    pub fn open(db_path: &Path, schema: DocumentSchemaConfig, reason: impl Into<String>) -> Self {
        let reader = if db_path.is_file() {
            match open_read_only(db_path) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!("Document index {} is not readable: {}", db_path.display(), e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            reader: Mutex::new(reader),
            schema,
            reason: reason.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// Why the writable index could not be opened.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<Connection>> {
        self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn skip(&self, operation: &str, entities: &[Entity]) -> Result<IndexReport> {
        debug!("Read-only document index, skipping {}", operation);
        Ok(IndexReport::dropped(Backend::FullText, entities))
    }
}

fn open_read_only(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(EngineDefaults::BUSY_TIMEOUT)?;
    register_functions(&conn)?;
    Ok(conn)
}

impl Indexer for ReadOnlyDocumentIndex {
    fn backend(&self) -> Backend {
        Backend::FullText
    }

    fn state(&self) -> IndexerState {
        if self.closed.load(Ordering::SeqCst) {
            IndexerState::Closed
        } else {
            IndexerState::ReadOnly
        }
    }

    fn add_to_index(&self, entities: &[Entity], _cancel: &CancellationToken) -> Result<IndexReport> {
        self.skip("add", entities)
    }

    fn remove_from_index(&self, entities: &[Entity]) -> Result<IndexReport> {
        self.skip("remove", entities)
    }

    fn update_entry(
        &self,
        entity: &Entity,
        _change: &FieldChange,
        _cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        self.skip("update", std::slice::from_ref(entity))
    }

    fn rebuild_index(&self, entities: &[Entity], _cancel: &CancellationToken) -> Result<IndexReport> {
        self.skip("rebuild", entities)
    }

    fn sync_index(&self, entities: &[Entity], _cancel: &CancellationToken) -> Result<IndexReport> {
        self.skip("sync", entities)
    }

    fn remove_all_from_index(&self) -> Result<IndexReport> {
        self.skip("remove all", &[])
    }

    fn stats(&self) -> Result<IndexStats> {
        let stats = match self.lock_reader().as_ref() {
            Some(conn) => Some(DocumentSchema::new(&self.schema).get_stats(conn)?),
            None => None,
        };
        let (entity_count, row_count) = stats
            .map(|stats| (stats.entity_count, stats.page_count))
            .unwrap_or((0, 0));
        Ok(IndexStats {
            backend: Backend::FullText,
            state: self.state(),
            entity_count,
            row_count,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock_reader().take();
    }
}

impl Searcher for ReadOnlyDocumentIndex {
    fn search(&self, query: &CompiledQuery) -> Result<Vec<BackendHit>> {
        match self.lock_reader().as_ref() {
            Some(conn) => run_search(conn, query),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_database_serves_empty_results() {
        let dir = TempDir::new().unwrap();
        let index = ReadOnlyDocumentIndex::open(
            &dir.path().join("documents.sqlite"),
            DocumentSchemaConfig::default(),
            "locked",
        );
        assert_eq!(index.state(), IndexerState::ReadOnly);
        assert_eq!(index.reason(), "locked");

        let entity = Entity::new(1u64).with_field("file", "a.txt");
        let report = index
            .add_to_index(&[entity], &CancellationToken::new())
            .unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 1);

        let query = CompiledQuery {
            backend: Backend::FullText,
            sql: "SELECT 1".to_string(),
            params: vec![],
        };
        assert!(index.search(&query).unwrap().is_empty());

        assert_eq!(index.stats().unwrap().row_count, 0);
        index.close();
        assert_eq!(index.state(), IndexerState::Closed);
    }
}
