//! Full-text index over the text of linked documents.
//!
//! One row per document page in an FTS5 table, keyed by entity id and file
//! path. Only one process may write the index; the others get a read-only
//! view from [`open_document_index`].

mod extract;
mod readonly;
mod schema;
mod writable;

pub use extract::{PlainTextExtractor, TextExtractor};
pub use readonly::ReadOnlyDocumentIndex;
pub use schema::{DocumentSchema, DocumentSchemaConfig, DocumentTableStats};
pub use writable::WritableDocumentIndex;

use super::traits::{
    BackendHit, DocumentHit, IndexBackend, IndexReport, IndexStats, Indexer, IndexerState, Searcher,
};
use crate::cancel::CancellationToken;
use crate::config::{IndexDefaults, IndexOptions};
use crate::error::{RefIndexError, Result};
use crate::model::{Entity, EntityId, FieldChange, RecordStore};
use crate::query::{Backend, CompiledQuery, TableLayout};
use rusqlite::{params_from_iter, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// The document index in whichever mode could be opened.
pub enum DocumentIndex {
    Writable(WritableDocumentIndex),
    ReadOnly(ReadOnlyDocumentIndex),
}

impl DocumentIndex {
    fn inner(&self) -> &dyn IndexBackend {
        match self {
            DocumentIndex::Writable(index) => index,
            DocumentIndex::ReadOnly(index) => index,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, DocumentIndex::ReadOnly(_))
    }
}

/// Open the document index under `options.document_index_dir`.
///
/// Falls back to a read-only index when the write lock is held elsewhere or
/// the database cannot be opened for writing.
pub fn open_document_index(
    options: &IndexOptions,
    layout: &TableLayout,
    store: Arc<dyn RecordStore>,
    extractor: Arc<dyn TextExtractor>,
) -> DocumentIndex {
    let schema = DocumentSchemaConfig::for_layout(layout);
    match WritableDocumentIndex::open(&options.document_index_dir, schema.clone(), store, extractor) {
        Ok(index) => DocumentIndex::Writable(index),
        Err(e) => {
            let reason = match e {
                RefIndexError::IndexerDegraded { message } => message,
                other => other.to_string(),
            };
            warn!("Document index is read-only: {}", reason);
            let db_path = options
                .document_index_dir
                .join(IndexDefaults::DOCUMENT_DATABASE_FILENAME);
            DocumentIndex::ReadOnly(ReadOnlyDocumentIndex::open(&db_path, schema, reason))
        }
    }
}

/// Run a compiled full-text query, one hit per matching page.
pub(crate) fn run_search(conn: &Connection, query: &CompiledQuery) -> Result<Vec<BackendHit>> {
    if query.backend != Backend::FullText {
        return Err(RefIndexError::Other(format!(
            "document index cannot run a {} query",
            query.backend
        )));
    }
    let mut stmt = conn.prepare(&query.sql)?;
    let rows = stmt.query_map(params_from_iter(query.params.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    let mut hits = Vec::new();
    for row in rows {
        let (entity_id, path, page) = row?;
        hits.push(BackendHit {
            entity_id: EntityId::from(entity_id),
            document: Some(DocumentHit {
                path: PathBuf::from(path),
                page: u32::try_from(page).unwrap_or(0),
            }),
        });
    }
    Ok(hits)
}

impl Indexer for DocumentIndex {
    fn backend(&self) -> Backend {
        Backend::FullText
    }

    fn state(&self) -> IndexerState {
        self.inner().state()
    }

    fn add_to_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        self.inner().add_to_index(entities, cancel)
    }

    fn remove_from_index(&self, entities: &[Entity]) -> Result<IndexReport> {
        self.inner().remove_from_index(entities)
    }

    fn update_entry(
        &self,
        entity: &Entity,
        change: &FieldChange,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        self.inner().update_entry(entity, change, cancel)
    }

    fn rebuild_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        self.inner().rebuild_index(entities, cancel)
    }

    fn sync_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        self.inner().sync_index(entities, cancel)
    }

    fn remove_all_from_index(&self) -> Result<IndexReport> {
        self.inner().remove_all_from_index()
    }

    fn stats(&self) -> Result<IndexStats> {
        self.inner().stats()
    }

    fn close(&self) {
        self.inner().close()
    }
}

impl Searcher for DocumentIndex {
    fn search(&self, query: &CompiledQuery) -> Result<Vec<BackendHit>> {
        self.inner().search(query)
    }
}
