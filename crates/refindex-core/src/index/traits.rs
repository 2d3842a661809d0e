//! Capabilities shared by both index backends.
//!
//! All operations are synchronous to match rusqlite's API; the index manager
//! runs them on the blocking pool.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::{Entity, EntityId, FieldChange};
use crate::query::{Backend, CompiledQuery};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whether an index accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexerState {
    Writable,
    /// Another process owns the writable index; only search is served.
    ReadOnly,
    /// The backing engine never came up; everything is a no-op.
    Unavailable,
    Closed,
}

impl IndexerState {
    pub fn accepts_writes(self) -> bool {
        self == IndexerState::Writable
    }
}

/// A matching page of a linked document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentHit {
    pub path: PathBuf,
    pub page: u32,
}

/// One row of backend search output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHit {
    pub entity_id: EntityId,
    /// Set for full-text hits.
    pub document: Option<DocumentHit>,
}

/// What one unit of index work did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub backend: Backend,
    /// Entities (structured) or documents (full-text) written or removed.
    pub processed: usize,
    /// Work skipped: unchanged documents, unresolvable files, read-only index.
    pub skipped: usize,
    /// Documents whose text could not be extracted.
    pub failed: usize,
    /// Entities the unit touched.
    pub entity_ids: Vec<EntityId>,
}

impl IndexReport {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            processed: 0,
            skipped: 0,
            failed: 0,
            entity_ids: Vec::new(),
        }
    }

    /// A report for work that was dropped entirely.
    pub fn dropped(backend: Backend, entities: &[Entity]) -> Self {
        Self {
            skipped: entities.len(),
            entity_ids: entities.iter().map(|e| e.id.clone()).collect(),
            ..Self::new(backend)
        }
    }
}

/// Size of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub backend: Backend,
    pub state: IndexerState,
    pub entity_count: usize,
    /// Field rows (structured) or document pages (full-text).
    pub row_count: usize,
}

/// Write side of an index backend.
pub trait Indexer: Send + Sync {
    fn backend(&self) -> Backend;

    fn state(&self) -> IndexerState;

    /// Index the given entities, replacing whatever was indexed for them.
    fn add_to_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport>;

    fn remove_from_index(&self, entities: &[Entity]) -> Result<IndexReport>;

    /// Apply one field edit.
    fn update_entry(
        &self,
        entity: &Entity,
        change: &FieldChange,
        cancel: &CancellationToken,
    ) -> Result<IndexReport>;

    /// Clear the index and repopulate it from `entities`.
    fn rebuild_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport>;

    /// Bring the index in line with `entities`, touching only what changed.
    fn sync_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport>;

    fn remove_all_from_index(&self) -> Result<IndexReport>;

    fn stats(&self) -> Result<IndexStats>;

    /// Release backend resources. Later writes are no-ops.
    fn close(&self);
}

/// Read side of an index backend.
pub trait Searcher: Send + Sync {
    fn search(&self, query: &CompiledQuery) -> Result<Vec<BackendHit>>;
}

/// Both sides together.
pub trait IndexBackend: Indexer + Searcher {}

impl<T: Indexer + Searcher> IndexBackend for T {}
