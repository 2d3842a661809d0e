//! The two index backends.
//!
//! - [`FieldIndexer`]: structured `(entity, field, value)` rows in the
//!   embedded engine.
//! - [`DocumentIndex`]: FTS5 index over the text of linked documents.
//!
//! Both implement [`Indexer`] and [`Searcher`] so the manager can drive them
//! the same way.

pub mod documents;
mod fields;
mod traits;

pub use documents::{open_document_index, DocumentIndex, PlainTextExtractor, TextExtractor};
pub use fields::FieldIndexer;
pub use traits::{
    BackendHit, DocumentHit, IndexBackend, IndexReport, IndexStats, Indexer, IndexerState,
    Searcher,
};
