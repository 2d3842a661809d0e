//! refindex core - local search and indexing for reference libraries.
//!
//! Keeps two indexes consistent with an in-memory record store and searches
//! them with one query language:
//!
//! - a structured `(entity, field, value)` index inside an embedded SQLite
//!   engine owned by [`EngineSupervisor`],
//! - a full-text index over the text of linked documents.
//!
//! [`IndexManager`] schedules all index maintenance in the background and
//! merges searches across both. [`StaleInstanceReaper`] cleans up after
//! runs that crashed without shutting their engine down.
//!
//! # Example
//!
//! ```rust,ignore
//! use refindex_core::{
//!     EngineOptions, EngineSupervisor, IndexManager, IndexOptions, InMemoryRecordStore,
//!     ReaperOptions, SearchFlags, StaleInstanceReaper,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> refindex_core::Result<()> {
//!     let engine_options = EngineOptions::default();
//!     StaleInstanceReaper::new(ReaperOptions::for_engine(&engine_options)).reap();
//!
//!     let engine = Arc::new(EngineSupervisor::new(engine_options));
//!     engine.start().await;
//!
//!     let store = Arc::new(InMemoryRecordStore::from_json_file("library.json".as_ref())?);
//!     let manager = IndexManager::builder(engine.clone(), store.clone())
//!         .options(IndexOptions::default())
//!         .build();
//!     manager.add_to_index(store.entities()).wait().await;
//!
//!     let results = manager.search("author:Euler", SearchFlags::default())?;
//!     println!("{} hits", results.len());
//!
//!     manager.close_and_wait().await;
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod manager;
pub mod model;
pub mod platform;
pub mod query;
pub mod reaper;

pub use cancel::{CancelScope, CancellationToken, CancelledError};
pub use config::{EngineOptions, IndexOptions, ReaperOptions};
pub use engine::{EngineState, EngineSupervisor};
pub use error::{RefIndexError, Result};
pub use index::{
    DocumentHit, IndexReport, IndexStats, IndexerState, PlainTextExtractor, TextExtractor,
};
pub use manager::{
    IndexEvent, IndexManager, IndexManagerBuilder, LinkedFileIndexerBlock, ScheduledWork,
    SearchHit, SearchResults,
};
pub use model::{
    Entity, EntityChange, EntityId, FieldChange, FieldValue, InMemoryRecordStore, RecordStore,
};
pub use query::{parse_query, Backend, QueryCompiler, QueryNode, SearchFlags};
pub use reaper::{ReapReport, StaleInstanceReaper};
