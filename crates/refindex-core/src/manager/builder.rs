//! Builder for configuring IndexManager initialization.

use super::events::EventBus;
use super::queue::BackendQueue;
use super::IndexManager;
use crate::config::IndexOptions;
use crate::engine::EngineSupervisor;
use crate::index::{open_document_index, FieldIndexer, PlainTextExtractor, TextExtractor};
use crate::model::RecordStore;
use crate::query::Backend;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// Builder for [`IndexManager`].
///
/// # Example
///
/// ```rust,ignore
/// use refindex_core::{IndexManager, IndexOptions};
///
/// let manager = IndexManager::builder(engine, store)
///     .options(IndexOptions::in_dir(&data_dir))
///     .build();
/// ```
pub struct IndexManagerBuilder {
    engine: Arc<EngineSupervisor>,
    store: Arc<dyn RecordStore>,
    options: IndexOptions,
    extractor: Option<Arc<dyn TextExtractor>>,
}

impl IndexManagerBuilder {
    pub fn new(engine: Arc<EngineSupervisor>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            engine,
            store,
            options: IndexOptions::default(),
            extractor: None,
        }
    }

    /// Default: [`IndexOptions::default`]
    pub fn options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the text extractor used for linked documents.
    ///
    /// Default: a [`PlainTextExtractor`] over the configured extensions.
    pub fn extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Open both backends and start their queues.
    ///
    /// Must be called inside a Tokio runtime; the queue workers and the
    /// deferred close run on it. Never fails: an unavailable engine or a
    /// locked document index degrade the respective backend.
    pub fn build(self) -> IndexManager {
        let runtime = Handle::current();
        let extractor = self.extractor.unwrap_or_else(|| {
            Arc::new(PlainTextExtractor::new(&self.options.extractable_extensions))
        });
        let documents = Arc::new(open_document_index(
            &self.options,
            self.engine.layout(),
            self.store.clone(),
            extractor,
        ));
        let fields = Arc::new(FieldIndexer::new(
            self.engine.clone(),
            self.options.keyword_separator,
        ));

        let events = EventBus::new(self.options.event_capacity);
        let structured_queue = BackendQueue::spawn(Backend::Structured, events.clone(), &runtime);
        let fulltext_queue = BackendQueue::spawn(Backend::FullText, events.clone(), &runtime);

        info!(
            "Index manager ready (engine {:?}, full-text {})",
            self.engine.state(),
            if self.options.fulltext_enabled { "enabled" } else { "disabled" }
        );

        IndexManager {
            engine: self.engine,
            store: self.store,
            fields,
            documents,
            structured_queue,
            fulltext_queue,
            fulltext_enabled: AtomicBool::new(self.options.fulltext_enabled),
            block_count: Arc::new(AtomicUsize::new(0)),
            catch_up_pending: AtomicBool::new(false),
            events,
            closed: AtomicBool::new(false),
            runtime,
        }
    }
}
