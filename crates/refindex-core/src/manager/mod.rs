//! The index manager: the one entry point the record store's change stream
//! and the search surface talk to.
//!
//! Every mutating call returns immediately with a [`ScheduledWork`]. The
//! structured unit is always scheduled; the full-text unit only while
//! linked-file indexing is enabled and not blocked. Searches run on the
//! caller's thread.

mod builder;
mod events;
mod queue;
mod results;

pub use builder::IndexManagerBuilder;
pub use events::{EventBus, IndexEvent, IndexOperation};
pub use queue::{BackendQueue, CompletedWork, IndexJob, ScheduledWork, TaskHandle};
pub use results::{SearchHit, SearchResults};

use crate::cancel::CancellationToken;
use crate::engine::EngineSupervisor;
use crate::error::Result;
use crate::index::{
    BackendHit, DocumentIndex, FieldIndexer, IndexReport, IndexStats, Indexer, Searcher,
};
use crate::model::{Entity, EntityChange, FieldChange, RecordStore};
use crate::query::{parse_query, Backend, QueryCompiler, QueryNode, SearchFlags};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct IndexManager {
    engine: Arc<EngineSupervisor>,
    store: Arc<dyn RecordStore>,
    fields: Arc<FieldIndexer>,
    documents: Arc<DocumentIndex>,
    structured_queue: BackendQueue,
    fulltext_queue: BackendQueue,
    fulltext_enabled: AtomicBool,
    block_count: Arc<AtomicUsize>,
    /// Set when full-text indexing was enabled while blocked.
    catch_up_pending: AtomicBool,
    events: EventBus,
    closed: AtomicBool,
    runtime: Handle,
}

/// While held, linked-file indexing is not scheduled. Blocks nest; indexing
/// resumes when the last one is dropped.
#[derive(Debug)]
pub struct LinkedFileIndexerBlock {
    count: Arc<AtomicUsize>,
}

impl Drop for LinkedFileIndexerBlock {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IndexManager {
    pub fn builder(
        engine: Arc<EngineSupervisor>,
        store: Arc<dyn RecordStore>,
    ) -> IndexManagerBuilder {
        IndexManagerBuilder::new(engine, store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn is_fulltext_enabled(&self) -> bool {
        self.fulltext_enabled.load(Ordering::SeqCst)
    }

    pub fn is_linked_file_indexer_blocked(&self) -> bool {
        self.block_count.load(Ordering::SeqCst) > 0
    }

    pub fn block_linked_file_indexer(&self) -> LinkedFileIndexerBlock {
        self.block_count.fetch_add(1, Ordering::SeqCst);
        LinkedFileIndexerBlock {
            count: self.block_count.clone(),
        }
    }

    fn should_index_files(&self) -> bool {
        self.is_fulltext_enabled() && !self.is_linked_file_indexer_blocked()
    }

    /// Index every record's files, deferred when enabled under a block.
    fn submit_catch_up(&self) -> Option<TaskHandle> {
        let documents = self.documents.clone();
        let entities = self.store.entities();
        self.fulltext_queue.submit(
            IndexOperation::Add,
            Box::new(move |cancel: &CancellationToken| documents.add_to_index(&entities, cancel)),
        )
    }

    fn schedule_fields(
        &self,
        operation: IndexOperation,
        job: impl FnOnce(&FieldIndexer, &CancellationToken) -> Result<IndexReport>
            + Send
            + 'static,
    ) -> Option<TaskHandle> {
        let fields = self.fields.clone();
        self.structured_queue.submit(
            operation,
            Box::new(move |cancel: &CancellationToken| job(fields.as_ref(), cancel)),
        )
    }

    fn schedule_documents(
        &self,
        operation: IndexOperation,
        job: impl FnOnce(&DocumentIndex, &CancellationToken) -> Result<IndexReport>
            + Send
            + 'static,
    ) -> Option<TaskHandle> {
        if !self.should_index_files() {
            debug!("Linked-file indexing disabled or blocked, skipping {}", operation);
            return None;
        }
        if self.catch_up_pending.swap(false, Ordering::SeqCst) {
            info!("Linked-file indexer unblocked, catching up before {}", operation);
            self.submit_catch_up();
        }
        let documents = self.documents.clone();
        self.fulltext_queue.submit(
            operation,
            Box::new(move |cancel: &CancellationToken| job(documents.as_ref(), cancel)),
        )
    }

    pub fn add_to_index(&self, entities: Vec<Entity>) -> ScheduledWork {
        let shared = Arc::new(entities);
        let for_documents = shared.clone();
        ScheduledWork {
            structured: self.schedule_fields(IndexOperation::Add, move |index, cancel| {
                index.add_to_index(&shared, cancel)
            }),
            fulltext: self.schedule_documents(IndexOperation::Add, move |index, cancel| {
                index.add_to_index(&for_documents, cancel)
            }),
        }
    }

    pub fn remove_from_index(&self, entities: Vec<Entity>) -> ScheduledWork {
        let shared = Arc::new(entities);
        let for_documents = shared.clone();
        ScheduledWork {
            structured: self.schedule_fields(IndexOperation::Remove, move |index, _| {
                index.remove_from_index(&shared)
            }),
            fulltext: self.schedule_documents(IndexOperation::Remove, move |index, _| {
                index.remove_from_index(&for_documents)
            }),
        }
    }

    /// Apply one field edit. Only edits of the `file` field reach the
    /// document index.
    pub fn update_entry(&self, entity: Entity, change: FieldChange) -> ScheduledWork {
        let is_file_change = change.is_file_change();
        let shared = Arc::new((entity, change));
        let for_documents = shared.clone();
        let structured = self.schedule_fields(IndexOperation::Update, move |index, cancel| {
            index.update_entry(&shared.0, &shared.1, cancel)
        });
        let fulltext = if is_file_change {
            self.schedule_documents(IndexOperation::Update, move |index, cancel| {
                index.update_entry(&for_documents.0, &for_documents.1, cancel)
            })
        } else {
            None
        };
        ScheduledWork {
            structured,
            fulltext,
        }
    }

    /// Re-index an entity whose linked files were just changed by a file drop.
    pub fn update_after_drop_files(&self, entity: Entity) -> ScheduledWork {
        self.add_to_index(vec![entity])
    }

    /// Clear and repopulate the document index from the record store. The
    /// structured side is brought in sync alongside.
    pub fn rebuild_full_text_index(&self) -> ScheduledWork {
        let entities = Arc::new(self.store.entities());
        let for_documents = entities.clone();
        ScheduledWork {
            structured: self.schedule_fields(IndexOperation::Sync, move |index, cancel| {
                index.sync_index(&entities, cancel)
            }),
            fulltext: self.schedule_documents(IndexOperation::Rebuild, move |index, cancel| {
                index.rebuild_index(&for_documents, cancel)
            }),
        }
    }

    /// Reconcile both indexes with the record store, touching only what
    /// changed since they were last written.
    pub fn update_index(&self) -> ScheduledWork {
        let entities = Arc::new(self.store.entities());
        let for_documents = entities.clone();
        ScheduledWork {
            structured: self.schedule_fields(IndexOperation::Sync, move |index, cancel| {
                index.sync_index(&entities, cancel)
            }),
            fulltext: self.schedule_documents(IndexOperation::Sync, move |index, cancel| {
                index.sync_index(&for_documents, cancel)
            }),
        }
    }

    /// Turn linked-file indexing on or off.
    ///
    /// Enabling schedules indexing of every record's files; disabling clears
    /// the document index without closing it.
    ///
    /// Enabling while the linked-file indexer is blocked returns `None` and
    /// defers the catch-up: it is queued ahead of the first full-text unit
    /// scheduled after the last block is dropped.
    pub fn set_fulltext_enabled(&self, enabled: bool) -> Option<TaskHandle> {
        let was_enabled = self.fulltext_enabled.swap(enabled, Ordering::SeqCst);
        match (was_enabled, enabled) {
            (false, true) if self.is_linked_file_indexer_blocked() => {
                info!("Full-text indexing enabled while blocked, deferring catch-up");
                self.catch_up_pending.store(true, Ordering::SeqCst);
                None
            }
            (false, true) => {
                info!("Full-text indexing enabled");
                self.catch_up_pending.store(false, Ordering::SeqCst);
                self.submit_catch_up()
            }
            (true, false) => {
                self.catch_up_pending.store(false, Ordering::SeqCst);
                info!("Full-text indexing disabled, clearing document index");
                let documents = self.documents.clone();
                self.fulltext_queue.submit(
                    IndexOperation::RemoveAll,
                    Box::new(move |_: &CancellationToken| documents.remove_all_from_index()),
                )
            }
            _ => None,
        }
    }

    /// Route one record-store notification.
    pub fn handle_change(&self, change: EntityChange) -> ScheduledWork {
        match change {
            EntityChange::Added(entities) => self.add_to_index(entities),
            EntityChange::Removed(entities) => self.remove_from_index(entities),
            EntityChange::FieldChanged { entity, change } => self.update_entry(entity, change),
        }
    }

    /// Parse and run a query.
    ///
    /// Fails only with `QueryInvalid`. Backend trouble is logged and yields
    /// fewer (or no) hits.
    pub fn search(&self, query: &str, flags: SearchFlags) -> Result<SearchResults> {
        let ast = parse_query(query, flags)?;
        self.run_search(query, &ast, flags)
    }

    /// Run an already parsed query. Leaf flags are taken from the tree; only
    /// `flags.fulltext` is consulted here.
    pub fn search_ast(&self, node: &QueryNode, flags: SearchFlags) -> Result<SearchResults> {
        self.run_search(&node.to_string(), node, flags)
    }

    fn run_search(&self, query: &str, node: &QueryNode, flags: SearchFlags) -> Result<SearchResults> {
        let started = Instant::now();
        let compiler = QueryCompiler::new(self.engine.layout().clone())
            .with_trigram(self.engine.capabilities().trigram);

        let structured = compiler.compile(node, Backend::Structured)?;
        let fulltext = if flags.fulltext {
            Some(compiler.compile(node, Backend::FullText)?)
        } else {
            None
        };

        let field_hits = degrade(Backend::Structured, self.fields.search(&structured))?;
        let document_hits = match fulltext {
            Some(compiled) => degrade(Backend::FullText, self.documents.search(&compiled))?,
            None => Vec::new(),
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let results = SearchResults::merge(query, field_hits, document_hits, elapsed_ms);
        debug!("Search {:?} matched {} entities in {}ms", query, results.len(), elapsed_ms);
        Ok(results)
    }

    pub fn stats(&self) -> Vec<IndexStats> {
        [
            self.fields.stats(),
            Indexer::stats(self.documents.as_ref()),
        ]
        .into_iter()
        .filter_map(|stats| match stats {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Failed to read index stats: {}", e);
                None
            }
        })
        .collect()
    }

    /// Stop the running units at their next item boundary and fail every
    /// queued one with `Cancelled`. Work scheduled afterwards runs normally.
    pub fn cancel(&self) {
        self.structured_queue.cancel();
        self.fulltext_queue.cancel();
    }

    fn begin_close(&self) -> Option<ClosingIndexes> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ClosingIndexes {
            workers: [self.structured_queue.close(), self.fulltext_queue.close()],
            fields: self.fields.clone(),
            documents: self.documents.clone(),
            events: self.events.clone(),
        })
    }

    /// Stop accepting work and close both indexes once the queued work has
    /// run. Returns immediately and may be called from any thread; the
    /// shutdown runs on the runtime the manager was built in.
    pub fn close(&self) {
        if let Some(closing) = self.begin_close() {
            self.runtime.spawn(closing.finish());
        }
    }

    /// Like [`close`](Self::close), but returns only after every queued unit
    /// has finished and both indexes are closed. Call this before shutting
    /// down the engine.
    pub async fn close_and_wait(&self) {
        if let Some(closing) = self.begin_close() {
            closing.finish().await;
        }
    }
}

struct ClosingIndexes {
    workers: [Option<JoinHandle<()>>; 2],
    fields: Arc<FieldIndexer>,
    documents: Arc<DocumentIndex>,
    events: EventBus,
}

impl ClosingIndexes {
    async fn finish(self) {
        for worker in self.workers.into_iter().flatten() {
            if let Err(e) = worker.await {
                warn!("Index queue worker ended abnormally: {}", e);
            }
        }
        let documents = self.documents;
        let closed = tokio::task::spawn_blocking(move || documents.close()).await;
        if let Err(e) = closed {
            warn!("Failed to close document index: {}", e);
        }
        self.fields.close();
        self.events.post(IndexEvent::IndexClosed {
            backend: Backend::Structured,
        });
        self.events.post(IndexEvent::IndexClosed {
            backend: Backend::FullText,
        });
        info!("Index manager closed");
    }
}

/// Keep `QueryInvalid`; turn every other backend failure into no hits.
fn degrade(backend: Backend, outcome: Result<Vec<BackendHit>>) -> Result<Vec<BackendHit>> {
    match outcome {
        Ok(hits) => Ok(hits),
        Err(e) if e.is_user_visible() => Err(e),
        Err(e) if e.is_degradation() => {
            debug!("{} search skipped: {}", backend, e);
            Ok(Vec::new())
        }
        Err(e) => {
            warn!("{} search failed, returning no hits from it: {}", backend, e);
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineOptions, IndexOptions};
    use crate::error::RefIndexError;
    use crate::model::InMemoryRecordStore;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir, store: Arc<InMemoryRecordStore>) -> (Arc<EngineSupervisor>, IndexManager) {
        let engine = Arc::new(EngineSupervisor::new(EngineOptions::in_dir(dir.path())));
        engine.start().await;
        let manager = IndexManager::builder(engine.clone(), store)
            .options(IndexOptions::in_dir(dir.path()))
            .build();
        (engine, manager)
    }

    #[tokio::test]
    async fn test_blocked_indexer_skips_fulltext_units() {
        let dir = TempDir::new().unwrap();
        let (engine, manager) = manager(&dir, Arc::new(InMemoryRecordStore::new())).await;
        let entity = Entity::new(1u64).with_field("file", "paper.txt");

        let block = manager.block_linked_file_indexer();
        let nested = manager.block_linked_file_indexer();
        let work = manager.update_after_drop_files(entity.clone());
        assert!(work.structured.is_some());
        assert!(!work.is_fulltext_scheduled());
        work.wait().await;

        drop(block);
        assert!(manager.is_linked_file_indexer_blocked());
        drop(nested);
        let work = manager.update_after_drop_files(entity);
        assert!(work.is_fulltext_scheduled());
        assert!(work.wait().await.is_ok());

        manager.close_and_wait().await;
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_disabling_fulltext_clears_and_stops_scheduling() {
        let dir = TempDir::new().unwrap();
        let (engine, manager) = manager(&dir, Arc::new(InMemoryRecordStore::new())).await;

        let clearing = manager.set_fulltext_enabled(false).unwrap();
        assert_eq!(clearing.operation(), IndexOperation::RemoveAll);
        clearing.wait().await.unwrap();
        assert!(manager.set_fulltext_enabled(false).is_none());

        let work = manager.add_to_index(vec![Entity::new(1u64)]);
        assert!(!work.is_fulltext_scheduled());
        work.wait().await;

        manager.close_and_wait().await;
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (engine, manager) = manager(&dir, Arc::new(InMemoryRecordStore::new())).await;

        let err = manager.search("(author:Euler", SearchFlags::default()).unwrap_err();
        assert!(err.is_user_visible());
        let err = manager
            .search("title=~\"[unclosed\"", SearchFlags::default())
            .unwrap_err();
        assert!(matches!(err, RefIndexError::QueryInvalid { .. }));

        manager.close_and_wait().await;
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_close_posts_closed_events_and_refuses_work() {
        let dir = TempDir::new().unwrap();
        let (engine, manager) = manager(&dir, Arc::new(InMemoryRecordStore::new())).await;
        let mut events = manager.subscribe();

        manager.close_and_wait().await;
        manager.close_and_wait().await;

        let mut closed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let IndexEvent::IndexClosed { backend } = event {
                closed.push(backend);
            }
        }
        assert_eq!(closed, vec![Backend::Structured, Backend::FullText]);

        let work = manager.add_to_index(vec![Entity::new(1u64)]);
        assert!(work.structured.is_none());
        assert!(manager
            .search("anything", SearchFlags::default())
            .unwrap()
            .is_empty());
        engine.shutdown();
    }

    fn fulltext_starts(events: &mut broadcast::Receiver<IndexEvent>) -> Vec<IndexOperation> {
        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let IndexEvent::IndexStarted {
                backend: Backend::FullText,
                operation,
            } = event
            {
                started.push(operation);
            }
        }
        started
    }

    #[tokio::test]
    async fn test_enabling_while_blocked_catches_up_after_unblock() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryRecordStore::new());
        store.insert(Entity::new(1u64).with_field("title", "Graph Theory"));
        let engine = Arc::new(EngineSupervisor::new(EngineOptions::in_dir(dir.path())));
        engine.start().await;
        let mut options = IndexOptions::in_dir(dir.path());
        options.fulltext_enabled = false;
        let manager = IndexManager::builder(engine.clone(), store)
            .options(options)
            .build();
        let mut events = manager.subscribe();

        let block = manager.block_linked_file_indexer();
        assert!(manager.set_fulltext_enabled(true).is_none());
        assert!(manager.is_fulltext_enabled());
        drop(block);

        let work = manager.update_index();
        assert!(work.is_fulltext_scheduled());
        assert!(work.wait().await.is_ok());
        assert_eq!(
            fulltext_starts(&mut events),
            vec![IndexOperation::Add, IndexOperation::Sync]
        );

        // The catch-up runs once.
        manager.update_index().wait().await;
        assert_eq!(fulltext_starts(&mut events), vec![IndexOperation::Sync]);

        manager.close_and_wait().await;
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_disabling_while_blocked_drops_pending_catch_up() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(EngineSupervisor::new(EngineOptions::in_dir(dir.path())));
        engine.start().await;
        let mut options = IndexOptions::in_dir(dir.path());
        options.fulltext_enabled = false;
        let manager = IndexManager::builder(engine.clone(), Arc::new(InMemoryRecordStore::new()))
            .options(options)
            .build();
        let mut events = manager.subscribe();

        let block = manager.block_linked_file_indexer();
        assert!(manager.set_fulltext_enabled(true).is_none());
        manager.set_fulltext_enabled(false).unwrap().wait().await.unwrap();
        drop(block);
        manager.set_fulltext_enabled(true).unwrap().wait().await.unwrap();

        assert_eq!(
            fulltext_starts(&mut events),
            vec![IndexOperation::RemoveAll, IndexOperation::Add]
        );
        manager.close_and_wait().await;
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_work_after_cancel_runs() {
        let dir = TempDir::new().unwrap();
        let (engine, manager) = manager(&dir, Arc::new(InMemoryRecordStore::new())).await;

        manager.cancel();
        let work = manager.add_to_index(vec![Entity::new(1u64).with_field("author", "Euler")]);
        assert!(work.wait().await.is_ok());
        let results = manager.search("author:Euler", SearchFlags::default()).unwrap();
        assert_eq!(results.len(), 1);

        manager.cancel();
        manager.cancel();
        assert!(manager.update_index().wait().await.is_ok());

        manager.close_and_wait().await;
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_from_plain_thread() {
        let dir = TempDir::new().unwrap();
        let (engine, manager) = manager(&dir, Arc::new(InMemoryRecordStore::new())).await;
        let manager = Arc::new(manager);
        let mut events = manager.subscribe();

        let closer = manager.clone();
        std::thread::spawn(move || closer.close()).join().unwrap();

        let mut closed = Vec::new();
        while closed.len() < 2 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let IndexEvent::IndexClosed { backend } = event {
                closed.push(backend);
            }
        }
        assert_eq!(closed, vec![Backend::Structured, Backend::FullText]);
        assert!(manager.add_to_index(vec![Entity::new(1u64)]).structured.is_none());
        engine.shutdown();
    }
}
