//! Index lifecycle events and the channel observers subscribe to.

use crate::index::IndexReport;
use crate::model::EntityId;
use crate::query::Backend;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Kind of work a background unit performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexOperation {
    Add,
    Remove,
    Update,
    Rebuild,
    Sync,
    RemoveAll,
}

impl std::fmt::Display for IndexOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexOperation::Add => "add",
            IndexOperation::Remove => "remove",
            IndexOperation::Update => "update",
            IndexOperation::Rebuild => "rebuild",
            IndexOperation::Sync => "sync",
            IndexOperation::RemoveAll => "remove-all",
        };
        f.write_str(name)
    }
}

/// Posted by the index manager as background units start and finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum IndexEvent {
    IndexStarted {
        backend: Backend,
        operation: IndexOperation,
    },
    IndexUpdated {
        backend: Backend,
        operation: IndexOperation,
        processed: usize,
        entity_ids: Vec<EntityId>,
    },
    IndexRemoved {
        backend: Backend,
        entity_ids: Vec<EntityId>,
    },
    IndexClosed {
        backend: Backend,
    },
}

impl IndexEvent {
    /// The event announcing that `operation` finished with `report`.
    pub fn completed(operation: IndexOperation, report: &IndexReport) -> Self {
        match operation {
            IndexOperation::Remove | IndexOperation::RemoveAll => IndexEvent::IndexRemoved {
                backend: report.backend,
                entity_ids: report.entity_ids.clone(),
            },
            _ => IndexEvent::IndexUpdated {
                backend: report.backend,
                operation,
                processed: report.processed,
                entity_ids: report.entity_ids.clone(),
            },
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            IndexEvent::IndexStarted { backend, .. }
            | IndexEvent::IndexUpdated { backend, .. }
            | IndexEvent::IndexRemoved { backend, .. }
            | IndexEvent::IndexClosed { backend } => *backend,
        }
    }
}

/// Fan-out of [`IndexEvent`]s. Posting never blocks; slow subscribers lag.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IndexEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.sender.subscribe()
    }

    pub fn post(&self, event: IndexEvent) {
        trace!("Posting {:?}", event);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
