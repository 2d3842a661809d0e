//! Per-backend FIFO of background index units.
//!
//! Submission never blocks. Each backend has one worker that runs its units
//! one at a time on the blocking pool, so units for the same backend finish in
//! submission order while the two backends proceed independently.

use super::events::{EventBus, IndexEvent, IndexOperation};
use crate::cancel::{CancelScope, CancellationToken};
use crate::error::{RefIndexError, Result};
use crate::index::IndexReport;
use crate::query::Backend;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Work executed against one backend.
pub type IndexJob = Box<dyn FnOnce(&CancellationToken) -> Result<IndexReport> + Send + 'static>;

struct QueuedUnit {
    operation: IndexOperation,
    job: IndexJob,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<IndexReport>>,
}

/// Completion notification of one scheduled unit.
#[derive(Debug)]
pub struct TaskHandle {
    backend: Backend,
    operation: IndexOperation,
    receiver: oneshot::Receiver<Result<IndexReport>>,
}

impl TaskHandle {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn operation(&self) -> IndexOperation {
        self.operation
    }

    /// Wait for the unit to finish. A unit dropped by a shutting-down worker
    /// reports `Closed`.
    pub async fn wait(self) -> Result<IndexReport> {
        self.receiver.await.unwrap_or(Err(RefIndexError::Closed))
    }
}

/// Units scheduled by one manager call. `fulltext` is `None` when linked-file
/// indexing was disabled or blocked at submission time.
#[derive(Debug, Default)]
pub struct ScheduledWork {
    pub structured: Option<TaskHandle>,
    pub fulltext: Option<TaskHandle>,
}

impl ScheduledWork {
    pub fn is_fulltext_scheduled(&self) -> bool {
        self.fulltext.is_some()
    }

    /// Wait for every scheduled unit.
    pub async fn wait(self) -> CompletedWork {
        let structured = match self.structured {
            Some(handle) => Some(handle.wait().await),
            None => None,
        };
        let fulltext = match self.fulltext {
            Some(handle) => Some(handle.wait().await),
            None => None,
        };
        CompletedWork {
            structured,
            fulltext,
        }
    }
}

/// Outcome of a [`ScheduledWork`].
#[derive(Debug)]
pub struct CompletedWork {
    pub structured: Option<Result<IndexReport>>,
    pub fulltext: Option<Result<IndexReport>>,
}

impl CompletedWork {
    /// True when no scheduled unit failed.
    pub fn is_ok(&self) -> bool {
        [&self.structured, &self.fulltext]
            .into_iter()
            .flatten()
            .all(|outcome| outcome.is_ok())
    }
}

pub struct BackendQueue {
    backend: Backend,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedUnit>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancelScope,
}

impl BackendQueue {
    /// Start the worker on `runtime`.
    pub fn spawn(backend: Backend, events: EventBus, runtime: &Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = runtime.spawn(run_worker(backend, receiver, events));
        Self {
            backend,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            cancel: CancelScope::new(),
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<QueuedUnit>>> {
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a unit. Returns `None` once the queue is closed.
    pub fn submit(&self, operation: IndexOperation, job: IndexJob) -> Option<TaskHandle> {
        let (done, receiver) = oneshot::channel();
        let guard = self.lock_sender();
        let unit = QueuedUnit {
            operation,
            job,
            cancel: self.cancel.issue(),
            done,
        };
        let sender = guard.as_ref()?;
        if sender.send(unit).is_err() {
            debug!("{} queue worker is gone, dropping {}", self.backend, operation);
            return None;
        }
        Some(TaskHandle {
            backend: self.backend,
            operation,
            receiver,
        })
    }

    /// Cancel the running unit at its next item boundary and every unit
    /// already queued behind it. Units submitted afterwards run normally.
    pub fn cancel(&self) {
        self.cancel.cancel_all();
    }

    /// Stop accepting units. Already queued units still run; the returned
    /// handle finishes after the last of them.
    pub fn close(&self) -> Option<JoinHandle<()>> {
        self.lock_sender().take();
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

async fn run_worker(
    backend: Backend,
    mut receiver: mpsc::UnboundedReceiver<QueuedUnit>,
    events: EventBus,
) {
    while let Some(unit) = receiver.recv().await {
        let QueuedUnit {
            operation,
            job,
            cancel,
            done,
        } = unit;
        events.post(IndexEvent::IndexStarted { backend, operation });

        let result = match tokio::task::spawn_blocking(move || job(&cancel)).await {
            Ok(result) => result,
            Err(e) => Err(RefIndexError::Other(format!("{backend} {operation} task failed: {e}"))),
        };
        match &result {
            Ok(report) => events.post(IndexEvent::completed(operation, report)),
            Err(RefIndexError::Cancelled) => debug!("{} {} cancelled", backend, operation),
            Err(e) => error!("{} index {} failed: {}", backend, operation, e),
        }
        // The caller may have dropped its handle.
        let _ = done.send(result);
    }
    debug!("{} index queue drained", backend);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityId;
    use std::sync::Arc;

    fn job_recording(order: Arc<Mutex<Vec<u64>>>, n: u64) -> IndexJob {
        Box::new(move |_cancel: &CancellationToken| -> Result<IndexReport> {
            std::thread::sleep(std::time::Duration::from_millis(5 * (3 - n.min(3))));
            order.lock().unwrap().push(n);
            let mut report = IndexReport::new(Backend::Structured);
            report.entity_ids.push(EntityId::from(n));
            Ok(report)
        })
    }

    #[tokio::test]
    async fn test_units_run_in_submission_order() {
        let queue = BackendQueue::spawn(Backend::Structured, EventBus::new(16), &Handle::current());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<TaskHandle> = (1..=3)
            .map(|n| {
                queue
                    .submit(IndexOperation::Add, job_recording(order.clone(), n))
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_events_bracket_each_unit() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let queue = BackendQueue::spawn(Backend::Structured, events, &Handle::current());

        let handle = queue
            .submit(IndexOperation::Add, job_recording(Arc::new(Mutex::new(vec![])), 7))
            .unwrap();
        handle.wait().await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), IndexEvent::IndexStarted { .. }));
        match rx.recv().await.unwrap() {
            IndexEvent::IndexUpdated { entity_ids, .. } => {
                assert_eq!(entity_ids, vec![EntityId::from(7u64)])
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_drains_then_refuses() {
        let queue = BackendQueue::spawn(Backend::FullText, EventBus::new(16), &Handle::current());
        let order = Arc::new(Mutex::new(Vec::new()));
        let handle = queue
            .submit(IndexOperation::Add, job_recording(order.clone(), 1))
            .unwrap();

        let worker = queue.close().unwrap();
        worker.await.unwrap();
        assert!(handle.wait().await.is_ok());
        assert!(queue.submit(IndexOperation::Add, job_recording(order, 2)).is_none());
        assert!(queue.close().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_units_report_cancellation() {
        let queue = BackendQueue::spawn(Backend::FullText, EventBus::new(16), &Handle::current());
        queue.cancel();
        let handle = queue
            .submit(
                IndexOperation::Rebuild,
                Box::new(|cancel: &CancellationToken| -> Result<IndexReport> {
                    cancel.check()?;
                    Ok(IndexReport::new(Backend::FullText))
                }),
            )
            .unwrap();
        assert!(matches!(handle.wait().await, Err(RefIndexError::Cancelled)));
    }

    fn checking_job() -> IndexJob {
        Box::new(|cancel: &CancellationToken| -> Result<IndexReport> {
            cancel.check()?;
            Ok(IndexReport::new(Backend::Structured))
        })
    }

    #[tokio::test]
    async fn test_cancel_spares_later_submissions() {
        let queue = BackendQueue::spawn(Backend::Structured, EventBus::new(16), &Handle::current());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let blocker = queue
            .submit(
                IndexOperation::Rebuild,
                Box::new(move |cancel: &CancellationToken| -> Result<IndexReport> {
                    let _ = release_rx.recv();
                    cancel.check()?;
                    Ok(IndexReport::new(Backend::Structured))
                }),
            )
            .unwrap();
        let queued = queue.submit(IndexOperation::Add, checking_job()).unwrap();

        queue.cancel();
        let after = queue.submit(IndexOperation::Add, checking_job()).unwrap();
        release_tx.send(()).unwrap();

        assert!(matches!(blocker.wait().await, Err(RefIndexError::Cancelled)));
        assert!(matches!(queued.wait().await, Err(RefIndexError::Cancelled)));
        assert!(after.wait().await.is_ok());

        let again = queue.submit(IndexOperation::Add, checking_job()).unwrap();
        assert!(again.wait().await.is_ok());
    }
}
