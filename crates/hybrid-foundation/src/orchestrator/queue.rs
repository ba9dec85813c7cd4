//! RequestQueue: Bounded FIFO Serializer for a Single Inference Slot
//!
//! A local accelerator can run one inference at a time. The `RequestQueue`
//! guards that slot: tasks are admitted into a bounded FIFO and a single
//! drain task runs them strictly one after another.
//!
//! ```text
//!   submit(task, cancel)
//!        │
//!        ├── cancel already fired ──▶ Err(aborted)
//!        ├── queued ≥ max_size ─────▶ Err(queue-full)
//!        ▼
//!   ┌──────────────────────────────┐        ┌───────────────┐
//!   │ VecDeque<QueueItem>          │ ─pop─▶ │  drain task   │ ─▶ one task
//!   │ [ item3 ][ item2 ][ item1 ]  │        │ (single-flight)│    at a time
//!   └──────────────────────────────┘        └───────────────┘
//!        ▲
//!        └── cancel fires while queued ──▶ spliced out, Err(aborted),
//!                                          task never invoked
//! ```
//!
//! Admission is synchronous: [`RequestQueue::submit`] either rejects the
//! task or hands back a [`QueueTicket`] that resolves with the task's result.
//! Rejection is immediate; there is no waiting for space.
//!
//! A running task owns its own cancellation. Task errors and panics reach
//! only that task's caller and never stop the drain loop.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::error::{InferenceError, InferenceResult};

/// Default maximum number of waiting items.
pub const DEFAULT_QUEUE_SIZE: usize = 10;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueueItem {
    id: u64,
    cancel: CancellationToken,
    run: Job,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    draining: bool,
    running: bool,
    next_id: u64,
}

type SharedState = Arc<Mutex<QueueState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, QueueState> {
    // The lock is never held across an await or user code.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove(state: &SharedState, id: u64) -> bool {
    let mut state = lock(state);
    match state.items.iter().position(|item| item.id == id) {
        Some(index) => {
            state.items.remove(index);
            true
        }
        None => false,
    }
}

// ============================================================================
// RequestQueue
// ============================================================================

/// Bounded FIFO with single-flight serial draining.
#[derive(Clone)]
pub struct RequestQueue {
    state: SharedState,
    max_size: usize,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RequestQueue")
            .field("queued", &state.items.len())
            .field("running", &state.running)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl RequestQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of items waiting to run. The running task is not counted.
    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a task currently holds the slot.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Admit `task` and return a ticket for its result.
    ///
    /// Must be called from within a tokio runtime; the first admission
    /// spawns the drain task.
    pub fn submit<T, F, Fut>(
        &self,
        task: F,
        cancel: Option<CancellationToken>,
    ) -> InferenceResult<QueueTicket<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = InferenceResult<T>> + Send + 'static,
    {
        let cancel = cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(InferenceError::aborted("Request aborted before it was queued"));
        }

        let (tx, rx) = oneshot::channel();
        let run: Job = Box::new(move || {
            async move {
                let result = AssertUnwindSafe(async move { task().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(InferenceError::inference_failed("Queued task panicked"))
                    });
                // The caller may have gone away; nothing to report to.
                let _ = tx.send(result);
            }
            .boxed()
        });

        let mut state = lock(&self.state);
        if state.items.len() >= self.max_size {
            tracing::warn!(
                "RequestQueue: rejecting request, {} items already queued",
                state.items.len()
            );
            return Err(InferenceError::queue_full(format!(
                "Request queue is full (max {})",
                self.max_size
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.items.push_back(QueueItem {
            id,
            cancel: cancel.clone(),
            run,
        });
        tracing::debug!(
            "RequestQueue: queued item {} ({} waiting)",
            id,
            state.items.len()
        );

        if !state.draining {
            state.draining = true;
            tokio::spawn(drain(self.state.clone()));
        }
        drop(state);

        Ok(QueueTicket {
            id,
            state: self.state.clone(),
            cancel,
            rx,
        })
    }

    /// Admit `task` and wait for its result.
    pub async fn enqueue<T, F, Fut>(
        &self,
        task: F,
        cancel: Option<CancellationToken>,
    ) -> InferenceResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = InferenceResult<T>> + Send + 'static,
    {
        self.submit(task, cancel)?.wait().await
    }

    /// Drop every waiting item. Their callers see an error; the running
    /// task is unaffected.
    pub fn clear(&self) {
        let dropped: Vec<QueueItem> = lock(&self.state).items.drain(..).collect();
        if !dropped.is_empty() {
            tracing::info!("RequestQueue: dropped {} waiting items", dropped.len());
        }
    }
}

async fn drain(state: SharedState) {
    loop {
        let item = {
            let mut guard = lock(&state);
            match guard.items.pop_front() {
                Some(item) => {
                    guard.running = true;
                    item
                }
                None => {
                    guard.draining = false;
                    guard.running = false;
                    return;
                }
            }
        };

        if item.cancel.is_cancelled() {
            tracing::debug!("RequestQueue: skipping cancelled item {}", item.id);
            continue;
        }

        (item.run)().await;
        lock(&state).running = false;
    }
}

// ============================================================================
// QueueTicket
// ============================================================================

/// Handle to an admitted task.
///
/// Dropping the ticket before the task starts removes it from the queue.
pub struct QueueTicket<T> {
    id: u64,
    state: SharedState,
    cancel: CancellationToken,
    rx: oneshot::Receiver<InferenceResult<T>>,
}

impl<T> std::fmt::Debug for QueueTicket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTicket").field("id", &self.id).finish()
    }
}

impl<T> QueueTicket<T> {
    /// Wait for the task's result.
    ///
    /// If the token fires while the item is still queued, the item is
    /// spliced out and this returns `aborted` without running the task.
    pub async fn wait(mut self) -> InferenceResult<T> {
        let settled = tokio::select! {
            biased;
            result = &mut self.rx => Some(result),
            _ = self.cancel.cancelled() => None,
        };
        if let Some(result) = settled {
            return self.settle(result);
        }

        if remove(&self.state, self.id) {
            tracing::debug!("RequestQueue: item {} aborted while queued", self.id);
            return Err(InferenceError::aborted("Request aborted while queued"));
        }

        let result = (&mut self.rx).await;
        self.settle(result)
    }

    fn settle(
        &self,
        result: Result<InferenceResult<T>, oneshot::error::RecvError>,
    ) -> InferenceResult<T> {
        match result {
            Ok(result) => result,
            Err(_) if self.cancel.is_cancelled() => {
                Err(InferenceError::aborted("Request aborted while queued"))
            }
            Err(_) => Err(InferenceError::inference_failed(
                "Request was dropped from the queue",
            )),
        }
    }
}

impl<T> Drop for QueueTicket<T> {
    fn drop(&mut self) {
        remove(&self.state, self.id);
    }
}

// ============================================================================
// Tests
// ============================================================================
