//! Update dispatcher: the single consumer of the worker event channel.
//!
//! Routes chunk-group events to the owning coordinator, intercepts retryable
//! failures into `WaitingToRetry` plus a delayed re-admission, throttles
//! progress per task, filters by each task's update mode, and either delivers
//! to the attached consumer or persists to the durable store. Terminal
//! statuses are delivered at most once per task; everything after a terminal
//! is dropped.

mod store;

pub use store::UpdateStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::chunk::ChunkCoordinator;
use crate::message::{ProgressUpdate, StatusUpdate, TaskUpdate, WorkerEvent, WorkerMessage};
use crate::queue::{EnqueueItem, HoldingQueue};
use crate::retry;
use crate::task::{TaskId, TaskStatus};

/// Slot holding the currently attached consumer, if any.
pub(crate) type ConsumerSlot = Arc<Mutex<Option<UnboundedSender<TaskUpdate>>>>;

pub(crate) struct DispatcherDeps {
    pub queue: Arc<HoldingQueue>,
    pub coordinator: Arc<ChunkCoordinator>,
    pub store: UpdateStore,
    pub consumer: ConsumerSlot,
    /// Loopback sender used to emit the `Enqueued` transition when a retry
    /// timer re-admits a task.
    pub events: UnboundedSender<WorkerMessage>,
    pub progress_interval: Duration,
}

/// How long a terminal task id keeps swallowing late worker events.
const TERMINAL_TTL: Duration = Duration::from_secs(60);

/// Ids that reached a terminal status. Late events for them are dropped;
/// entries expire after a TTL and a fresh `Enqueued` transition clears the
/// entry, so a reused id starts a new lifetime and the map stays bounded.
struct TerminalLedger {
    sealed: HashMap<TaskId, Instant>,
    ttl: Duration,
}

impl TerminalLedger {
    fn new(ttl: Duration) -> Self {
        TerminalLedger {
            sealed: HashMap::new(),
            ttl,
        }
    }

    fn seal(&mut self, id: &str) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.sealed.retain(|_, at| now.duration_since(*at) < ttl);
        self.sealed.insert(id.to_string(), now);
    }

    fn reopen(&mut self, id: &str) {
        self.sealed.remove(id);
    }

    fn is_sealed(&self, id: &str) -> bool {
        self.sealed.get(id).map_or(false, |at| at.elapsed() < self.ttl)
    }
}

/// Per-task progress throttle: forward the first sample, then one per
/// interval, and always the final (1.0) sample.
fn should_forward_progress(
    last: &mut HashMap<TaskId, Instant>,
    id: &str,
    progress: f64,
    interval: Duration,
) -> bool {
    let now = Instant::now();
    if progress >= 1.0 {
        last.remove(id);
        return true;
    }
    match last.get(id) {
        Some(t) if now.duration_since(*t) < interval => false,
        _ => {
            last.insert(id.to_string(), now);
            true
        }
    }
}

pub(crate) async fn run_dispatch_loop(mut rx: UnboundedReceiver<WorkerMessage>, deps: DispatcherDeps) {
    let mut terminal = TerminalLedger::new(TERMINAL_TTL);
    let mut progress_last: HashMap<TaskId, Instant> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        if msg.task.is_chunk() {
            // Chunk workers occupy admission slots like any other task;
            // release on any status that ends the worker.
            if let WorkerEvent::Status(s) = &msg.event {
                if s.status.is_terminal() || s.status == TaskStatus::Paused {
                    deps.queue.task_finished(&msg.task.id);
                }
            }
            deps.coordinator.route(msg).await;
            continue;
        }

        match msg.event {
            WorkerEvent::Resume(data) => {
                if let Err(e) = deps.store.put_resume_data(&data).await {
                    tracing::error!(task = %data.task_id, "persisting resume data failed: {}", e);
                }
            }
            WorkerEvent::Status(update) => {
                let id = update.task.id.clone();
                if update.status == TaskStatus::Enqueued {
                    // A new lifetime for this id (re-enqueue or retry).
                    terminal.reopen(&id);
                } else if terminal.is_sealed(&id) {
                    continue;
                }
                if update.status.is_terminal() || update.status == TaskStatus::Paused {
                    deps.queue.task_finished(&id);
                }

                let update = intercept_retry(&deps, update);
                if update.status.is_terminal() {
                    terminal.seal(&id);
                    progress_last.remove(&id);
                }
                if update.task.update_mode.wants_status() {
                    deliver(&deps, TaskUpdate::Status(update)).await;
                }
            }
            WorkerEvent::Progress(update) => {
                let id = update.task.id.clone();
                if terminal.is_sealed(&id) {
                    continue;
                }
                if !update.task.update_mode.wants_progress() {
                    continue;
                }
                if should_forward_progress(
                    &mut progress_last,
                    &id,
                    update.progress,
                    deps.progress_interval,
                ) {
                    deliver(&deps, TaskUpdate::Progress(update)).await;
                }
            }
        }
    }
    tracing::debug!("event channel closed, dispatcher exiting");
}

/// Turn a retryable failure with remaining budget into `WaitingToRetry` and
/// schedule the re-admission after the backoff delay. Chunked parents go back
/// through the coordinator, plain tasks through the queue; either way the
/// `Enqueued` transition is looped back through the event channel.
fn intercept_retry(deps: &DispatcherDeps, update: StatusUpdate) -> StatusUpdate {
    let retryable = update.status == TaskStatus::Failed
        && update.error.as_ref().map_or(false, |e| e.is_retryable())
        && update.task.retries_remaining > 0;
    if !retryable {
        return update;
    }

    let mut task = update.task.clone();
    task.retries_remaining -= 1;
    let delay = retry::delay_after_failure(task.retries_total, task.retries_remaining);
    tracing::info!(
        task = %task.id,
        remaining = task.retries_remaining,
        delay_secs = delay.as_secs(),
        "retry scheduled"
    );

    let queue = Arc::clone(&deps.queue);
    let coordinator = Arc::clone(&deps.coordinator);
    let events = deps.events.clone();
    let readd = task.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(WorkerMessage::status(
            readd.clone(),
            StatusUpdate::new(readd.clone(), TaskStatus::Enqueued),
        ));
        if readd.is_chunked() {
            coordinator.start(EnqueueItem::new(readd)).await;
        } else {
            queue.add(EnqueueItem::new(readd));
        }
    });

    StatusUpdate {
        task,
        status: TaskStatus::WaitingToRetry,
        error: update.error,
        response_body: update.response_body,
        response_headers: update.response_headers,
    }
}

/// Send to the attached consumer, or persist when there is none (or it went
/// away). Persistence failures are logged, never fatal.
async fn deliver(deps: &DispatcherDeps, update: TaskUpdate) {
    let sender = deps.consumer.lock().unwrap().clone();
    if let Some(tx) = sender {
        match tx.send(update) {
            Ok(()) => return,
            Err(tokio::sync::mpsc::error::SendError(returned)) => {
                tracing::debug!("consumer went away, detaching");
                *deps.consumer.lock().unwrap() = None;
                persist(deps, returned).await;
                return;
            }
        }
    }
    persist(deps, update).await;
}

async fn persist(deps: &DispatcherDeps, update: TaskUpdate) {
    let result = match &update {
        TaskUpdate::Status(s) => deps.store.put_status_update(s).await,
        TaskUpdate::Progress(p) => deps.store.put_progress_update(p).await,
    };
    if let Err(e) = result {
        tracing::error!(task = %update.task().id, "persisting update failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BaseDir, Destination, Task, UpdateMode};

    #[test]
    fn progress_throttle_passes_first_and_final() {
        let mut last = HashMap::new();
        let interval = Duration::from_millis(500);
        assert!(should_forward_progress(&mut last, "t", 0.1, interval));
        assert!(!should_forward_progress(&mut last, "t", 0.2, interval));
        assert!(should_forward_progress(&mut last, "t", 1.0, interval));
        // Final sample cleared the entry, so a fresh task lifetime starts over.
        assert!(should_forward_progress(&mut last, "t", 0.0, interval));
    }

    #[test]
    fn progress_throttle_is_per_task() {
        let mut last = HashMap::new();
        let interval = Duration::from_secs(10);
        assert!(should_forward_progress(&mut last, "a", 0.1, interval));
        assert!(should_forward_progress(&mut last, "b", 0.1, interval));
        assert!(!should_forward_progress(&mut last, "a", 0.2, interval));
    }

    #[test]
    fn terminal_ledger_seals_reopens_and_expires() {
        let mut ledger = TerminalLedger::new(Duration::from_secs(60));
        ledger.seal("t");
        assert!(ledger.is_sealed("t"));
        assert!(!ledger.is_sealed("other"));
        // A fresh Enqueued for the same id starts a new lifetime.
        ledger.reopen("t");
        assert!(!ledger.is_sealed("t"));

        let mut expiring = TerminalLedger::new(Duration::ZERO);
        expiring.seal("t");
        assert!(!expiring.is_sealed("t"));
        // Sealing prunes expired entries, keeping the map bounded.
        expiring.seal("u");
        assert!(expiring.sealed.len() <= 1);
    }

    #[test]
    fn update_mode_gates_delivery_kinds() {
        let mut t = Task::new("m", "https://h/f", Destination::new(BaseDir::Downloads, "", "f"));
        t.update_mode = UpdateMode::Status;
        assert!(t.update_mode.wants_status());
        assert!(!t.update_mode.wants_progress());
        t.update_mode = UpdateMode::None;
        assert!(!t.update_mode.wants_status());
        assert!(!t.update_mode.wants_progress());
    }
}
