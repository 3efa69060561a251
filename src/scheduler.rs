//! The scheduler facade: wires the queue, chunk coordinator, dispatcher, and
//! store together and exposes the public operations.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::chunk::ChunkCoordinator;
use crate::config::SchedulerConfig;
use crate::message::{StatusUpdate, TaskUpdate, WorkerMessage};
use crate::queue::{DispatchContext, EnqueueItem, HoldingQueue};
use crate::task::{BaseDirResolver, Task, TaskId, TaskStatus, XdgResolver};
use crate::transport::{HttpTransport, Transport};
use crate::updates::{run_dispatch_loop, DispatcherDeps, UpdateStore};

/// Admission-controlled scheduler for resumable transfer tasks.
///
/// Owns the dispatcher loop and the reconciliation timer; both are aborted
/// when the scheduler is dropped. Must be created inside a tokio runtime.
pub struct TransferScheduler {
    queue: Arc<HoldingQueue>,
    coordinator: Arc<ChunkCoordinator>,
    store: UpdateStore,
    consumer: Arc<Mutex<Option<mpsc::UnboundedSender<TaskUpdate>>>>,
    events: mpsc::UnboundedSender<WorkerMessage>,
    dispatch: tokio::task::JoinHandle<()>,
    reconcile: tokio::task::JoinHandle<()>,
}

impl TransferScheduler {
    pub fn new(
        config: SchedulerConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn BaseDirResolver>,
        store: UpdateStore,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();

        let queue = Arc::new(HoldingQueue::new(
            &config,
            DispatchContext {
                transport: Arc::clone(&transport),
                resolver: Arc::clone(&resolver),
                events: events.clone(),
            },
        ));
        let coordinator = Arc::new(ChunkCoordinator::new(
            Arc::clone(&queue),
            transport,
            resolver,
            events.clone(),
        ));
        let consumer: Arc<Mutex<Option<mpsc::UnboundedSender<TaskUpdate>>>> =
            Arc::new(Mutex::new(None));

        let dispatch = tokio::spawn(run_dispatch_loop(
            rx,
            DispatcherDeps {
                queue: Arc::clone(&queue),
                coordinator: Arc::clone(&coordinator),
                store: store.clone(),
                consumer: Arc::clone(&consumer),
                events: events.clone(),
                progress_interval: config.progress_interval(),
            },
        ));

        let reconcile = {
            let queue = Arc::clone(&queue);
            let interval = config.reconcile_interval();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    queue.reconcile();
                }
            })
        };

        TransferScheduler {
            queue,
            coordinator,
            store,
            consumer,
            events,
            dispatch,
            reconcile,
        }
    }

    /// Scheduler with the default curl transport, XDG resolution, on-disk
    /// config and store.
    pub async fn with_defaults() -> Result<Self> {
        let config = crate::config::load_or_init()?;
        let store = UpdateStore::open_default().await?;
        Ok(Self::new(
            config,
            Arc::new(HttpTransport::new()),
            Arc::new(XdgResolver),
            store,
        ))
    }

    /// Admit a task. Chunked tasks are handed to the chunk coordinator and
    /// never hold a worker slot themselves. False when the id is already
    /// known.
    pub async fn enqueue(&self, task: Task) -> bool {
        if self.task_for_id(&task.id).is_some() {
            tracing::debug!(task = %task.id, "enqueue rejected: duplicate id");
            return false;
        }
        let _ = self.events.send(WorkerMessage::status(
            task.clone(),
            StatusUpdate::new(task.clone(), TaskStatus::Enqueued),
        ));
        if task.is_chunked() {
            self.coordinator.start(EnqueueItem::new(task)).await
        } else {
            self.queue.add(EnqueueItem::new(task))
        }
    }

    /// Cancel the given tasks (queued, running, or chunked parents). True if
    /// anything was affected; unknown ids are ignored.
    pub fn cancel(&self, ids: &[TaskId]) -> bool {
        let mut affected = self.queue.cancel_tasks_with_ids(ids);
        affected.extend(self.coordinator.cancel_parents(ids));
        !affected.is_empty()
    }

    /// Cancel every task, optionally only one group. Returns how many tasks
    /// were affected; chunk sub-tasks are internal and never counted (their
    /// parents cancel them).
    pub fn reset(&self, group: Option<&str>) -> usize {
        let ids: Vec<TaskId> = self
            .queue
            .all_tasks(group)
            .into_iter()
            .filter(|t| !t.is_chunk())
            .map(|t| t.id)
            .collect();
        let mut affected = self.queue.cancel_tasks_with_ids(&ids);
        let parents: Vec<TaskId> = self
            .coordinator
            .parent_tasks(group)
            .into_iter()
            .map(|t| t.id)
            .collect();
        affected.extend(self.coordinator.cancel_parents(&parents));
        affected.len()
    }

    /// Request a pause. Only effective for running tasks with `allow_pause`
    /// (chunked parents pause their chunks, best effort).
    pub fn pause(&self, id: &str) -> bool {
        if self.coordinator.pause(id) {
            return true;
        }
        self.queue.request_pause(id)
    }

    /// Re-admit a previously paused task, continuing from its persisted
    /// resume data when available and from scratch otherwise.
    pub async fn resume(&self, task: Task) -> bool {
        if self.task_for_id(&task.id).is_some() {
            return false;
        }
        let resume = match self.store.pop_resume_data(&task.id).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(task = %task.id, "reading resume data failed: {}", e);
                None
            }
        };
        let _ = self.events.send(WorkerMessage::status(
            task.clone(),
            StatusUpdate::new(task.clone(), TaskStatus::Enqueued),
        ));
        let item = match resume {
            Some(r) => EnqueueItem::with_resume(task.clone(), r),
            None => EnqueueItem::new(task.clone()),
        };
        if task.is_chunked() {
            self.coordinator.start(item).await
        } else {
            self.queue.add(item)
        }
    }

    /// All live tasks (queued, running, chunked parents), optionally filtered
    /// by group. Chunk sub-tasks are internal and never listed.
    pub fn all_tasks(&self, group: Option<&str>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .queue
            .all_tasks(group)
            .into_iter()
            .filter(|t| !t.is_chunk())
            .collect();
        tasks.extend(self.coordinator.parent_tasks(group));
        tasks
    }

    pub fn task_for_id(&self, id: &str) -> Option<Task> {
        self.coordinator
            .parent_for_id(id)
            .or_else(|| self.queue.task_for_id(id).filter(|t| !t.is_chunk()))
    }

    /// Attach the (single) consumer. Updates stored while no consumer was
    /// attached are drained into the new channel first, statuses before
    /// progress; consumers must tolerate duplicates after a crash.
    pub async fn attach_consumer(&self) -> UnboundedReceiver<TaskUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.store.pop_status_updates().await {
            Ok(backlog) => {
                for update in backlog {
                    let _ = tx.send(TaskUpdate::Status(update));
                }
            }
            Err(e) => tracing::error!("draining stored status updates failed: {}", e),
        }
        match self.store.pop_progress_updates().await {
            Ok(backlog) => {
                for update in backlog {
                    let _ = tx.send(TaskUpdate::Progress(update));
                }
            }
            Err(e) => tracing::error!("draining stored progress updates failed: {}", e),
        }
        *self.consumer.lock().unwrap() = Some(tx);
        rx
    }

    pub fn detach_consumer(&self) {
        *self.consumer.lock().unwrap() = None;
    }
}

impl Drop for TransferScheduler {
    fn drop(&mut self) {
        self.dispatch.abort();
        self.reconcile.abort();
    }
}
