//! Parallel chunk coordinator.
//!
//! A chunked task never occupies a worker slot itself. The coordinator probes
//! the object, partitions it into ranged chunk sub-tasks in the reserved
//! `"chunk"` group, and admits those through the holding queue like any other
//! download. Chunk updates route back here (never to consumers); the
//! coordinator aggregates them into parent status and progress, retries
//! individual chunks against the parent budget, stitches spool files on
//! completion, and persists per-chunk state as the parent's resume payload on
//! pause.

mod plan;
mod stitch;

pub use plan::{plan_chunks, ByteRange};
pub use stitch::{remove_spool_files, stitch};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::TransferError;
use crate::message::{ProgressUpdate, ResumeData, StatusUpdate, WorkerEvent, WorkerMessage};
use crate::queue::{EnqueueItem, HoldingQueue};
use crate::retry;
use crate::task::{BaseDirResolver, Destination, Task, TaskId, TaskStatus, CHUNK_GROUP};
use crate::transport::Transport;

/// Parent linkage carried in a chunk sub-task's opaque metadata field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub parent: TaskId,
    pub index: usize,
    pub from: u64,
    pub to: u64,
}

impl ChunkMetadata {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Per-chunk state, persisted as JSON inside the parent's resume token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkState {
    index: usize,
    url: String,
    from: u64,
    to: u64,
    status: TaskStatus,
    progress: f64,
    retries_remaining: u32,
    /// Bytes already in the spool file; 0 means re-fetch the whole range.
    start_byte: u64,
    validator: Option<String>,
}

struct ChunkEntry {
    task: Task,
    state: ChunkState,
}

struct ChunkContext {
    parent: Task,
    chunks: Vec<ChunkEntry>,
    total_len: u64,
    last_emitted: Option<TaskStatus>,
    pausing: bool,
    /// Set when cancel arrives while the probe is still in flight.
    canceled: bool,
}

/// Parent status derived from chunk statuses. `None` means no aggregate
/// conclusion yet (chunks still in flight).
fn derive_parent_status(statuses: &[TaskStatus]) -> Option<TaskStatus> {
    if statuses.iter().any(|s| *s == TaskStatus::Failed) {
        return Some(TaskStatus::Failed);
    }
    if statuses.iter().any(|s| *s == TaskStatus::NotFound) {
        return Some(TaskStatus::NotFound);
    }
    if !statuses.is_empty() && statuses.iter().all(|s| *s == TaskStatus::Complete) {
        return Some(TaskStatus::Complete);
    }
    None
}

/// Spool destination for chunk `index` of `parent`: a `<filename>.chunks`
/// directory next to the final file.
fn spool_destination(parent: &Task, index: usize) -> Destination {
    let spool = format!("{}.chunks", parent.destination.filename);
    let directory = if parent.destination.directory.is_empty() {
        spool
    } else {
        format!("{}/{}", parent.destination.directory, spool)
    };
    Destination::new(parent.destination.base_dir, directory, format!("{index:04}.chunk"))
}

/// Build the sub-task for one chunk. Chunks inherit the parent's request
/// shape, priority, and retry budget; they always allow pausing and live in
/// the reserved chunk group.
fn chunk_task(parent: &Task, index: usize, url: &str, from: u64, to: u64) -> Task {
    let mut t = Task::new(
        format!("{}#chunk{}", parent.id, index),
        url,
        spool_destination(parent, index),
    );
    t.method = parent.method.clone();
    t.headers = parent.headers.clone();
    t.priority = parent.priority;
    t.creation_time = parent.creation_time;
    t.retries_total = parent.retries_total;
    t.retries_remaining = parent.retries_remaining;
    t.group = CHUNK_GROUP.to_string();
    t.allow_pause = true;
    t.metadata = ChunkMetadata {
        parent: parent.id.clone(),
        index,
        from,
        to,
    }
    .encode();
    t
}

pub(crate) struct ChunkCoordinator {
    queue: Arc<HoldingQueue>,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn BaseDirResolver>,
    events: UnboundedSender<WorkerMessage>,
    /// Shared with the chunk retry timers spawned off the dispatcher.
    contexts: Arc<Mutex<HashMap<TaskId, ChunkContext>>>,
}

impl ChunkCoordinator {
    pub fn new(
        queue: Arc<HoldingQueue>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn BaseDirResolver>,
        events: UnboundedSender<WorkerMessage>,
    ) -> Self {
        ChunkCoordinator {
            queue,
            transport,
            resolver,
            events,
            contexts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take ownership of a chunked parent. Fresh parents are probed and
    /// partitioned; parents with resume data are rebuilt from the persisted
    /// chunk states without re-probing. Returns false for duplicate ids.
    pub async fn start(&self, item: EnqueueItem) -> bool {
        let parent = item.task.clone();
        {
            let mut ctxs = self.contexts.lock().unwrap();
            if ctxs.contains_key(&parent.id) {
                return false;
            }
            ctxs.insert(
                parent.id.clone(),
                ChunkContext {
                    parent: parent.clone(),
                    chunks: Vec::new(),
                    total_len: 0,
                    last_emitted: None,
                    pausing: false,
                    canceled: false,
                },
            );
        }

        if let Some(resume) = item.resume {
            self.start_resumed(parent, resume);
            return true;
        }
        self.start_fresh(parent).await;
        true
    }

    /// Probe, partition, and admit chunks for a fresh chunked parent.
    async fn start_fresh(&self, parent: Task) {
        let probe = {
            let transport = Arc::clone(&self.transport);
            let url = parent.primary_url().to_string();
            let headers = parent.headers.clone();
            tokio::task::spawn_blocking(move || transport.probe(&url, &headers)).await
        };

        let probe = match probe {
            Ok(r) => r,
            Err(join_err) => {
                self.fail_parent(&parent.id, TransferError::Internal(join_err.to_string()));
                return;
            }
        };
        let probe = match probe {
            Ok(p) => p,
            Err(TransferError::NotFound) => {
                self.finish_parent(&parent.id, TaskStatus::NotFound, None);
                return;
            }
            Err(e) => {
                self.fail_parent(&parent.id, e);
                return;
            }
        };

        let total_len = match probe.content_length {
            Some(len) if len > 0 && probe.accept_ranges => len,
            _ => {
                self.fail_parent(
                    &parent.id,
                    TransferError::ChunkingPrecondition(format!(
                        "server does not support ranged download (length {:?}, ranges {})",
                        probe.content_length, probe.accept_ranges
                    )),
                );
                return;
            }
        };

        let requested = parent.chunk_count * parent.urls.len().max(1);
        let ranges = plan_chunks(total_len, requested);
        let validator = probe.etag.or(probe.last_modified);

        let items: Vec<EnqueueItem> = {
            let mut ctxs = self.contexts.lock().unwrap();
            match ctxs.get(&parent.id) {
                None => return,
                Some(ctx) if ctx.canceled => {
                    ctxs.remove(&parent.id);
                    return;
                }
                Some(_) => {}
            }
            let Some(ctx) = ctxs.get_mut(&parent.id) else {
                return;
            };
            ctx.total_len = total_len;
            let mut items = Vec::with_capacity(ranges.len());
            for (i, range) in ranges.iter().enumerate() {
                // Round-robin chunk ranges across the parent's URLs.
                let url = &parent.urls[i % parent.urls.len()];
                let task = chunk_task(&parent, i, url, range.from, range.to);
                ctx.chunks.push(ChunkEntry {
                    task: task.clone(),
                    state: ChunkState {
                        index: i,
                        url: url.clone(),
                        from: range.from,
                        to: range.to,
                        status: TaskStatus::Enqueued,
                        progress: 0.0,
                        retries_remaining: parent.retries_remaining,
                        start_byte: 0,
                        validator: validator.clone(),
                    },
                });
                items.push(EnqueueItem::new(task));
            }
            self.emit_status_locked(ctx, StatusUpdate::new(parent.clone(), TaskStatus::Running));
            items
        };

        tracing::info!(
            parent = %parent.id,
            chunks = items.len(),
            total = total_len,
            "chunked download planned"
        );
        for item in items {
            self.queue.add(item);
        }
    }

    /// Rebuild chunks from the persisted pause payload. No re-probe; the
    /// object length is the sum of the recorded spans.
    fn start_resumed(&self, parent: Task, resume: ResumeData) {
        let states: Vec<ChunkState> = match serde_json::from_str(&resume.token) {
            Ok(s) => s,
            Err(e) => {
                self.fail_parent(
                    &parent.id,
                    TransferError::Internal(format!("corrupt resume payload: {}", e)),
                );
                return;
            }
        };

        let items: Vec<EnqueueItem> = {
            let mut ctxs = self.contexts.lock().unwrap();
            let Some(ctx) = ctxs.get_mut(&parent.id) else {
                return;
            };
            ctx.total_len = states.iter().map(|s| s.to - s.from + 1).sum();
            let mut items = Vec::new();
            for mut state in states {
                let mut task = chunk_task(&parent, state.index, &state.url, state.from, state.to);
                task.retries_remaining = state.retries_remaining;
                if state.status != TaskStatus::Complete {
                    // A chunk without resume bytes re-fetches its whole range.
                    let chunk_resume = (state.start_byte > 0).then(|| ResumeData {
                        task_id: task.id.clone(),
                        token: String::new(),
                        start_byte: state.start_byte,
                        validator: state.validator.clone(),
                    });
                    state.status = TaskStatus::Enqueued;
                    items.push(match chunk_resume {
                        Some(r) => EnqueueItem::with_resume(task.clone(), r),
                        None => EnqueueItem::new(task.clone()),
                    });
                }
                ctx.chunks.push(ChunkEntry { task, state });
            }
            ctx.chunks.sort_by_key(|e| e.state.index);
            self.emit_status_locked(ctx, StatusUpdate::new(parent.clone(), TaskStatus::Running));
            items
        };

        tracing::info!(parent = %parent.id, resuming = items.len(), "chunked download resumed");
        for item in items {
            self.queue.add(item);
        }
    }

    /// Handle one chunk-group worker event. Late events for unknown parents
    /// (already terminal) are no-ops.
    pub async fn route(&self, msg: WorkerMessage) {
        let Some(meta) = ChunkMetadata::parse(&msg.task.metadata) else {
            tracing::warn!(task = %msg.task.id, "chunk event without parent metadata dropped");
            return;
        };

        match msg.event {
            WorkerEvent::Resume(data) => {
                let mut ctxs = self.contexts.lock().unwrap();
                if let Some(entry) = ctxs
                    .get_mut(&meta.parent)
                    .and_then(|c| c.chunks.iter_mut().find(|e| e.state.index == meta.index))
                {
                    entry.state.start_byte = data.start_byte;
                    if data.validator.is_some() {
                        entry.state.validator = data.validator;
                    }
                }
            }
            WorkerEvent::Progress(p) => {
                let update = {
                    let mut ctxs = self.contexts.lock().unwrap();
                    let Some(ctx) = ctxs.get_mut(&meta.parent) else {
                        return;
                    };
                    if let Some(entry) =
                        ctx.chunks.iter_mut().find(|e| e.state.index == meta.index)
                    {
                        entry.state.progress = p.progress.clamp(0.0, 1.0);
                    }
                    let mean = ctx.chunks.iter().map(|e| e.state.progress).sum::<f64>()
                        / ctx.chunks.len().max(1) as f64;
                    let mut update = ProgressUpdate::new(ctx.parent.clone(), mean);
                    update.expected_size = Some(ctx.total_len);
                    update
                };
                let task = update.task.clone();
                let _ = self.events.send(WorkerMessage {
                    task,
                    event: WorkerEvent::Progress(update),
                });
            }
            WorkerEvent::Status(status) => self.route_status(meta, status).await,
        }
    }

    async fn route_status(&self, meta: ChunkMetadata, status: StatusUpdate) {
        enum Outcome {
            Nothing,
            Retry { task: Task, delay: std::time::Duration },
            Terminal { status: TaskStatus, error: Option<TransferError>, ctx: ChunkContext },
            Stitch { ctx: ChunkContext },
            PauseDone { ctx: ChunkContext },
        }

        enum Decision {
            Nothing,
            Retry { task: Task, delay: std::time::Duration },
            Terminal { status: TaskStatus, error: Option<TransferError> },
            Stitch,
            PauseDone,
        }

        let outcome = {
            let mut ctxs = self.contexts.lock().unwrap();
            let decision = {
                let Some(ctx) = ctxs.get_mut(&meta.parent) else {
                    return;
                };
                let Some(pos) = ctx.chunks.iter().position(|e| e.state.index == meta.index)
                else {
                    return;
                };

                match status.status {
                    TaskStatus::Running | TaskStatus::Enqueued => {
                        ctx.chunks[pos].state.status = status.status;
                        Decision::Nothing
                    }
                    TaskStatus::Complete => {
                        ctx.chunks[pos].state.status = TaskStatus::Complete;
                        ctx.chunks[pos].state.progress = 1.0;
                        let statuses: Vec<TaskStatus> =
                            ctx.chunks.iter().map(|e| e.state.status).collect();
                        if derive_parent_status(&statuses) == Some(TaskStatus::Complete) {
                            Decision::Stitch
                        } else if ctx.pausing && pause_quiescent(ctx) {
                            Decision::PauseDone
                        } else {
                            Decision::Nothing
                        }
                    }
                    TaskStatus::Failed => {
                        let entry = &mut ctx.chunks[pos];
                        if entry.task.retries_remaining > 0 {
                            entry.task.retries_remaining -= 1;
                            entry.state.retries_remaining = entry.task.retries_remaining;
                            entry.state.status = TaskStatus::WaitingToRetry;
                            let delay = retry::delay_after_failure(
                                entry.task.retries_total,
                                entry.task.retries_remaining,
                            );
                            Decision::Retry {
                                task: entry.task.clone(),
                                delay,
                            }
                        } else {
                            entry.state.status = TaskStatus::Failed;
                            Decision::Terminal {
                                status: TaskStatus::Failed,
                                error: status.error,
                            }
                        }
                    }
                    TaskStatus::NotFound => {
                        ctx.chunks[pos].state.status = TaskStatus::NotFound;
                        Decision::Terminal {
                            status: TaskStatus::NotFound,
                            error: None,
                        }
                    }
                    TaskStatus::Paused | TaskStatus::Canceled => {
                        ctx.chunks[pos].state.status = status.status;
                        if ctx.pausing && pause_quiescent(ctx) {
                            Decision::PauseDone
                        } else {
                            Decision::Nothing
                        }
                    }
                    TaskStatus::WaitingToRetry => Decision::Nothing,
                }
            };

            match decision {
                Decision::Nothing => Outcome::Nothing,
                Decision::Retry { task, delay } => Outcome::Retry { task, delay },
                Decision::Terminal { status, error } => match ctxs.remove(&meta.parent) {
                    Some(ctx) => Outcome::Terminal { status, error, ctx },
                    None => Outcome::Nothing,
                },
                Decision::Stitch => match ctxs.remove(&meta.parent) {
                    Some(ctx) => Outcome::Stitch { ctx },
                    None => Outcome::Nothing,
                },
                Decision::PauseDone => match ctxs.remove(&meta.parent) {
                    Some(ctx) => Outcome::PauseDone { ctx },
                    None => Outcome::Nothing,
                },
            }
        };

        match outcome {
            Outcome::Nothing => {}
            Outcome::Retry { task, delay } => self.schedule_chunk_retry(meta, task, delay),
            Outcome::Terminal { status, error, mut ctx } => {
                // The chunks already consumed the retry budget; the parent's
                // failure is final even when the underlying error would
                // otherwise be retryable.
                ctx.parent.retries_remaining = 0;
                self.cancel_chunks_and_cleanup(&ctx);
                self.emit_terminal(ctx, status, error);
            }
            Outcome::Stitch { ctx } => self.finish_stitch(ctx).await,
            Outcome::PauseDone { ctx } => self.finish_pause(ctx),
        }
    }

    /// Re-admit a failed chunk after the shared backoff delay, unless the
    /// parent was paused, canceled, or completed in the meantime.
    fn schedule_chunk_retry(&self, meta: ChunkMetadata, task: Task, delay: std::time::Duration) {
        tracing::debug!(
            chunk = %task.id,
            remaining = task.retries_remaining,
            delay_secs = delay.as_secs(),
            "chunk retry scheduled"
        );
        let contexts = Arc::clone(&self.contexts);
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let readmit = {
                let mut ctxs = contexts.lock().unwrap();
                match ctxs.get_mut(&meta.parent) {
                    Some(ctx) if !ctx.pausing && !ctx.canceled => {
                        if let Some(entry) =
                            ctx.chunks.iter_mut().find(|e| e.state.index == meta.index)
                        {
                            if entry.state.status == TaskStatus::WaitingToRetry {
                                entry.state.status = TaskStatus::Enqueued;
                                entry.state.start_byte = 0;
                                entry.state.progress = 0.0;
                                true
                            } else {
                                false
                            }
                        } else {
                            false
                        }
                    }
                    _ => false,
                }
            };
            if readmit {
                queue.add(EnqueueItem::new(task));
            }
        });
    }

    async fn finish_stitch(&self, ctx: ChunkContext) {
        let parent = ctx.parent.clone();
        let paths = match self.chunk_paths(&ctx) {
            Ok(p) => p,
            Err(e) => {
                self.emit_terminal(ctx, TaskStatus::Failed, Some(e));
                return;
            }
        };
        let final_path = match self.resolver.resolve(&parent.destination) {
            Ok(p) => p,
            Err(e) => {
                self.emit_terminal(ctx, TaskStatus::Failed, Some(e));
                return;
            }
        };

        let stitch_paths = paths.clone();
        let result =
            tokio::task::spawn_blocking(move || stitch(&stitch_paths, &final_path)).await;
        match result {
            Ok(Ok(())) => {
                remove_spool_files(&paths);
                let mut progress = ProgressUpdate::new(parent.clone(), 1.0);
                progress.expected_size = Some(ctx.total_len);
                let _ = self.events.send(WorkerMessage {
                    task: parent.clone(),
                    event: WorkerEvent::Progress(progress),
                });
                self.emit_terminal(ctx, TaskStatus::Complete, None);
            }
            Ok(Err(e)) => {
                // Spool files are kept; a later retry of the parent can reuse
                // nothing from them, but they aid diagnosis.
                self.emit_terminal(ctx, TaskStatus::Failed, Some(e));
            }
            Err(join_err) => {
                self.emit_terminal(
                    ctx,
                    TaskStatus::Failed,
                    Some(TransferError::Internal(join_err.to_string())),
                );
            }
        }
    }

    /// Persist per-chunk state as the parent's resume payload and emit
    /// `Paused`. Best effort: chunks without recorded bytes restart their
    /// range from scratch on resume.
    fn finish_pause(&self, ctx: ChunkContext) {
        let states: Vec<&ChunkState> = ctx.chunks.iter().map(|e| &e.state).collect();
        let token = serde_json::to_string(&states).unwrap_or_default();
        let parent = ctx.parent.clone();
        let _ = self.events.send(WorkerMessage {
            task: parent.clone(),
            event: WorkerEvent::Resume(ResumeData {
                task_id: parent.id.clone(),
                token,
                start_byte: 0,
                validator: None,
            }),
        });
        let _ = self.events.send(WorkerMessage {
            task: parent.clone(),
            event: WorkerEvent::Status(StatusUpdate::new(parent, TaskStatus::Paused)),
        });
    }

    /// Pause a chunked parent: silently pull queued chunks back, flag running
    /// ones. The parent's `Paused` status is emitted once every chunk has
    /// quiesced.
    pub fn pause(&self, parent_id: &str) -> bool {
        let done = {
            let mut ctxs = self.contexts.lock().unwrap();
            let quiescent = {
                let Some(ctx) = ctxs.get_mut(parent_id) else {
                    return false;
                };
                if !ctx.parent.allow_pause || ctx.chunks.is_empty() {
                    return false;
                }
                ctx.pausing = true;

                let queued: Vec<TaskId> = ctx
                    .chunks
                    .iter()
                    .filter(|e| e.state.status == TaskStatus::Enqueued)
                    .map(|e| e.task.id.clone())
                    .collect();
                let taken = self.queue.take_queued(&queued);
                for item in &taken {
                    if let Some(entry) = ctx.chunks.iter_mut().find(|e| e.task.id == item.task.id)
                    {
                        entry.state.status = TaskStatus::Paused;
                    }
                }
                // Flag everything not terminal and not pulled back above;
                // covers chunks whose Running event is still in flight.
                for entry in &ctx.chunks {
                    if !entry.state.status.is_terminal()
                        && entry.state.status != TaskStatus::Paused
                    {
                        self.queue.request_pause(&entry.task.id);
                    }
                }
                pause_quiescent(ctx)
            };
            if quiescent {
                ctxs.remove(parent_id)
            } else {
                None
            }
        };
        if let Some(ctx) = done {
            self.finish_pause(ctx);
        }
        true
    }

    /// Cancel a chunked parent: broadcast cancel to its chunks and emit the
    /// parent `Canceled` immediately, without waiting for workers to unwind.
    pub fn cancel(&self, parent_id: &str) -> bool {
        let ctx = {
            let mut ctxs = self.contexts.lock().unwrap();
            let Some(ctx) = ctxs.get_mut(parent_id) else {
                return false;
            };
            if ctx.chunks.is_empty() {
                // Probe still in flight; start_fresh observes the flag.
                ctx.canceled = true;
                let parent = ctx.parent.clone();
                let _ = self.events.send(WorkerMessage {
                    task: parent.clone(),
                    event: WorkerEvent::Status(StatusUpdate::new(parent, TaskStatus::Canceled)),
                });
                return true;
            }
            ctxs.remove(parent_id)
        };
        if let Some(ctx) = ctx {
            self.cancel_chunks_and_cleanup(&ctx);
            self.emit_terminal(ctx, TaskStatus::Canceled, None);
        }
        true
    }

    pub fn parent_for_id(&self, id: &str) -> Option<Task> {
        self.contexts.lock().unwrap().get(id).map(|c| c.parent.clone())
    }

    /// Chunked parents currently owned by the coordinator, optionally
    /// filtered by group.
    pub fn parent_tasks(&self, group: Option<&str>) -> Vec<Task> {
        self.contexts
            .lock()
            .unwrap()
            .values()
            .map(|c| &c.parent)
            .filter(|t| group.map_or(true, |g| t.group == g))
            .cloned()
            .collect()
    }

    /// Cancel every matching parent; returns the affected ids.
    pub fn cancel_parents(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let mut affected = Vec::new();
        for id in ids {
            if self.cancel(id) {
                affected.push(id.clone());
            }
        }
        affected
    }

    fn cancel_chunks_and_cleanup(&self, ctx: &ChunkContext) {
        let live: Vec<TaskId> = ctx
            .chunks
            .iter()
            .filter(|e| !e.state.status.is_terminal())
            .map(|e| e.task.id.clone())
            .collect();
        if !live.is_empty() {
            self.queue.cancel_tasks_with_ids(&live);
        }
        if let Ok(paths) = self.chunk_paths(ctx) {
            remove_spool_files(&paths);
        }
    }

    fn chunk_paths(&self, ctx: &ChunkContext) -> Result<Vec<PathBuf>, TransferError> {
        ctx.chunks
            .iter()
            .map(|e| self.resolver.resolve(&e.task.destination))
            .collect()
    }

    fn fail_parent(&self, parent_id: &str, error: TransferError) {
        self.finish_parent(parent_id, TaskStatus::Failed, Some(error));
    }

    fn finish_parent(&self, parent_id: &str, status: TaskStatus, error: Option<TransferError>) {
        let ctx = self.contexts.lock().unwrap().remove(parent_id);
        if let Some(ctx) = ctx {
            self.emit_terminal(ctx, status, error);
        }
    }

    fn emit_terminal(&self, ctx: ChunkContext, status: TaskStatus, error: Option<TransferError>) {
        if ctx.last_emitted == Some(status) {
            return;
        }
        if let Some(e) = &error {
            tracing::warn!(parent = %ctx.parent.id, status = %status, "chunked download failed: {}", e);
        } else {
            tracing::info!(parent = %ctx.parent.id, status = %status, "chunked download finished");
        }
        let mut update = StatusUpdate::new(ctx.parent.clone(), status);
        update.error = error;
        let _ = self.events.send(WorkerMessage {
            task: ctx.parent,
            event: WorkerEvent::Status(update),
        });
    }

    fn emit_status_locked(&self, ctx: &mut ChunkContext, update: StatusUpdate) {
        if ctx.last_emitted == Some(update.status) {
            return;
        }
        ctx.last_emitted = Some(update.status);
        let task = update.task.clone();
        let _ = self.events.send(WorkerMessage {
            task,
            event: WorkerEvent::Status(update),
        });
    }
}

/// Quiescent for pause: nothing queued or running anymore.
fn pause_quiescent(ctx: &ChunkContext) -> bool {
    ctx.chunks.iter().all(|e| {
        !matches!(
            e.state.status,
            TaskStatus::Enqueued | TaskStatus::Running
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::BaseDir;

    #[test]
    fn metadata_roundtrip() {
        let meta = ChunkMetadata {
            parent: "p1".into(),
            index: 2,
            from: 100,
            to: 199,
        };
        let parsed = ChunkMetadata::parse(&meta.encode()).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(ChunkMetadata::parse("not json"), None);
    }

    #[test]
    fn derive_failed_beats_not_found() {
        use TaskStatus::*;
        assert_eq!(
            derive_parent_status(&[Complete, Failed, NotFound]),
            Some(Failed)
        );
        assert_eq!(derive_parent_status(&[Complete, NotFound, Running]), Some(NotFound));
        assert_eq!(derive_parent_status(&[Complete, Complete]), Some(Complete));
        assert_eq!(derive_parent_status(&[Complete, Running]), None);
        assert_eq!(derive_parent_status(&[]), None);
    }

    #[test]
    fn chunk_tasks_inherit_parent_shape() {
        let mut parent = Task::new(
            "p",
            "https://m1.example/f",
            Destination::new(BaseDir::Downloads, "isos", "f.iso"),
        )
        .with_retries(3);
        parent.priority = -5;
        parent.chunk_count = 2;
        parent.headers.insert("authorization".into(), "Bearer x".into());

        let t = chunk_task(&parent, 1, "https://m2.example/f", 500, 999);
        assert_eq!(t.id, "p#chunk1");
        assert_eq!(t.group, CHUNK_GROUP);
        assert!(t.is_chunk());
        assert!(t.allow_pause);
        assert_eq!(t.priority, -5);
        assert_eq!(t.retries_remaining, 3);
        assert_eq!(t.headers.get("authorization").map(String::as_str), Some("Bearer x"));

        let meta = ChunkMetadata::parse(&t.metadata).unwrap();
        assert_eq!(meta.parent, "p");
        assert_eq!((meta.from, meta.to), (500, 999));

        assert_eq!(t.destination.directory, "isos/f.iso.chunks");
        assert_eq!(t.destination.filename, "0001.chunk");
    }

    #[test]
    fn spool_destination_without_directory() {
        let parent = Task::new(
            "p",
            "https://h/f",
            Destination::new(BaseDir::Downloads, "", "f.bin"),
        );
        let d = spool_destination(&parent, 0);
        assert_eq!(d.directory, "f.bin.chunks");
        assert_eq!(d.filename, "0000.chunk");
    }
}
