//! Admission-controlled holding queue.
//!
//! The single place where queue order, the running set, and the three
//! concurrency counters (global, per-host, per-group) are mutated — always
//! under one exclusive lock, never while awaiting. Advancement pops the best
//! item and dispatches it if its counters are under their ceilings; items
//! blocked only by a host/group ceiling are set aside so admissible
//! lower-priority items still proceed in the same pass. A periodic
//! reconciliation pass recomputes the counters from the actually-running
//! workers, repairing drift from lost completion signals.

mod item;

pub use item::EnqueueItem;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::SchedulerConfig;
use crate::message::{StatusUpdate, WorkerMessage};
use crate::task::{BaseDirResolver, Task, TaskId, TaskStatus};
use crate::transport::Transport;
use crate::worker::{spawn_worker, WorkerHandle};

/// Capabilities the queue needs to start a worker for an admitted item.
pub(crate) struct DispatchContext {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn BaseDirResolver>,
    pub events: UnboundedSender<WorkerMessage>,
}

struct Limits {
    total: Option<usize>,
    per_host: Option<usize>,
    per_group: Option<usize>,
}

#[derive(Default)]
struct Counters {
    total: usize,
    by_host: HashMap<String, usize>,
    by_group: HashMap<String, usize>,
}

impl Counters {
    fn admit(&mut self, host: Option<&str>, group: &str) {
        self.total += 1;
        if let Some(h) = host {
            *self.by_host.entry(h.to_string()).or_insert(0) += 1;
        }
        *self.by_group.entry(group.to_string()).or_insert(0) += 1;
    }

    fn release(&mut self, host: Option<&str>, group: &str) {
        self.total = self.total.saturating_sub(1);
        if let Some(h) = host {
            if let Some(n) = self.by_host.get_mut(h) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    self.by_host.remove(h);
                }
            }
        }
        if let Some(n) = self.by_group.get_mut(group) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.by_group.remove(group);
            }
        }
    }
}

fn under(limit: Option<usize>, current: usize) -> bool {
    limit.map_or(true, |max| current < max)
}

/// Whether an item with `host`/`group` fits under every ceiling right now.
fn would_admit(limits: &Limits, counters: &Counters, host: Option<&str>, group: &str) -> bool {
    under(limits.total, counters.total)
        && host.map_or(true, |h| {
            under(limits.per_host, counters.by_host.get(h).copied().unwrap_or(0))
        })
        && under(
            limits.per_group,
            counters.by_group.get(group).copied().unwrap_or(0),
        )
}

struct RunningSlot {
    task: Task,
    host: Option<String>,
    worker: WorkerHandle,
}

struct QueueState {
    /// Sorted by `(priority, creation_time)` ascending.
    queue: Vec<EnqueueItem>,
    running: HashMap<TaskId, RunningSlot>,
    counters: Counters,
    /// Reentry guard: an advancement pass in flight. A nested call records
    /// `advance_again` and returns instead of recursing or re-locking.
    advancing: bool,
    advance_again: bool,
}

pub struct HoldingQueue {
    limits: Limits,
    state: Mutex<QueueState>,
    ctx: DispatchContext,
}

impl HoldingQueue {
    pub(crate) fn new(cfg: &SchedulerConfig, ctx: DispatchContext) -> Self {
        HoldingQueue {
            limits: Limits {
                total: cfg.max_concurrent,
                per_host: cfg.max_concurrent_per_host,
                per_group: cfg.max_concurrent_per_group,
            },
            state: Mutex::new(QueueState {
                queue: Vec::new(),
                running: HashMap::new(),
                counters: Counters::default(),
                advancing: false,
                advance_again: false,
            }),
            ctx,
        }
    }

    /// Insert an item, re-sort, and attempt advancement. Returns false if a
    /// task with the same id is already queued or running.
    pub fn add(&self, item: EnqueueItem) -> bool {
        {
            let mut st = self.state.lock().unwrap();
            let id = &item.task.id;
            if st.running.contains_key(id) || st.queue.iter().any(|i| &i.task.id == id) {
                return false;
            }
            st.queue.push(item);
            st.queue.sort_by_key(EnqueueItem::sort_key);
        }
        self.advance();
        true
    }

    /// Release the slot held by a finished task and attempt advancement.
    /// A no-op for unknown ids (late completion after cancel or reconcile).
    pub fn task_finished(&self, id: &str) {
        let released = {
            let mut st = self.state.lock().unwrap();
            match st.running.remove(id) {
                Some(slot) => {
                    let host = slot.host.clone();
                    st.counters.release(host.as_deref(), &slot.task.group);
                    true
                }
                None => false,
            }
        };
        if released {
            self.advance();
        }
    }

    /// Remove matching queued items (emitting `Canceled` for each) and signal
    /// cancel to matching running workers. Returns the affected ids.
    pub fn cancel_tasks_with_ids(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let mut affected = Vec::new();
        let mut canceled_items = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            let mut kept = Vec::with_capacity(st.queue.len());
            for item in st.queue.drain(..) {
                if ids.contains(&item.task.id) {
                    affected.push(item.task.id.clone());
                    canceled_items.push(item);
                } else {
                    kept.push(item);
                }
            }
            st.queue = kept;
            for id in ids {
                if let Some(slot) = st.running.get(id) {
                    slot.worker.request_cancel();
                    affected.push(id.clone());
                }
            }
        }
        for item in canceled_items {
            self.emit_canceled(item.task);
        }
        affected
    }

    /// Silently remove queued items (no status emission). Used by the chunk
    /// coordinator when pausing chunks that never started.
    pub(crate) fn take_queued(&self, ids: &[TaskId]) -> Vec<EnqueueItem> {
        let mut st = self.state.lock().unwrap();
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(st.queue.len());
        for item in st.queue.drain(..) {
            if ids.contains(&item.task.id) {
                taken.push(item);
            } else {
                kept.push(item);
            }
        }
        st.queue = kept;
        taken
    }

    /// Set the pause flag on a running worker. False when the task is not
    /// running or does not allow pausing.
    pub fn request_pause(&self, id: &str) -> bool {
        let st = self.state.lock().unwrap();
        match st.running.get(id) {
            Some(slot) if slot.task.allow_pause => {
                slot.worker.request_pause();
                true
            }
            _ => false,
        }
    }

    pub fn task_for_id(&self, id: &str) -> Option<Task> {
        let st = self.state.lock().unwrap();
        st.running
            .get(id)
            .map(|s| s.task.clone())
            .or_else(|| st.queue.iter().find(|i| i.task.id == id).map(|i| i.task.clone()))
    }

    /// Snapshot of queued and running tasks, optionally filtered by group.
    pub fn all_tasks(&self, group: Option<&str>) -> Vec<Task> {
        let st = self.state.lock().unwrap();
        st.queue
            .iter()
            .map(|i| &i.task)
            .chain(st.running.values().map(|s| &s.task))
            .filter(|t| group.map_or(true, |g| t.group == g))
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    /// Recompute ground-truth counters from workers that are actually alive,
    /// dropping slots whose completion signal was lost, then advance.
    pub fn reconcile(&self) {
        {
            let mut st = self.state.lock().unwrap();
            let before = st.running.len();
            st.running.retain(|_, slot| !slot.worker.is_finished());
            let mut counters = Counters::default();
            for slot in st.running.values() {
                counters.admit(slot.host.as_deref(), &slot.task.group);
            }
            st.counters = counters;
            let dropped = before - st.running.len();
            if dropped > 0 {
                tracing::debug!(dropped, "reconcile dropped finished workers");
            }
        }
        self.advance();
    }

    /// Attempt to dispatch queued items. Reentrant: a call arriving while a
    /// pass is in flight records the request and returns; the running pass
    /// loops until no request is pending.
    pub fn advance(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.advancing {
                st.advance_again = true;
                return;
            }
            st.advancing = true;
        }
        loop {
            self.advance_pass();
            let mut st = self.state.lock().unwrap();
            if st.advance_again {
                st.advance_again = false;
                continue;
            }
            st.advancing = false;
            break;
        }
    }

    /// One advancement pass: walk the queue in priority order, dispatch every
    /// admissible item, and re-insert the set-aside rest (order preserved).
    fn advance_pass(&self) {
        let mut st = self.state.lock().unwrap();
        let mut held_back = Vec::with_capacity(st.queue.len());
        let drained: Vec<EnqueueItem> = st.queue.drain(..).collect();
        for item in drained {
            let host = item.task.host();
            if would_admit(&self.limits, &st.counters, host.as_deref(), &item.task.group) {
                st.counters.admit(host.as_deref(), &item.task.group);
                self.dispatch_locked(&mut st, item, host);
            } else {
                held_back.push(item);
            }
        }
        st.queue = held_back;
    }

    /// Start a worker for an admitted item. On dispatch failure the slot is
    /// released as if the task had finished and an immediate `Failed` status
    /// is emitted.
    fn dispatch_locked(&self, st: &mut QueueState, item: EnqueueItem, host: Option<String>) {
        let task = item.task.clone();
        let final_path = match self.ctx.resolver.resolve(&task.destination) {
            Ok(p) => p,
            Err(e) => {
                st.counters.release(host.as_deref(), &task.group);
                tracing::warn!(task = %task.id, "dispatch failed: {}", e);
                let _ = self.ctx.events.send(WorkerMessage::status(
                    task.clone(),
                    StatusUpdate::failed(task, e),
                ));
                return;
            }
        };
        tracing::debug!(task = %task.id, path = %final_path.display(), "dispatching");
        let worker = spawn_worker(
            task.clone(),
            final_path,
            item.resume,
            Arc::clone(&self.ctx.transport),
            self.ctx.events.clone(),
        );
        st.running.insert(task.id.clone(), RunningSlot { task, host, worker });
    }

    fn emit_canceled(&self, task: Task) {
        let _ = self.ctx.events.send(WorkerMessage::status(
            task.clone(),
            StatusUpdate::new(task, TaskStatus::Canceled),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::message::WorkerEvent;
    use crate::task::{BaseDir, Destination};
    use crate::transport::{FetchControl, FetchOutcome, FetchRequest, ProbeResult, ProgressFn};
    use std::path::PathBuf;
    use std::time::Duration;

    struct SlowTransport {
        delay: Duration,
    }

    impl Transport for SlowTransport {
        fn probe(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<ProbeResult, TransferError> {
            Ok(ProbeResult {
                status_code: 200,
                content_length: Some(1),
                accept_ranges: true,
                etag: None,
                last_modified: None,
            })
        }

        fn fetch(
            &self,
            request: &FetchRequest,
            control: &FetchControl,
            _progress: ProgressFn<'_>,
        ) -> Result<FetchOutcome, TransferError> {
            let waited = std::time::Instant::now();
            while waited.elapsed() < self.delay {
                if control.cancel_requested() {
                    return Ok(FetchOutcome::Canceled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            std::fs::write(&request.dest, b"x").map_err(|e| TransferError::filesystem(&e))?;
            Ok(FetchOutcome::Complete {
                response_headers: HashMap::new(),
                response_body: None,
            })
        }
    }

    struct TempResolver(PathBuf);

    impl BaseDirResolver for TempResolver {
        fn resolve_base(&self, _base: BaseDir) -> Result<PathBuf, TransferError> {
            Ok(self.0.clone())
        }
    }

    fn test_queue(
        max_concurrent: Option<usize>,
        dir: &std::path::Path,
    ) -> (
        Arc<HoldingQueue>,
        tokio::sync::mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cfg = SchedulerConfig {
            max_concurrent,
            ..SchedulerConfig::default()
        };
        let queue = Arc::new(HoldingQueue::new(
            &cfg,
            DispatchContext {
                transport: Arc::new(SlowTransport {
                    delay: Duration::from_millis(80),
                }),
                resolver: Arc::new(TempResolver(dir.to_path_buf())),
                events: tx,
            },
        ));
        (queue, rx)
    }

    fn task(id: &str) -> Task {
        Task::new(
            id,
            format!("https://host.example/{id}"),
            Destination::new(BaseDir::Downloads, "", id),
        )
    }

    #[tokio::test]
    async fn global_ceiling_limits_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, mut rx) = test_queue(Some(2), dir.path());

        for id in ["a", "b", "c"] {
            assert!(queue.add(EnqueueItem::new(task(id))));
        }
        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.all_tasks(None).len(), 3);

        // Drain events, releasing slots on terminal statuses like the
        // dispatcher would.
        let mut completed = 0;
        while completed < 3 {
            let msg = rx.recv().await.expect("event");
            if let WorkerEvent::Status(s) = &msg.event {
                if s.status.is_terminal() {
                    queue.task_finished(&msg.task.id);
                    completed += 1;
                }
            }
            assert!(queue.running_count() <= 2, "ceiling violated");
        }
        assert!(queue.all_tasks(None).is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _rx) = test_queue(Some(1), dir.path());
        assert!(queue.add(EnqueueItem::new(task("dup"))));
        assert!(!queue.add(EnqueueItem::new(task("dup"))));
    }

    #[tokio::test]
    async fn cancel_removes_queued_and_emits_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, mut rx) = test_queue(Some(1), dir.path());
        queue.add(EnqueueItem::new(task("run")));
        queue.add(EnqueueItem::new(task("wait")));
        assert_eq!(queue.running_count(), 1);

        let affected = queue.cancel_tasks_with_ids(&["wait".to_string()]);
        assert_eq!(affected, vec!["wait".to_string()]);

        // Queued cancel shows up as a Canceled status event.
        let mut saw_canceled = false;
        while let Ok(msg) = rx.try_recv() {
            if let WorkerEvent::Status(s) = &msg.event {
                if msg.task.id == "wait" && s.status == TaskStatus::Canceled {
                    saw_canceled = true;
                }
            }
        }
        assert!(saw_canceled);
    }

    #[test]
    fn would_admit_checks_all_ceilings() {
        let limits = Limits {
            total: Some(4),
            per_host: Some(2),
            per_group: Some(3),
        };
        let mut counters = Counters::default();
        counters.admit(Some("h1"), "g1");
        counters.admit(Some("h1"), "g1");

        assert!(!would_admit(&limits, &counters, Some("h1"), "g2"));
        assert!(would_admit(&limits, &counters, Some("h2"), "g1"));
        counters.admit(Some("h2"), "g1");
        assert!(!would_admit(&limits, &counters, Some("h3"), "g1"));
        assert!(would_admit(&limits, &counters, Some("h3"), "g2"));
    }

    #[test]
    fn counters_release_cleans_up_maps() {
        let mut counters = Counters::default();
        counters.admit(Some("h"), "g");
        counters.release(Some("h"), "g");
        assert_eq!(counters.total, 0);
        assert!(counters.by_host.is_empty());
        assert!(counters.by_group.is_empty());
    }
}
