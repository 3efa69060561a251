//! Worker unit: executes exactly one task's network exchange.
//!
//! A worker is a tokio task wrapping one blocking transport call. It talks to
//! the scheduler only through message passing: status/progress/resume events
//! out on the shared channel, cancel/pause flags in. A panic anywhere inside
//! the transport is caught at the join boundary and becomes a `Failed` status
//! instead of taking the scheduler down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::chunk::ChunkMetadata;
use crate::error::TransferError;
use crate::message::{ProgressUpdate, ResumeData, StatusUpdate, WorkerEvent, WorkerMessage};
use crate::storage;
use crate::task::{Task, TaskId, TaskStatus};
use crate::transport::{FetchControl, FetchOutcome, FetchRequest, Transport};

/// Minimum spacing between progress events emitted by one worker. The
/// dispatcher throttles again before delivery; this just keeps the channel
/// from flooding.
const PROGRESS_EMIT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Handle held by the admission controller for one running worker.
pub struct WorkerHandle {
    pub task_id: TaskId,
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    /// True once the worker's tokio task has exited (its terminal event may
    /// still be in flight on the channel).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Spawn a worker for `task`, transferring into `final_path` (plain tasks go
/// through a `.part` file; chunk sub-tasks write their spool file directly).
pub(crate) fn spawn_worker(
    task: Task,
    final_path: PathBuf,
    resume: Option<ResumeData>,
    transport: Arc<dyn Transport>,
    events: UnboundedSender<WorkerMessage>,
) -> WorkerHandle {
    let cancel = Arc::new(AtomicBool::new(false));
    let pause = Arc::new(AtomicBool::new(false));
    let task_id = task.id.clone();
    let join = tokio::spawn(run_worker(
        task,
        final_path,
        resume,
        transport,
        events,
        Arc::clone(&cancel),
        Arc::clone(&pause),
    ));
    WorkerHandle {
        task_id,
        cancel,
        pause,
        join,
    }
}

async fn run_worker(
    task: Task,
    final_path: PathBuf,
    resume: Option<ResumeData>,
    transport: Arc<dyn Transport>,
    events: UnboundedSender<WorkerMessage>,
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
) {
    let send = |event: WorkerEvent| {
        let _ = events.send(WorkerMessage {
            task: task.clone(),
            event,
        });
    };

    send(WorkerEvent::Status(StatusUpdate::new(
        task.clone(),
        TaskStatus::Running,
    )));

    let start_byte = resume.as_ref().map(|r| r.start_byte).unwrap_or(0);

    // A resumed chunk whose whole range is already on disk has nothing left
    // to fetch; re-requesting would append a duplicate copy to the spool file.
    if chunk_range_on_disk(&task, start_byte) {
        send(WorkerEvent::Progress(ProgressUpdate::new(task.clone(), 1.0)));
        send(WorkerEvent::Status(StatusUpdate::new(
            task.clone(),
            TaskStatus::Complete,
        )));
        return;
    }

    let request = match build_request(&task, &final_path, resume) {
        Ok(r) => r,
        Err(e) => {
            send(WorkerEvent::Status(StatusUpdate::failed(task.clone(), e)));
            return;
        }
    };

    // First progress sample: resumed transfers report their on-disk fraction.
    let initial = initial_progress(&task, start_byte);
    send(WorkerEvent::Progress(ProgressUpdate::new(task.clone(), initial)));

    let started = Instant::now();
    let result = {
        let transport = Arc::clone(&transport);
        let events = events.clone();
        let task_cb = task.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || {
            let control = FetchControl::new(cancel, pause);
            let last_emit: Mutex<Option<Instant>> = Mutex::new(None);
            let progress = move |session_bytes: u64, session_total: Option<u64>| {
                let now = Instant::now();
                let mut last = last_emit.lock().unwrap();
                if last.map_or(false, |t| now - t < PROGRESS_EMIT_INTERVAL) {
                    return;
                }
                *last = Some(now);
                drop(last);

                let done = start_byte + session_bytes;
                let expected = session_total.map(|t| start_byte + t);
                let fraction = expected
                    .filter(|&t| t > 0)
                    .map(|t| (done as f64 / t as f64).min(1.0))
                    .unwrap_or(0.0);
                let elapsed = started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    session_bytes as f64 / elapsed
                } else {
                    0.0
                };
                let eta = expected.and_then(|t| {
                    let remaining = t.saturating_sub(done);
                    if rate > 0.0 {
                        Some(remaining as f64 / rate)
                    } else {
                        None
                    }
                });
                let _ = events.send(WorkerMessage {
                    task: task_cb.clone(),
                    event: WorkerEvent::Progress(ProgressUpdate {
                        task: task_cb.clone(),
                        progress: fraction,
                        expected_size: expected,
                        bytes_per_sec: rate,
                        eta_secs: eta,
                    }),
                });
            };
            transport.fetch(&request, &control, &progress)
        })
        .await
    };

    match result {
        Err(join_err) => {
            // Worker crash: caught here, never propagated.
            tracing::error!(task = %task.id, "worker panicked: {}", join_err);
            send(WorkerEvent::Status(StatusUpdate::failed(
                task.clone(),
                TransferError::Internal(join_err.to_string()),
            )));
        }
        Ok(Err(e)) => {
            let update = StatusUpdate::failed(task.clone(), e);
            send(WorkerEvent::Status(update));
        }
        Ok(Ok(outcome)) => match outcome {
            FetchOutcome::Complete {
                response_headers,
                response_body,
            } => {
                if let Err(e) = finalize(&task, &request.dest, &final_path) {
                    send(WorkerEvent::Status(StatusUpdate::failed(task.clone(), e)));
                    return;
                }
                send(WorkerEvent::Progress(ProgressUpdate::new(task.clone(), 1.0)));
                let mut update = StatusUpdate::new(task.clone(), TaskStatus::Complete);
                update.response_headers = Some(response_headers);
                update.response_body = response_body;
                send(WorkerEvent::Status(update));
            }
            FetchOutcome::NotFound { response_body } => {
                let mut update = StatusUpdate::new(task.clone(), TaskStatus::NotFound);
                update.response_body = response_body;
                send(WorkerEvent::Status(update));
            }
            FetchOutcome::Paused {
                token,
                start_byte,
                validator,
            } => {
                send(WorkerEvent::Resume(ResumeData {
                    task_id: task.id.clone(),
                    token,
                    start_byte,
                    validator,
                }));
                send(WorkerEvent::Status(StatusUpdate::new(
                    task.clone(),
                    TaskStatus::Paused,
                )));
            }
            FetchOutcome::Canceled => {
                send(WorkerEvent::Status(StatusUpdate::new(
                    task.clone(),
                    TaskStatus::Canceled,
                )));
            }
        },
    }
}

/// Build the fetch request: plain tasks write a `.part` file next to the
/// destination; chunk sub-tasks write their spool file directly, with the
/// server range derived from their metadata plus the resume offset.
fn build_request(
    task: &Task,
    final_path: &std::path::Path,
    resume: Option<ResumeData>,
) -> Result<FetchRequest, TransferError> {
    let start_byte = resume.as_ref().map(|r| r.start_byte).unwrap_or(0);
    let validator = resume.and_then(|r| r.validator);

    let (dest, range) = if task.is_chunk() {
        let meta = ChunkMetadata::parse(&task.metadata).ok_or_else(|| {
            TransferError::Internal(format!("chunk task {} has no parent metadata", task.id))
        })?;
        (
            final_path.to_path_buf(),
            Some((meta.from + start_byte, meta.to)),
        )
    } else {
        (storage::part_path(final_path), None)
    };

    Ok(FetchRequest {
        url: task.primary_url().to_string(),
        method: task.method.clone(),
        headers: task.headers.clone(),
        body: task.body.clone(),
        dest,
        start_byte,
        range,
        validator,
        allow_pause: task.allow_pause,
    })
}

/// True when `task` is a chunk sub-task resumed past the end of its range.
fn chunk_range_on_disk(task: &Task, start_byte: u64) -> bool {
    if !task.is_chunk() || start_byte == 0 {
        return false;
    }
    ChunkMetadata::parse(&task.metadata)
        .map_or(false, |meta| meta.from + start_byte > meta.to)
}

fn initial_progress(task: &Task, start_byte: u64) -> f64 {
    if start_byte == 0 {
        return 0.0;
    }
    if task.is_chunk() {
        if let Some(meta) = ChunkMetadata::parse(&task.metadata) {
            let len = meta.to - meta.from + 1;
            if len > 0 {
                return (start_byte as f64 / len as f64).min(1.0);
            }
        }
    }
    0.0
}

/// Plain tasks finish by renaming the `.part` file onto the destination;
/// chunk spool files stay in place for the stitch phase.
fn finalize(
    task: &Task,
    written_path: &std::path::Path,
    final_path: &std::path::Path,
) -> Result<(), TransferError> {
    if task.is_chunk() {
        return Ok(());
    }
    std::fs::rename(written_path, final_path).map_err(|e| {
        TransferError::Filesystem(format!(
            "rename {} to {}: {}",
            written_path.display(),
            final_path.display(),
            e
        ))
    })
}
