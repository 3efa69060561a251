//! Messages crossing the scheduler/worker boundary.
//!
//! Everything a worker unit tells the scheduler is one of these explicit
//! tagged unions; the only signals in the other direction are the cancel and
//! pause flags. Status and progress updates are also what consumers receive
//! (as `TaskUpdate`) and what the durable store persists.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TransferError;
use crate::task::{Task, TaskId, TaskStatus};

/// Opaque data sufficient to continue a paused transfer without restarting
/// from byte 0. Produced by a worker unit before it terminates with `Paused`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeData {
    pub task_id: TaskId,
    /// Opaque token; the default transport stores the part-file path, the
    /// chunk coordinator stores its serialized chunk states.
    pub token: String,
    /// Byte offset the transfer must continue from.
    pub start_byte: u64,
    /// Server validator (ETag/Last-Modified) for `If-Range`, when known.
    pub validator: Option<String>,
}

/// A status transition for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub task: Task,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<TransferError>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub response_headers: Option<HashMap<String, String>>,
}

impl StatusUpdate {
    pub fn new(task: Task, status: TaskStatus) -> Self {
        StatusUpdate {
            task,
            status,
            error: None,
            response_body: None,
            response_headers: None,
        }
    }

    pub fn failed(task: Task, error: TransferError) -> Self {
        StatusUpdate {
            task,
            status: TaskStatus::Failed,
            error: Some(error),
            response_body: None,
            response_headers: None,
        }
    }
}

/// A progress sample for one task; `progress` is in `[0.0, 1.0]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task: Task,
    pub progress: f64,
    #[serde(default)]
    pub expected_size: Option<u64>,
    /// Current transfer rate in bytes per second (0 when unknown).
    #[serde(default)]
    pub bytes_per_sec: f64,
    #[serde(default)]
    pub eta_secs: Option<f64>,
}

impl ProgressUpdate {
    pub fn new(task: Task, progress: f64) -> Self {
        ProgressUpdate {
            task,
            progress,
            expected_size: None,
            bytes_per_sec: 0.0,
            eta_secs: None,
        }
    }
}

/// Worker unit → dispatcher events. Terminal statuses double as the "done"
/// signal; a worker emits nothing after its terminal status.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Status(StatusUpdate),
    Progress(ProgressUpdate),
    Resume(ResumeData),
}

/// Envelope on the single event channel between all workers (and the chunk
/// coordinator) and the dispatcher loop.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub task: Task,
    pub event: WorkerEvent,
}

impl WorkerMessage {
    pub fn status(task: Task, update: StatusUpdate) -> Self {
        WorkerMessage {
            task,
            event: WorkerEvent::Status(update),
        }
    }
}

/// What an attached consumer receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskUpdate {
    Status(StatusUpdate),
    Progress(ProgressUpdate),
}

impl TaskUpdate {
    pub fn task(&self) -> &Task {
        match self {
            TaskUpdate::Status(s) => &s.task,
            TaskUpdate::Progress(p) => &p.task,
        }
    }
}
