//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task (or of one chunk's sub-task).
///
/// Transitions: `Enqueued → Running → {Complete, NotFound, Failed, Canceled}`,
/// plus `Running → Paused → Enqueued` (resume re-admits) and
/// `Failed → WaitingToRetry → Enqueued` while retries remain. Queued tasks can
/// be canceled before dispatch (`Enqueued → Canceled`) and fail to dispatch
/// (`Enqueued → Failed`). Terminal statuses are immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Enqueued,
    Running,
    Complete,
    NotFound,
    Failed,
    Canceled,
    Paused,
    WaitingToRetry,
}

impl TaskStatus {
    /// Terminal statuses never change again; the task is dropped from all
    /// in-memory structures the instant one is reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete
                | TaskStatus::NotFound
                | TaskStatus::Failed
                | TaskStatus::Canceled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Enqueued => matches!(next, Running | Canceled | Failed),
            Running => matches!(next, Complete | NotFound | Failed | Canceled | Paused),
            Paused => matches!(next, Enqueued | Canceled),
            Failed => matches!(next, WaitingToRetry),
            WaitingToRetry => matches!(next, Enqueued | Canceled),
            Complete | NotFound | Canceled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Enqueued => "enqueued",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::NotFound => "notFound",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Paused => "paused",
            TaskStatus::WaitingToRetry => "waitingToRetry",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
