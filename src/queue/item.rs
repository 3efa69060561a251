//! Queue entries, ordered by `(priority, creation_time)` ascending.

use crate::message::ResumeData;
use crate::task::Task;

/// One entry awaiting a worker slot: the task, an opaque notification
/// descriptor carried through untouched (rendering is out of scope), and
/// resume data when the entry re-admits a paused transfer.
#[derive(Debug, Clone)]
pub struct EnqueueItem {
    pub task: Task,
    pub notification: Option<String>,
    pub resume: Option<ResumeData>,
}

impl EnqueueItem {
    pub fn new(task: Task) -> Self {
        EnqueueItem {
            task,
            notification: None,
            resume: None,
        }
    }

    pub fn with_resume(task: Task, resume: ResumeData) -> Self {
        EnqueueItem {
            task,
            notification: None,
            resume: Some(resume),
        }
    }

    /// Sort key: lower priority value first, then earlier creation.
    pub fn sort_key(&self) -> (i32, i64) {
        (self.task.priority, self.task.creation_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BaseDir, Destination};

    fn task(id: &str, priority: i32, created: i64) -> Task {
        let mut t = Task::new(
            id,
            "https://h/x",
            Destination::new(BaseDir::Downloads, "", "x"),
        );
        t.priority = priority;
        t.creation_time = created;
        t
    }

    #[test]
    fn priority_dominates_creation_time() {
        let mut items = vec![
            EnqueueItem::new(task("late-urgent", 0, 100)),
            EnqueueItem::new(task("early-lazy", 5, 1)),
            EnqueueItem::new(task("early-urgent", 0, 50)),
        ];
        items.sort_by_key(EnqueueItem::sort_key);
        let ids: Vec<_> = items.iter().map(|i| i.task.id.as_str()).collect();
        assert_eq!(ids, ["early-urgent", "late-urgent", "early-lazy"]);
    }

    #[test]
    fn ties_break_by_creation_time_only() {
        let mut items = vec![
            EnqueueItem::new(task("b", 3, 20)),
            EnqueueItem::new(task("a", 3, 10)),
        ];
        items.sort_by_key(EnqueueItem::sort_key);
        assert_eq!(items[0].task.id, "a");
    }
}
