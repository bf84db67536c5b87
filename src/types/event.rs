use crate::{Error, TaskId, TaskOutput};

use std::time::Instant;

/// One lifecycle event of a task, as seen on the broadcast channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TaskEvent {
    pub task_id: TaskId,
    /// When the engine (or `cancel`) produced the event, not when it was delivered.
    pub at: Instant,
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub(crate) fn new(task_id: TaskId, kind: TaskEventKind) -> Self {
        Self {
            task_id,
            at: Instant::now(),
            kind,
        }
    }

    /// Whether this is the last event the task will produce.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Event payloads.
///
/// Per task: `Started` at most once and first, then zero or more `Progress`, then exactly one of
/// `Finished`, `Failed` or `Cancelled`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum TaskEventKind {
    Started { description: String },
    Progress { text: String },
    Finished { output: TaskOutput },
    Failed { error: Error },
    Cancelled,
}

impl TaskEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEventKind::Finished { .. } | TaskEventKind::Failed { .. } | TaskEventKind::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Started { .. } => "started",
            TaskEventKind::Progress { .. } => "progress",
            TaskEventKind::Finished { .. } => "finished",
            TaskEventKind::Failed { .. } => "error",
            TaskEventKind::Cancelled => "cancelled",
        }
    }
}
