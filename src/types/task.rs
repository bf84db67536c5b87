use crate::TaskReceiver;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task identifier.
///
/// Ids are assigned at submission time, increase monotonically and are never reused, even across
/// multiple `Executor` instances.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request for privileged execution of one command.
///
/// `command` is the program run under escalation (e.g. `"dnf"`), `args` are passed verbatim and
/// positionally; no shell is involved.
#[derive(Clone, Default)]
#[non_exhaustive]
pub struct TaskRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Human readable label for status displays. Defaults to the command line.
    pub description: Option<String>,
    /// Wall-clock deadline from start. Defaults to `ExecutorOptions::default_timeout`.
    pub timeout: Option<Duration>,
    /// Direct notification target, in addition to the broadcast channel.
    pub receiver: Option<Arc<dyn TaskReceiver>>,
}

impl TaskRequest {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn receiver(mut self, receiver: Arc<dyn TaskReceiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Like `receiver`, but accepts the optional receiver the convenience operations take.
    pub fn receiver_opt(mut self, receiver: Option<Arc<dyn TaskReceiver>>) -> Self {
        self.receiver = receiver;
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .field("receiver", &self.receiver.is_some())
            .finish()
    }
}

/// Successful (or at least completed) command output.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct TaskOutput {
    pub exit_code: i32,
    /// Merged stdout/stderr in arrival order (bounded by `ExecutorOptions::output_max_bytes`).
    pub output: String,
    /// Whether `output` was cut at the configured limit.
    pub truncated: bool,
}

/// Immutable record of one queued unit of privileged work.
pub(crate) struct TaskDescriptor {
    pub(crate) id: TaskId,
    pub(crate) command: String,
    pub(crate) args: Vec<String>,
    pub(crate) description: String,
    pub(crate) timeout: Duration,
    pub(crate) route: crate::dispatch::Route,
    /// Resources that must outlive the subprocess (e.g. a staged source file).
    pub(crate) _staged: Option<tempfile::TempPath>,
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub(crate) fn command_line(command: &str, args: &[String]) -> String {
    let mut out = command.to_string();
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}
