use crate::TaskId;

use std::time::Duration;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by privexec APIs and carried by `TaskEventKind::Failed`.
///
/// This error model is designed to be:
/// - **Classifiable** (callers can branch on variants, e.g. to tell a timeout from a failed command),
/// - **Diagnosable** (includes the command, helper program or exit code involved),
/// - **Cloneable** (the same error is delivered to every observer of a task).
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Input validation failure (e.g. empty command, package name starting with `-`).
    #[error("invalid input: {context}")]
    InvalidInput { context: String },

    /// Neither `pkexec` nor `sudo` is available on this host.
    #[error("no privilege escalation method available")]
    NoPrivilegeMethod,

    /// The escalation helper could not be started (missing binary, exec permission denied).
    #[error("failed to launch {program}: {detail}")]
    LaunchFailure { program: String, detail: String },

    /// The privileged command ran and terminated unsuccessfully.
    ///
    /// `exit_code` is `None` when the process was terminated by a signal. `output` holds the merged
    /// stdout/stderr captured while the task ran.
    #[error("{command} exited with {}: {}", describe_exit(.exit_code), truncate_for_error(.output, 512))]
    NonZeroExit {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// The task deadline elapsed; the subprocess was killed.
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// A timed-out or cancelled command could not be stopped.
    ///
    /// Neither signalling the helper's process group nor a kill issued through the helper ended
    /// it within the grace period; the command may still be running.
    #[error("failed to stop {command}: {detail}")]
    KillFailed { command: String, detail: String },

    /// The task was cancelled before it reached a natural end.
    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: TaskId },

    /// The executor was shut down before the task could complete.
    #[error("executor is shut down")]
    Shutdown,

    /// Generic I/O or runtime error with context.
    #[error("io error: {context}")]
    IoError { context: String },
}

impl Error {
    pub(crate) fn invalid_input(context: impl Into<String>) -> Self {
        Self::InvalidInput {
            context: context.into(),
        }
    }

    pub(crate) fn launch_failure(program: impl Into<String>, err: &std::io::Error) -> Self {
        let detail = match err.kind() {
            std::io::ErrorKind::NotFound => format!("not found ({err})"),
            std::io::ErrorKind::PermissionDenied => format!("permission denied ({err})"),
            _ => err.to_string(),
        };
        Self::LaunchFailure {
            program: program.into(),
            detail,
        }
    }

    /// Whether this error was produced by a task deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match *exit_code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

fn truncate_for_error(input: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if input.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(input);
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!("{}...", &input[..end]))
}
