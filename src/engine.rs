use crate::dispatch::Dispatcher;
use crate::privilege::Helper;
use crate::process_group::{self, Signal};
use crate::queue::TaskQueue;
use crate::runtime::Runtime;
use crate::types::task::TaskDescriptor;
use crate::util::{self, Utf8Carry};
use crate::{Error, PrivilegeSource, Result, TaskEventKind, TaskOutput};

use futures_lite::future;
use futures_lite::io::{AsyncRead, AsyncReadExt};
use futures_util::FutureExt;

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Single consumer of the task queue.
///
/// The engine thread is the only owner of a live privileged subprocess; at most one exists at any
/// time because tasks are executed strictly one after another on this thread.
#[derive(Debug)]
pub(crate) struct Engine {
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) privilege: PrivilegeSource,
    pub(crate) output_max_bytes: usize,
    pub(crate) read_chunk_bytes: usize,
    pub(crate) kill_grace: Duration,
}

/// How a task left the `Running` state, before cancellation bookkeeping is applied.
#[derive(Debug)]
enum Outcome {
    Exited {
        exit_code: Option<i32>,
        output: String,
        truncated: bool,
    },
    Failed(Error),
    Cancelled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StopReason {
    Deadline,
    Cancel,
}

enum Step {
    Deadline,
    Cancel,
    Stdout(std::io::Result<usize>),
    Stderr(std::io::Result<usize>),
}

enum Wait {
    Deadline,
    Cancel,
    Exited(std::io::Result<std::process::ExitStatus>),
}

/// Merged stdout/stderr of the running task.
struct Collected {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl Engine {
    pub(crate) fn spawn(self, rt: Runtime, thread_name: String) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || self.run(&rt))
            .map_err(|e| Error::IoError {
                context: format!("spawn engine thread: {e}"),
            })
    }

    fn run(self, rt: &Runtime) {
        while let Some((task, cancel_rx)) = self.queue.next() {
            #[cfg(feature = "tracing")]
            tracing::debug!(task_id = %task.id, pending = self.queue.pending_len(), "task dequeued");

            let outcome = rt.block_on(self.execute(&task, &cancel_rx));
            self.finalize(task, outcome);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("engine stopped");
    }

    /// Clear the running slot and emit exactly one terminal event.
    ///
    /// A cancellation accepted before the engine observed an outcome wins over that outcome; once
    /// the engine has observed one, `cancel()` no longer finds the task. A command that could not
    /// be stopped is always reported as such.
    fn finalize(&self, task: TaskDescriptor, outcome: Outcome) {
        let cancel_accepted = self.queue.finish(task.id);

        let kind = match outcome {
            Outcome::Failed(error @ Error::KillFailed { .. }) => TaskEventKind::Failed { error },
            _ if cancel_accepted => TaskEventKind::Cancelled,
            Outcome::Cancelled => TaskEventKind::Cancelled,
            Outcome::Exited {
                exit_code: Some(0),
                output,
                truncated,
            } => TaskEventKind::Finished {
                output: TaskOutput {
                    exit_code: 0,
                    output,
                    truncated,
                },
            },
            Outcome::Exited {
                exit_code, output, ..
            } => TaskEventKind::Failed {
                error: Error::NonZeroExit {
                    command: task.command.clone(),
                    exit_code,
                    output,
                },
            },
            Outcome::Failed(error) => TaskEventKind::Failed { error },
        };

        #[cfg(feature = "tracing")]
        match &kind {
            TaskEventKind::Failed { error } => {
                tracing::warn!(task_id = %task.id, command = %task.command, %error, "privileged task failed");
            }
            other => {
                tracing::info!(task_id = %task.id, command = %task.command, outcome = other.as_str(), "privileged task done");
            }
        }

        self.dispatcher.emit(task.id, kind, &task.route);
    }

    async fn execute(
        &self,
        task: &TaskDescriptor,
        cancel_rx: &async_channel::Receiver<()>,
    ) -> Outcome {
        let Some(helper) = Helper::from_source(&self.privilege) else {
            return Outcome::Failed(Error::NoPrivilegeMethod);
        };
        if cancel_rx.try_recv().is_ok() {
            return Outcome::Cancelled;
        }

        let program = helper.program.display().to_string();
        let mut cmd = process_group::command_in_new_group(helper.program.as_os_str());
        cmd.args(helper.argv(&task.command, &task.args))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Outcome::Failed(Error::launch_failure(program, &e)),
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            task_id = %task.id,
            helper = %program,
            method = helper.method.as_str(),
            pid = child.id(),
            command = %crate::types::task::command_line(&task.command, &task.args),
            timeout = ?task.timeout,
            "privileged task started"
        );

        self.dispatcher.emit(
            task.id,
            TaskEventKind::Started {
                description: task.description.clone(),
            },
            &task.route,
        );

        self.supervise(task, &helper, &mut child, cancel_rx).await
    }

    async fn supervise(
        &self,
        task: &TaskDescriptor,
        helper: &Helper,
        child: &mut async_process::Child,
        cancel_rx: &async_channel::Receiver<()>,
    ) -> Outcome {
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = vec![0u8; self.read_chunk_bytes];
        let mut err_buf = vec![0u8; self.read_chunk_bytes];
        let mut out_text = Utf8Carry::default();
        let mut err_text = Utf8Carry::default();
        let mut collected = Collected {
            bytes: Vec::new(),
            cap: self.output_max_bytes,
            truncated: false,
        };

        // Fixed wall-clock deadline; output does not extend it.
        let mut deadline = crate::runtime::sleep(task.timeout).fuse();

        while stdout.is_some() || stderr.is_some() {
            let step = futures_util::select_biased! {
                _ = deadline => Step::Deadline,
                _ = cancel_signal(cancel_rx).fuse() => Step::Cancel,
                n = read_chunk(&mut stdout, &mut out_buf).fuse() => Step::Stdout(n),
                n = read_chunk(&mut stderr, &mut err_buf).fuse() => Step::Stderr(n),
            };

            match step {
                Step::Deadline => return self.stop(task, helper, child, StopReason::Deadline).await,
                Step::Cancel => return self.stop(task, helper, child, StopReason::Cancel).await,
                Step::Stdout(Ok(n)) if n > 0 => {
                    self.on_output(task, &out_buf[..n], &mut out_text, &mut collected);
                }
                Step::Stderr(Ok(n)) if n > 0 => {
                    self.on_output(task, &err_buf[..n], &mut err_text, &mut collected);
                }
                Step::Stdout(_) => {
                    stdout = None;
                    self.emit_progress(task, &out_text.finish());
                }
                Step::Stderr(_) => {
                    stderr = None;
                    self.emit_progress(task, &err_text.finish());
                }
            }
        }

        let wait = futures_util::select_biased! {
            _ = deadline => Wait::Deadline,
            _ = cancel_signal(cancel_rx).fuse() => Wait::Cancel,
            status = child.status().fuse() => Wait::Exited(status),
        };

        match wait {
            Wait::Deadline => self.stop(task, helper, child, StopReason::Deadline).await,
            Wait::Cancel => self.stop(task, helper, child, StopReason::Cancel).await,
            Wait::Exited(status) => {
                self.queue.begin_finish(task.id);
                match status {
                    Ok(status) => Outcome::Exited {
                        exit_code: status.code(),
                        output: String::from_utf8_lossy(&collected.bytes).into_owned(),
                        truncated: collected.truncated,
                    },
                    Err(e) => Outcome::Failed(Error::IoError {
                        context: format!("wait for {}: {e}", task.command),
                    }),
                }
            }
        }
    }

    /// Stop the running command after a deadline or cancellation.
    ///
    /// The engine waits at most a few grace periods; a command that survives every attempt is
    /// reported as `KillFailed` and the queue moves on.
    async fn stop(
        &self,
        task: &TaskDescriptor,
        helper: &Helper,
        child: &mut async_process::Child,
        reason: StopReason,
    ) -> Outcome {
        if reason == StopReason::Deadline {
            self.queue.begin_finish(task.id);
        }

        let terminator = HelperTerminator {
            helper,
            grace: self.kill_grace,
        };
        if let Err(detail) = terminate(child, &terminator, self.kill_grace).await {
            return Outcome::Failed(Error::KillFailed {
                command: task.command.clone(),
                detail,
            });
        }

        match reason {
            StopReason::Cancel => Outcome::Cancelled,
            StopReason::Deadline => {
                #[cfg(feature = "tracing")]
                tracing::warn!(task_id = %task.id, command = %task.command, timeout = ?task.timeout, "privileged task timed out; killed");

                Outcome::Failed(Error::Timeout {
                    command: task.command.clone(),
                    timeout: task.timeout,
                })
            }
        }
    }

    fn on_output(
        &self,
        task: &TaskDescriptor,
        chunk: &[u8],
        carry: &mut Utf8Carry,
        collected: &mut Collected,
    ) {
        if util::push_limited(&mut collected.bytes, chunk, collected.cap) {
            collected.truncated = true;
        }
        self.emit_progress(task, &carry.decode(chunk));
    }

    fn emit_progress(&self, task: &TaskDescriptor, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.dispatcher.emit(
            task.id,
            TaskEventKind::Progress {
                text: text.to_string(),
            },
            &task.route,
        );
    }
}

/// Ways of stopping a helper's process group.
pub(crate) trait Terminator {
    fn signal_group(&self, pgid: u32, signal: Signal) -> io::Result<()>;

    /// Kill the group with the helper's privileges, for members this process may not signal.
    async fn escalated_kill(&self, pgid: u32) -> io::Result<()>;
}

struct HelperTerminator<'a> {
    helper: &'a Helper,
    grace: Duration,
}

impl Terminator for HelperTerminator<'_> {
    fn signal_group(&self, pgid: u32, signal: Signal) -> io::Result<()> {
        process_group::signal_group(pgid, signal)
    }

    async fn escalated_kill(&self, pgid: u32) -> io::Result<()> {
        let args = ["-KILL".to_string(), "--".to_string(), format!("-{pgid}")];
        let mut cmd = async_process::Command::new(&self.helper.program);
        cmd.args(self.helper.argv("kill", &args))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        #[cfg(feature = "tracing")]
        tracing::warn!(pgid, helper = %self.helper.program.display(), "signals refused; killing through the helper");

        let status = futures_util::select_biased! {
            status = child.status().fuse() => status?,
            _ = crate::runtime::sleep(self.grace).fuse() => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "helper kill did not finish"));
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("helper kill exited with {status}")))
        }
    }
}

/// Stop every process in the child's group and reap the child.
///
/// `SIGTERM` comes first because `sudo` relays it to the command it runs; `SIGKILL` follows after
/// `grace`. Members this process is not allowed to signal (a command `pkexec` runs as root) are
/// killed through the helper. Every wait is bounded by `grace`.
pub(crate) async fn terminate<T: Terminator>(
    child: &mut async_process::Child,
    terminator: &T,
    grace: Duration,
) -> std::result::Result<(), String> {
    let pgid = child.id();

    let term = terminator.signal_group(pgid, Signal::Term);
    let mut reaped = term.is_ok() && reaped_within(child, grace).await;
    let mut kill = Ok(());
    if !reaped {
        kill = terminator.signal_group(pgid, Signal::Kill);
        reaped = kill.is_ok() && reaped_within(child, grace).await;
    }
    // The leader exiting does not mean the group did: `sudo` can leave a root-owned child behind.
    if reaped && !unreachable_members(terminator, pgid, grace).await {
        return Ok(());
    }

    let escalated = terminator.escalated_kill(pgid).await;
    if (reaped || reaped_within(child, grace).await)
        && !unreachable_members(terminator, pgid, grace).await
    {
        return Ok(());
    }

    let mut detail = match kill {
        Ok(()) => "still running after SIGKILL".to_string(),
        Err(e) => format!("SIGKILL refused: {e}"),
    };
    match escalated {
        Ok(()) => detail.push_str("; still running after kill through the helper"),
        Err(e) => detail.push_str(&format!("; kill through the helper failed: {e}")),
    }
    Err(detail)
}

async fn reaped_within(child: &mut async_process::Child, grace: Duration) -> bool {
    futures_util::select_biased! {
        status = child.status().fuse() => status.is_ok(),
        _ = crate::runtime::sleep(grace).fuse() => false,
    }
}

/// Whether processes this one may not signal remain in `pgid` after `grace`.
///
/// Freshly killed members can linger briefly until their new parent reaps them.
async fn unreachable_members<T: Terminator>(terminator: &T, pgid: u32, grace: Duration) -> bool {
    let poll = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    loop {
        match terminator.signal_group(pgid, Signal::Exists) {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
            _ => return false,
        }
        if waited >= grace {
            return true;
        }
        crate::runtime::sleep(poll).await;
        waited += poll;
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => future::pending().await,
    }
}

async fn cancel_signal(rx: &async_channel::Receiver<()>) {
    if rx.recv().await.is_err() {
        future::pending::<()>().await;
    }
}
