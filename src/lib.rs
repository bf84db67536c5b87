//! privexec runs privileged commands (package installs, repository edits, service control, system
//! file writes) through the host's privilege escalation helper, one at a time, with lifecycle
//! events, per-task deadlines, cancellation and streamed progress.
//!
//! It is designed for desktop system-management tools: any number of UI components submit work
//! concurrently, submission never blocks, and the queue guarantees that at most one escalation
//! prompt is ever shown at once.
//!
//! Runtime is Linux/Unix oriented (`pkexec` or `sudo` on `PATH`). Without either helper every task
//! fails with `Error::NoPrivilegeMethod` and no subprocess is spawned.
//!
//! ## Quick start
//! ```no_run
//! use privexec::{Executor, TaskEventKind};
//!
//! fn install_vim() -> Result<(), privexec::Error> {
//!     let executor = Executor::start()?;
//!     let mut events = executor.subscribe();
//!     let id = executor.packages().install(&["vim"], None)?;
//!     while let Some(event) = events.next_blocking() {
//!         if event.task_id != id {
//!             continue;
//!         }
//!         if let TaskEventKind::Progress { text } = &event.kind {
//!             println!("{text}");
//!         }
//!         if event.is_terminal() {
//!             println!("{:?}", event.kind);
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Task lifecycle
//! Every task produces `Started` (once the helper process is running), zero or more `Progress`
//! events (one per chunk of output), and then exactly one of `Finished` (exit code 0), `Failed`
//! or `Cancelled`. Tasks that fail before launch (no helper, spawn error) skip `Started`.
//!
//! ## Helpers
//! - `pkexec <command> <args...>` is preferred.
//! - `sudo -n <command> <args...>` is the fallback; `-n` makes sudo fail rather than prompt.
//!
//! Detection runs once per process (see `privilege::resolve`).

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::dbg_macro)]

#[cfg(all(feature = "rt-async-io", feature = "rt-tokio"))]
compile_error!("features `rt-async-io` and `rt-tokio` are mutually exclusive; enable exactly one.");

#[cfg(not(any(feature = "rt-async-io", feature = "rt-tokio")))]
compile_error!(
    "missing runtime feature: enable one of `rt-async-io` or `rt-tokio` (default enables `rt-async-io`)."
);

mod dispatch;
mod engine;
mod error;
mod operations;
mod options;
pub mod privilege;
mod process_group;
mod queue;
mod runtime;
mod types;
mod util;

pub use crate::dispatch::{EventStream, TaskHandle, TaskReceiver};
pub use crate::error::{Error, Result};
pub use crate::operations::{Packages, Repositories, Services, SystemFiles};
pub use crate::options::{ExecutorOptions, PrivilegeSource};
pub use crate::privilege::PrivilegeMethod;
pub use crate::types::event::{TaskEvent, TaskEventKind};
pub use crate::types::task::{TaskId, TaskOutput, TaskRequest};

use crate::dispatch::{Dispatcher, Route};
use crate::queue::TaskQueue;
use crate::types::task::TaskDescriptor;

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Primary entrypoint: the privileged task queue and its worker.
///
/// Cloning is cheap; all clones share one queue. The worker stops when `shutdown` is called or the
/// last clone is dropped.
#[derive(Clone, Debug)]
pub struct Executor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    opts: ExecutorOptions,
    queue: Arc<TaskQueue>,
    dispatcher: Dispatcher,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Start an executor with default options.
    pub fn start() -> Result<Self> {
        Self::start_with(ExecutorOptions::default())
    }

    /// Start an executor with custom options (timeouts, helper selection, command names).
    pub fn start_with(opts: ExecutorOptions) -> Result<Self> {
        opts.validate()?;

        let (dispatcher, _dispatch_thread) =
            Dispatcher::start(format!("{}-dispatch", opts.thread_name_prefix))?;
        let queue = Arc::new(TaskQueue::default());

        let engine = engine::Engine {
            queue: queue.clone(),
            dispatcher: dispatcher.clone(),
            privilege: opts.privilege.clone(),
            output_max_bytes: opts.output_max_bytes,
            read_chunk_bytes: opts.read_chunk_bytes,
            kill_grace: opts.kill_grace,
        }
        .spawn(
            runtime::Runtime::new()?,
            format!("{}-engine", opts.thread_name_prefix),
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                opts,
                queue,
                dispatcher,
                engine: Mutex::new(Some(engine)),
            }),
        })
    }

    /// Options this executor was started with.
    pub fn options(&self) -> &ExecutorOptions {
        &self.inner.opts
    }

    /// Queue a task and return its id immediately.
    ///
    /// Fails only on invalid input or after shutdown; queue depth is unbounded.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        self.inner.enqueue(request, None, None)
    }

    /// Queue a task and return a handle that resolves to its terminal result.
    pub fn submit_tracked(&self, request: TaskRequest) -> Result<TaskHandle> {
        let (tx, rx) = async_channel::bounded(1);
        let id = self.inner.enqueue(request, None, Some(tx))?;
        Ok(TaskHandle { id, rx })
    }

    /// Run a task through the queue and wait for its result.
    pub async fn run(&self, request: TaskRequest) -> Result<TaskOutput> {
        self.submit_tracked(request)?.wait().await
    }

    /// Blocking variant of `run`. Do not call from a `TaskReceiver` callback.
    pub fn run_blocking(&self, request: TaskRequest) -> Result<TaskOutput> {
        self.submit_tracked(request)?.wait_blocking()
    }

    /// Cancel a running or queued task.
    ///
    /// A running task is killed by the engine; a queued task is removed without ever starting.
    /// Returns `false` when the id is unknown, already finished, or already being cancelled.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.inner.queue.cancel(task_id) {
            queue::Cancelled::NotFound => false,
            queue::Cancelled::Running => {
                #[cfg(feature = "tracing")]
                tracing::info!(%task_id, "cancelling running task");
                true
            }
            queue::Cancelled::Queued(task) => {
                #[cfg(feature = "tracing")]
                tracing::info!(%task_id, "cancelled queued task");
                self.inner
                    .dispatcher
                    .emit(task.id, TaskEventKind::Cancelled, &task.route);
                true
            }
        }
    }

    /// Cancel the running task and every queued task.
    pub fn cancel_all(&self) {
        let drained = self.inner.queue.cancel_all();
        self.inner.cancel_drained(drained);
    }

    /// Whether `task_id` is the task currently executing (queued tasks are not running).
    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.inner.queue.is_running(task_id)
    }

    /// Descriptions of the running task (first) and of every queued task, in execution order.
    pub fn list_running_descriptions(&self) -> Vec<String> {
        self.inner.queue.descriptions()
    }

    /// Number of queued tasks waiting behind the running one.
    pub fn pending_len(&self) -> usize {
        self.inner.queue.pending_len()
    }

    /// Subscribe to the events of every task submitted to this executor.
    pub fn subscribe(&self) -> EventStream {
        self.inner.dispatcher.subscribe()
    }

    /// Cancel everything, stop the worker and wait for it to exit.
    ///
    /// Later submissions fail with `Error::Shutdown`.
    pub fn shutdown(&self) {
        self.inner.stop();
    }

    /// Package install/remove/update operations.
    pub fn packages(&self) -> Packages {
        Packages::new(self.inner.clone())
    }

    /// Repository enable/disable/add operations.
    pub fn repositories(&self) -> Repositories {
        Repositories::new(self.inner.clone())
    }

    /// Service enable/disable/restart operations.
    pub fn services(&self) -> Services {
        Services::new(self.inner.clone())
    }

    /// System file write/delete operations.
    pub fn files(&self) -> SystemFiles {
        SystemFiles::new(self.inner.clone())
    }
}

impl Inner {
    pub(crate) fn enqueue(
        &self,
        request: TaskRequest,
        staged: Option<tempfile::TempPath>,
        completion: Option<async_channel::Sender<Result<TaskOutput>>>,
    ) -> Result<TaskId> {
        let TaskRequest {
            command,
            args,
            description,
            timeout,
            receiver,
        } = request;

        util::validate_program("command", &command)?;
        for arg in &args {
            util::validate_arg(arg)?;
        }
        let timeout = timeout.unwrap_or(self.opts.default_timeout);
        if timeout.is_zero() {
            return Err(Error::invalid_input("timeout must be > 0"));
        }
        let description =
            description.unwrap_or_else(|| types::task::command_line(&command, &args));

        let id = TaskId::next();
        let task = TaskDescriptor {
            id,
            command,
            args,
            description,
            timeout,
            route: Route {
                receiver,
                completion,
            },
            _staged: staged,
        };

        #[cfg(feature = "tracing")]
        tracing::info!(task_id = %id, description = %task.description, "privileged task submitted");

        self.queue.push(task)?;
        Ok(id)
    }

    fn cancel_drained(&self, drained: Vec<TaskDescriptor>) {
        for task in drained {
            self.dispatcher
                .emit(task.id, TaskEventKind::Cancelled, &task.route);
        }
    }

    fn stop(&self) {
        let drained = self.queue.shutdown();
        self.cancel_drained(drained);

        // The last clone can be released from inside the engine thread (a receiver owning an
        // `Executor`); that thread exits on its own once the queue reports shutdown.
        let handle = util::lock(&self.engine).take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!("engine thread panicked");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}
