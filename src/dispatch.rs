use crate::{Error, Result, TaskEvent, TaskEventKind, TaskId, TaskOutput};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Direct notification target for a single task.
///
/// Callbacks run on the executor's dispatcher thread, never on the engine thread, so a slow
/// receiver delays later deliveries but never the privileged subprocess. GUI callers typically
/// forward into their own event loop from here.
pub trait TaskReceiver: Send + Sync {
    /// The command exited with code 0.
    fn on_success(&self, task_id: TaskId, output: &TaskOutput);

    /// The task failed (no helper, launch failure, non-zero exit, timeout).
    fn on_error(&self, task_id: TaskId, error: &Error);

    /// One chunk of output, trimmed.
    fn on_progress(&self, _task_id: TaskId, _text: &str) {}

    fn on_started(&self, _task_id: TaskId, _description: &str) {}

    fn on_cancelled(&self, _task_id: TaskId) {}
}

/// Where a task's events go besides the broadcast channel.
#[derive(Clone, Default)]
pub(crate) struct Route {
    pub(crate) receiver: Option<Arc<dyn TaskReceiver>>,
    pub(crate) completion: Option<async_channel::Sender<Result<TaskOutput>>>,
}

struct Dispatch {
    event: TaskEvent,
    route: Route,
}

type Subscribers = Arc<Mutex<Vec<async_channel::Sender<TaskEvent>>>>;

/// Fire-and-forget event delivery.
///
/// Events are handed to a dedicated thread over an unbounded channel, so `emit` never blocks and
/// events are delivered in the order they were emitted.
#[derive(Clone, Debug)]
pub(crate) struct Dispatcher {
    tx: async_channel::Sender<Dispatch>,
    subscribers: Subscribers,
}

impl Dispatcher {
    pub(crate) fn start(thread_name: String) -> Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = async_channel::unbounded::<Dispatch>();
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

        let thread_subscribers = subscribers.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while let Ok(dispatch) = rx.recv_blocking() {
                    deliver(dispatch, &thread_subscribers);
                }
            })
            .map_err(|e| Error::IoError {
                context: format!("spawn dispatcher thread: {e}"),
            })?;

        Ok((Self { tx, subscribers }, handle))
    }

    pub(crate) fn emit(&self, task_id: TaskId, kind: TaskEventKind, route: &Route) {
        let dispatch = Dispatch {
            event: TaskEvent::new(task_id, kind),
            route: route.clone(),
        };
        if self.tx.try_send(dispatch).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!(%task_id, "dispatcher closed; event dropped");
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = async_channel::unbounded();
        crate::util::lock(&self.subscribers).push(tx);
        EventStream { rx }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

fn deliver(dispatch: Dispatch, subscribers: &Subscribers) {
    let Dispatch { event, route } = dispatch;

    {
        let mut subs = crate::util::lock(subscribers);
        #[cfg(feature = "tracing")]
        let before = subs.len();
        subs.retain(|tx| tx.try_send(event.clone()).is_ok());
        #[cfg(feature = "tracing")]
        if subs.len() < before {
            tracing::debug!(pruned = before - subs.len(), "dropped closed event subscribers");
        }
    }

    let task_id = event.task_id;
    if let Some(receiver) = &route.receiver {
        let delivered = catch_unwind(AssertUnwindSafe(|| match &event.kind {
            TaskEventKind::Started { description } => receiver.on_started(task_id, description),
            TaskEventKind::Progress { text } => receiver.on_progress(task_id, text),
            TaskEventKind::Finished { output } => receiver.on_success(task_id, output),
            TaskEventKind::Failed { error } => receiver.on_error(task_id, error),
            TaskEventKind::Cancelled => receiver.on_cancelled(task_id),
        }));
        if delivered.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(%task_id, kind = event.kind.as_str(), "task receiver panicked");
        }
    }

    if let Some(completion) = &route.completion {
        let result = match event.kind {
            TaskEventKind::Finished { output } => Some(Ok(output)),
            TaskEventKind::Failed { error } => Some(Err(error)),
            TaskEventKind::Cancelled => Some(Err(Error::Cancelled { task_id })),
            TaskEventKind::Started { .. } | TaskEventKind::Progress { .. } => None,
        };
        if let Some(result) = result {
            let _ = completion.try_send(result);
        }
    }
}

/// Subscription to every task event of one executor.
///
/// Dropping the stream unsubscribes it.
#[derive(Debug)]
pub struct EventStream {
    rx: async_channel::Receiver<TaskEvent>,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the executor is gone.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await.ok()
    }

    /// Non-blocking poll, e.g. from a GUI timer.
    pub fn try_next(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }

    /// Block the current thread until the next event.
    pub fn next_blocking(&mut self) -> Option<TaskEvent> {
        self.rx.recv_blocking().ok()
    }
}

/// Handle for a submitted task (see `Executor::submit_tracked`).
#[derive(Debug)]
pub struct TaskHandle {
    pub(crate) id: TaskId,
    pub(crate) rx: async_channel::Receiver<Result<TaskOutput>>,
}

impl TaskHandle {
    /// Id of the tracked task, as seen in broadcast events.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the terminal result.
    ///
    /// Non-zero exits, timeouts and cancellations are returned as `Err`. `Error::Shutdown` is
    /// returned if the executor dropped the task without running it.
    pub async fn wait(self) -> Result<TaskOutput> {
        self.rx.recv().await.unwrap_or(Err(Error::Shutdown))
    }

    /// Blocking variant of `wait`. Must not be called from the dispatcher thread (i.e. from inside
    /// a `TaskReceiver` callback).
    pub fn wait_blocking(self) -> Result<TaskOutput> {
        self.rx.recv_blocking().unwrap_or(Err(Error::Shutdown))
    }
}
