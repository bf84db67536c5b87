use crate::types::task::TaskDescriptor;
use crate::{Error, Result, TaskId, util};

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Pending tasks plus bookkeeping for the one task the engine is running.
///
/// Every critical section is plain data-structure bookkeeping: no subprocess I/O or event delivery
/// happens while the lock is held.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    state: Mutex<State>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<TaskDescriptor>,
    running: Option<RunningSlot>,
    shutdown: bool,
}

#[derive(Debug)]
struct RunningSlot {
    id: TaskId,
    description: String,
    cancel_requested: bool,
    /// The engine has observed an outcome; later cancellations are refused.
    finishing: bool,
    cancel_tx: async_channel::Sender<()>,
}

impl RunningSlot {
    /// Flag the task for cancellation unless it is already cancelled or finishing.
    fn request_cancel(&mut self) -> bool {
        if self.cancel_requested || self.finishing {
            return false;
        }
        self.cancel_requested = true;
        let _ = self.cancel_tx.try_send(());
        true
    }
}

/// Result of `TaskQueue::cancel`.
#[derive(Debug)]
pub(crate) enum Cancelled {
    NotFound,
    /// The running task was flagged; the engine emits the terminal event.
    Running,
    /// The task was removed before it started; the caller emits the terminal event.
    Queued(TaskDescriptor),
}

impl TaskQueue {
    pub(crate) fn push(&self, task: TaskDescriptor) -> Result<()> {
        let mut state = util::lock(&self.state);
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        state.pending.push_back(task);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a task is available, then move it into the running slot.
    ///
    /// Returns `None` once the queue is shut down. The returned receiver fires when the task is
    /// cancelled.
    pub(crate) fn next(&self) -> Option<(TaskDescriptor, async_channel::Receiver<()>)> {
        let mut state = util::lock(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            if state.running.is_none()
                && let Some(task) = state.pending.pop_front()
            {
                let (cancel_tx, cancel_rx) = async_channel::bounded(1);
                state.running = Some(RunningSlot {
                    id: task.id,
                    description: task.description.clone(),
                    cancel_requested: false,
                    finishing: false,
                    cancel_tx,
                });
                return Some((task, cancel_rx));
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Record that the engine observed an outcome for the running task (exit, deadline, launch
    /// failure). From here on `cancel` returns `NotFound` for it.
    ///
    /// Returns whether a cancellation was accepted first; that cancellation then decides the
    /// terminal event.
    pub(crate) fn begin_finish(&self, id: TaskId) -> bool {
        let mut state = util::lock(&self.state);
        match state.running.as_mut() {
            Some(slot) if slot.id == id => {
                slot.finishing = true;
                slot.cancel_requested
            }
            _ => false,
        }
    }

    /// Clear the running slot. Returns whether a cancellation was accepted for the task before it
    /// started finishing.
    pub(crate) fn finish(&self, id: TaskId) -> bool {
        let mut state = util::lock(&self.state);
        let cancelled = match state.running.take() {
            Some(slot) if slot.id == id => slot.cancel_requested,
            other => {
                state.running = other;
                false
            }
        };
        drop(state);
        self.ready.notify_one();
        cancelled
    }

    pub(crate) fn cancel(&self, id: TaskId) -> Cancelled {
        let mut state = util::lock(&self.state);
        if let Some(slot) = state.running.as_mut()
            && slot.id == id
        {
            return if slot.request_cancel() {
                Cancelled::Running
            } else {
                Cancelled::NotFound
            };
        }
        match state.pending.iter().position(|t| t.id == id) {
            Some(idx) => match state.pending.remove(idx) {
                Some(task) => Cancelled::Queued(task),
                None => Cancelled::NotFound,
            },
            None => Cancelled::NotFound,
        }
    }

    /// Flag the running task (if any) and drain every pending task.
    pub(crate) fn cancel_all(&self) -> Vec<TaskDescriptor> {
        cancel_all_locked(&mut util::lock(&self.state))
    }

    /// Stop accepting work and wake the engine so it can exit.
    ///
    /// Draining and closing happen in one critical section, so every accepted push is either
    /// drained here or was already running.
    pub(crate) fn shutdown(&self) -> Vec<TaskDescriptor> {
        let drained = {
            let mut state = util::lock(&self.state);
            state.shutdown = true;
            cancel_all_locked(&mut state)
        };
        self.ready.notify_all();
        drained
    }

    pub(crate) fn is_running(&self, id: TaskId) -> bool {
        util::lock(&self.state)
            .running
            .as_ref()
            .is_some_and(|slot| slot.id == id)
    }

    /// Running task first, then pending tasks in execution order.
    pub(crate) fn descriptions(&self) -> Vec<String> {
        let state = util::lock(&self.state);
        state
            .running
            .iter()
            .map(|slot| slot.description.clone())
            .chain(state.pending.iter().map(|t| t.description.clone()))
            .collect()
    }

    pub(crate) fn pending_len(&self) -> usize {
        util::lock(&self.state).pending.len()
    }
}

fn cancel_all_locked(state: &mut State) -> Vec<TaskDescriptor> {
    if let Some(slot) = state.running.as_mut() {
        slot.request_cancel();
    }
    state.pending.drain(..).collect()
}
