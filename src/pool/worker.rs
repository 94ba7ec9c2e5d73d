//! Worker threads and their private task queues.

use super::PoolShared;
use crate::util::lock;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Stable identifier of a worker inside its pool.
pub type WorkerId = usize;

/// A unit of work: a routine together with the argument it captured.
pub struct Task {
    label: &'static str,
    routine: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new<F>(label: &'static str, routine: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            label,
            routine: Box::new(routine),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Run the task on the current worker.
    ///
    /// Tasks never panic by contract; a panic means an internal invariant
    /// broke (for instance a corrupted index) and the process is aborted
    /// rather than left running on inconsistent state.
    fn run(self, worker: WorkerId) {
        let label = self.label;
        trace!(worker, task = label, "Running task");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(self.routine)) {
            error!(
                worker,
                task = label,
                panic = panic_message(payload.as_ref()),
                "Task panicked, aborting"
            );
            process::abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Whether a worker has queued or running work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Busy,
}

struct Queue {
    tasks: VecDeque<Task>,
    state: RunState,
    /// Set by the pool; the worker exits once its queue is empty.
    stop: bool,
    /// Set by the worker right before it leaves the pool.
    exited: bool,
}

/// One worker thread with a private queue guarded by its own lock.
pub struct Worker {
    id: WorkerId,
    queue: Mutex<Queue>,
    ready: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(super) fn new(id: WorkerId) -> Self {
        Self {
            id,
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                state: RunState::Idle,
                stop: false,
                exited: false,
            }),
            ready: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    pub(super) fn set_handle(&self, handle: JoinHandle<()>) {
        *lock(&self.handle) = Some(handle);
    }

    /// Queue a task. The task is handed back if the worker already left the
    /// pool.
    pub(super) fn push(&self, task: Task, pool: &PoolShared) -> Result<(), Task> {
        let mut queue = lock(&self.queue);
        if queue.exited {
            return Err(task);
        }

        queue.tasks.push_back(task);
        if queue.tasks.len() == 1 {
            queue.state = RunState::Busy;
            pool.mark_busy(self.id);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Ask the worker to exit once its queue is drained.
    pub(super) fn request_stop(&self) {
        let mut queue = lock(&self.queue);
        debug!(
            worker = self.id,
            state = ?queue.state,
            pending = queue.tasks.len(),
            "Stopping worker"
        );
        queue.stop = true;
        self.ready.notify_one();
    }

    /// Wait for the worker thread to finish.
    pub(super) fn join(&self) {
        let Some(handle) = lock(&self.handle).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(worker = self.id, "Worker thread panicked");
        }
    }

    /// Worker thread body.
    pub(super) fn run(self: Arc<Self>, pool: Arc<PoolShared>) {
        debug!(worker = self.id, "Worker started");
        loop {
            let task = {
                let queue = lock(&self.queue);
                let mut queue = self
                    .ready
                    .wait_while(queue, |q| q.tasks.is_empty() && !q.stop)
                    .unwrap_or_else(PoisonError::into_inner);

                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.exited = true;
                        drop(queue);
                        pool.retire(self.id);
                        debug!(worker = self.id, "Worker exited");
                        return;
                    }
                }
            };

            task.run(self.id);

            let mut queue = lock(&self.queue);
            if queue.tasks.is_empty() {
                queue.state = RunState::Idle;
                pool.mark_idle(self.id);
            }
        }
    }
}
