//! Self-scaling worker pool.
//!
//! Every worker owns a private FIFO queue. Submissions are spread over the
//! workers in round-robin order, and a master thread periodically grows or
//! shrinks the pool based on the share of busy workers.
//!
//! Locks are always taken in the order worker queue, then pool membership.

mod master;
mod worker;

pub use master::Rebalance;

use crate::util::lock;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};
use worker::{Task, Worker, WorkerId};

pub const DEFAULT_MIN_WORKERS: usize = 4;
pub const DEFAULT_MAX_WORKERS: usize = 64;
pub const DEFAULT_LOW_WATERMARK: f64 = 0.2;
pub const DEFAULT_HIGH_WATERMARK: f64 = 0.8;
pub const DEFAULT_REBALANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Sizing and scaling parameters of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    /// Busy ratio under which idle workers are retired.
    pub low_watermark: f64,
    /// Busy ratio over which workers are added.
    pub high_watermark: f64,
    pub rebalance_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            initial: DEFAULT_MIN_WORKERS,
            min: DEFAULT_MIN_WORKERS,
            max: DEFAULT_MAX_WORKERS,
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            rebalance_interval: DEFAULT_REBALANCE_INTERVAL,
        }
    }
}

/// Point-in-time view of the pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Workers accepting tasks (running minus stopping).
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    /// Workers draining their queue before exit.
    pub stopping: usize,
}

struct Membership {
    workers: BTreeMap<WorkerId, Arc<Worker>>,
    idle: BTreeSet<WorkerId>,
    stopping: BTreeSet<WorkerId>,
    /// Round-robin position: the next pick starts at the first id >= cursor.
    cursor: WorkerId,
    next_id: WorkerId,
    /// Workers that left the pool and still have to be joined.
    retired: Vec<Arc<Worker>>,
    running: bool,
}

impl Membership {
    fn size(&self) -> usize {
        self.workers.len() - self.stopping.len()
    }

    fn stats(&self) -> PoolStats {
        let size = self.size();
        let idle = self.idle.len();
        PoolStats {
            size,
            idle,
            busy: size.saturating_sub(idle),
            stopping: self.stopping.len(),
        }
    }

    /// Next worker that is not stopping, walking ids in a circle.
    fn pick(&mut self) -> Option<Arc<Worker>> {
        let id = self
            .workers
            .range(self.cursor..)
            .chain(self.workers.iter())
            .map(|(id, _)| *id)
            .find(|id| !self.stopping.contains(id))?;
        self.cursor = id + 1;
        self.workers.get(&id).cloned()
    }
}

/// State shared between the pool handle, the workers and the master.
pub(crate) struct PoolShared {
    settings: PoolSettings,
    members: Mutex<Membership>,
    wake: Condvar,
}

impl PoolShared {
    fn mark_busy(&self, id: WorkerId) {
        lock(&self.members).idle.remove(&id);
    }

    fn mark_idle(&self, id: WorkerId) {
        let mut members = lock(&self.members);
        if members.workers.contains_key(&id) && !members.stopping.contains(&id) {
            members.idle.insert(id);
        }
    }

    /// Remove an exiting worker from every membership list.
    fn retire(&self, id: WorkerId) {
        let mut members = lock(&self.members);
        members.idle.remove(&id);
        members.stopping.remove(&id);
        if let Some(worker) = members.workers.remove(&id) {
            members.retired.push(worker);
        }
    }

    /// Join workers that already left the pool.
    fn reap(&self) {
        let retired = std::mem::take(&mut lock(&self.members).retired);
        for worker in retired {
            worker.join();
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> io::Result<WorkerId> {
        let id = {
            let mut members = lock(&self.members);
            let id = members.next_id;
            members.next_id += 1;
            id
        };

        let worker = Arc::new(Worker::new(id));
        let handle = thread::Builder::new().name(format!("worker-{id}")).spawn({
            let worker = Arc::clone(&worker);
            let shared = Arc::clone(self);
            move || worker.run(shared)
        })?;
        worker.set_handle(handle);

        let mut members = lock(&self.members);
        members.workers.insert(id, worker);
        members.idle.insert(id);
        Ok(id)
    }
}

/// Handle to a running pool. Dropping it shuts the pool down.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    master: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings) -> io::Result<Self> {
        let interval = settings.rebalance_interval;
        let initial = settings.initial;
        let shared = Arc::new(PoolShared {
            settings,
            members: Mutex::new(Membership {
                workers: BTreeMap::new(),
                idle: BTreeSet::new(),
                stopping: BTreeSet::new(),
                cursor: 0,
                next_id: 0,
                retired: Vec::new(),
                running: true,
            }),
            wake: Condvar::new(),
        });
        let pool = Self {
            shared,
            master: Mutex::new(None),
        };

        for _ in 0..initial {
            if let Err(e) = pool.shared.spawn_worker() {
                error!(error = %e, "Failed to spawn worker");
                pool.shutdown();
                return Err(e);
            }
        }

        let master = thread::Builder::new().name("pool-master".to_string()).spawn({
            let shared = Arc::clone(&pool.shared);
            move || master::run(shared, interval)
        });
        match master {
            Ok(handle) => *lock(&pool.master) = Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to spawn pool master");
                pool.shutdown();
                return Err(e);
            }
        }

        info!(workers = initial, "Worker pool started");
        Ok(pool)
    }

    /// Queue `routine` on the next worker in round-robin order.
    ///
    /// Returns `false` if the pool is shut down or has no worker to take the
    /// task.
    pub fn submit<F>(&self, label: &'static str, routine: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Task::new(label, routine);
        loop {
            let worker = {
                let mut members = lock(&self.shared.members);
                if !members.running {
                    debug!(task = task.label(), "Pool stopped, dropping task");
                    return false;
                }
                match members.pick() {
                    Some(worker) => worker,
                    None => return false,
                }
            };

            // The picked worker may have exited since it was selected.
            match worker.push(task, &self.shared) {
                Ok(()) => return true,
                Err(rejected) => task = rejected,
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        lock(&self.shared.members).stats()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Run one scaling round immediately.
    pub fn rebalance(&self) -> Rebalance {
        self.shared.rebalance()
    }

    /// Stop accepting tasks, drain every queue and join all threads.
    pub fn shutdown(&self) {
        {
            let mut members = lock(&self.shared.members);
            if !members.running {
                return;
            }
            members.running = false;
        }
        self.shared.wake.notify_all();

        if let Some(master) = lock(&self.master).take() {
            if master.thread().id() != thread::current().id() && master.join().is_err() {
                error!("Pool master panicked");
            }
        }

        let workers: Vec<_> = lock(&self.shared.members)
            .workers
            .values()
            .cloned()
            .collect();
        for worker in &workers {
            worker.request_stop();
        }
        for worker in &workers {
            worker.join();
        }
        self.shared.reap();
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
