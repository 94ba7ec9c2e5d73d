//! Periodic eviction of idle connections and expired cache entries.
//!
//! The reactor checks the clock once per loop iteration; when an interval
//! boundary has passed, both sweeps are queued on the worker pool.

use super::ServerContext;
use crate::pool::WorkerPool;
use std::sync::Arc;
use tracing::{debug, warn};

/// Wall-clock gate for the sweeps.
#[derive(Debug)]
pub struct SweepClock {
    interval_ms: u64,
    last: u64,
}

impl SweepClock {
    pub fn new(interval_ms: u64, now: u64) -> Self {
        Self {
            interval_ms,
            last: now,
        }
    }

    /// True once per elapsed interval.
    pub fn due(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.last) >= self.interval_ms {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Queue both sweeps on the pool.
pub(crate) fn submit(pool: &WorkerPool, ctx: &Arc<ServerContext>) {
    let shared = Arc::clone(ctx);
    if !pool.submit("sweep-connections", move || {
        shared.timers.sweep();
    }) {
        warn!("Failed to queue connection sweep");
    }

    let shared = Arc::clone(ctx);
    if !pool.submit("sweep-cache", move || {
        let evicted = shared.cache.sweep();
        if evicted > 0 {
            debug!(evicted, remaining = shared.cache.len(), "Cache swept");
        }
    }) {
        warn!("Failed to queue cache sweep");
    }
}
