//! The master thread: periodic pool scaling.

use super::{PoolShared, WorkerId};
use crate::util::lock;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one scaling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rebalance {
    pub added: usize,
    pub stopped: usize,
}

enum Plan {
    Keep,
    Grow(usize),
    Shrink(Vec<WorkerId>),
}

pub(super) fn run(shared: Arc<PoolShared>, interval: Duration) {
    debug!("Pool master started");
    loop {
        {
            let members = lock(&shared.members);
            let (members, _) = shared
                .wake
                .wait_timeout_while(members, interval, |m| m.running)
                .unwrap_or_else(PoisonError::into_inner);
            if !members.running {
                break;
            }
        }
        shared.rebalance();
    }
    debug!("Pool master exited");
}

impl PoolShared {
    /// Grow or shrink the pool once based on the current busy ratio.
    pub(super) fn rebalance(self: &Arc<Self>) -> Rebalance {
        self.reap();

        let plan = {
            let mut members = lock(&self.members);
            if !members.running {
                return Rebalance::default();
            }

            // One worker stays even when the configured minimum is zero.
            let (min, max) = (self.settings.min.max(1), self.settings.max);
            let (low, high) = (self.settings.low_watermark, self.settings.high_watermark);
            let stats = members.stats();
            let size = stats.size;

            if size < min {
                Plan::Grow(min.min(max).saturating_sub(size))
            } else if size == 0 {
                Plan::Keep
            } else {
                let ratio = stats.busy as f64 / size as f64;
                if ratio > high {
                    let wanted = (size as f64 * (ratio - high)).ceil() as usize;
                    Plan::Grow(wanted.min(max.saturating_sub(size)))
                } else if ratio < low {
                    let wanted = (size as f64 * (low - ratio)).ceil() as usize;
                    let count = wanted.min(size.saturating_sub(min)).min(stats.idle);
                    let victims: Vec<WorkerId> =
                        members.idle.iter().rev().take(count).copied().collect();
                    for id in &victims {
                        members.idle.remove(id);
                        members.stopping.insert(*id);
                    }
                    Plan::Shrink(victims)
                } else {
                    Plan::Keep
                }
            }
        };

        match plan {
            Plan::Keep => Rebalance::default(),
            Plan::Grow(count) => {
                let mut added = 0;
                for _ in 0..count {
                    match self.spawn_worker() {
                        Ok(_) => added += 1,
                        Err(e) => {
                            warn!(error = %e, "Failed to add worker");
                            break;
                        }
                    }
                }
                if added > 0 {
                    info!(added, size = lock(&self.members).size(), "Pool grown");
                }
                Rebalance { added, stopped: 0 }
            }
            Plan::Shrink(victims) => {
                // Membership lock is released; stop flags take the queue locks.
                let workers: Vec<_> = {
                    let members = lock(&self.members);
                    victims
                        .iter()
                        .filter_map(|id| members.workers.get(id).cloned())
                        .collect()
                };
                for worker in &workers {
                    worker.request_stop();
                }
                if !victims.is_empty() {
                    info!(stopped = victims.len(), "Pool shrunk");
                }
                Rebalance {
                    added: 0,
                    stopped: victims.len(),
                }
            }
        }
    }
}
