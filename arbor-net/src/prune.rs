//! Periodic eviction of workers whose leaf has gone quiet.

use std::time::{Duration, Instant};

use arbor_core::NodeLocation;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::branch::Branch;
use crate::worker::Worker;

pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_millis(2500);
pub const DEFAULT_PRUNE_THRESHOLD: Duration = Duration::from_millis(5000);

/// Locations of workers that have been idle for longer than `threshold` at `now`.
pub fn idle_workers<'a>(
    workers: impl IntoIterator<Item = &'a Worker>,
    now: Instant,
    threshold: Duration,
) -> Vec<NodeLocation> {
    workers
        .into_iter()
        .filter(|worker| worker.idle_for(now) > threshold)
        .map(Worker::location)
        .collect()
}

/// Runs one sweep of `branch` every `interval` until the branch shuts down.
pub fn spawn_pruning(branch: Branch, interval: Duration, threshold: Duration) -> JoinHandle<()> {
    tokio::spawn(prune_loop(branch, interval, threshold))
}

async fn prune_loop(branch: Branch, interval: Duration, threshold: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = branch.closed() => {
                debug!("{}: pruning stopped", branch.name());
                return;
            }
            _ = ticker.tick() => {}
        }
        match branch.prune(threshold).await {
            Ok(evicted) if !evicted.is_empty() => {
                info!("{}: pruned {} idle worker(s)", branch.name(), evicted.len())
            }
            Ok(_) => {}
            Err(e) => {
                error!("{}: prune sweep interrupted ({}), pruning disabled", branch.name(), e);
                return;
            }
        }
    }
}
