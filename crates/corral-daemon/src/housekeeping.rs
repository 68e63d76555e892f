//! Periodic store maintenance: prune terminal jobs past retention and
//! sweep expired bootstrap tokens.
//!
//! Failures are logged and the loop keeps going; housekeeping must never
//! take the daemon down.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use corral_core::QueueEngine;

/// Runs the maintenance loop until the task is dropped.
pub async fn run(queue: Arc<QueueEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup stays quiet.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        sweep(&queue);
    }
}

fn sweep(queue: &QueueEngine) {
    let keep_days = queue.policy().prune_keep_days;
    match queue.prune(keep_days, None) {
        Ok(jobs) => debug!(jobs, keep_days, "pruned terminal jobs"),
        Err(err) => warn!(error = %err, "job prune failed"),
    }
    match queue.prune_tokens(None) {
        Ok(tokens) => debug!(tokens, "pruned bootstrap tokens"),
        Err(err) => warn!(error = %err, "token prune failed"),
    }
}
