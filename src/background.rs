//! Periodic eviction of idle rate-limiter visitors.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::limiter::RateLimiter;

pub fn spawn_background_tasks(limiter: Arc<RateLimiter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(limiter.sweep_interval());
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = limiter.sweep();
            debug!(
                removed,
                remaining = limiter.visitor_count(),
                "swept idle visitors"
            );
        }
    })
}
