//! Read-only queue statistics for dashboards and health checks.

use std::sync::Arc;

use tracing::warn;

use jobqueue_core::QueueName;

use super::store::{JobStore, QueueStats};

/// Per-status job counts for one queue.
///
/// Reads straight through to the store on every call. A store failure is
/// logged and reported as all-zero counts so dashboards keep rendering.
#[derive(Debug)]
pub struct StatsReporter<S> {
    store: Arc<S>,
    queue: QueueName,
}

impl<S> Clone for StatsReporter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<S: JobStore> StatsReporter<S> {
    pub fn new(store: Arc<S>, queue: QueueName) -> Self {
        Self { store, queue }
    }

    pub async fn stats(&self) -> QueueStats {
        match self.store.stats(&self.queue).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "failed to read queue stats; reporting zeros");
                QueueStats::default()
            }
        }
    }
}
