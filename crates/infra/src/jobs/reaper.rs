//! Retention cleanup for terminal jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use jobqueue_core::{JobStatus, QueueName};

use super::store::{JobStore, StoreError};

/// Deletes `completed`/`failed` jobs of one queue once their last update is
/// older than the retention window. `pending` and `processing` jobs are never
/// touched, whatever their age.
#[derive(Debug)]
pub struct Reaper<S> {
    store: Arc<S>,
    queue: QueueName,
    retention: Duration,
}

impl<S> Clone for Reaper<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
            retention: self.retention,
        }
    }
}

impl<S: JobStore> Reaper<S> {
    pub fn new(store: Arc<S>, queue: QueueName, retention: Duration) -> Self {
        Self {
            store,
            queue,
            retention,
        }
    }

    /// Delete expired terminal jobs as of `now`. Returns how many were removed.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        if self.retention.is_zero() {
            return Ok(0);
        }

        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(0);
        };

        let deleted = self
            .store
            .delete_older_than(&self.queue, cutoff, &JobStatus::TERMINAL)
            .await?;

        if deleted > 0 {
            debug!(queue = %self.queue, deleted, %cutoff, "reaped terminal jobs");
        }
        Ok(deleted)
    }
}
