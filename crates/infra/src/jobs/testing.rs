//! Test doubles shared by the unit tests of this module.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobqueue_core::{Job, JobId, JobStatus, NewJob, QueueName};

use super::store::{InMemoryJobStore, JobStore, QueueStats, StoreError};

/// A store whose every call fails.
pub(crate) struct BrokenStore;

#[async_trait]
impl JobStore for BrokenStore {
    async fn insert(&self, _job: NewJob) -> Result<JobId, StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn get(&self, _id: JobId) -> Result<Option<Job>, StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn claim_batch(&self, _q: &QueueName, _l: usize, _n: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn mark_completed(&self, _id: JobId, _r: serde_json::Value, _n: DateTime<Utc>) -> Result<(), StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn mark_retry(
        &self,
        _id: JobId,
        _e: &str,
        _a: u32,
        _r: DateTime<Utc>,
        _n: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn mark_failed(&self, _id: JobId, _e: &str, _a: u32, _n: DateTime<Utc>) -> Result<(), StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn release(&self, _id: JobId, _e: &str, _r: DateTime<Utc>, _n: DateTime<Utc>) -> Result<(), StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn stats(&self, _q: &QueueName) -> Result<QueueStats, StoreError> {
        Err(StoreError::Storage("down".into()))
    }
    async fn delete_older_than(
        &self,
        _q: &QueueName,
        _c: DateTime<Utc>,
        _s: &[JobStatus],
    ) -> Result<u64, StoreError> {
        Err(StoreError::Storage("down".into()))
    }
}

/// In-memory store that fails a set number of calls before recovering.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: InMemoryJobStore,
    claim_failures: AtomicUsize,
    complete_failures: AtomicUsize,
}

impl FlakyStore {
    /// Fail the next `n` calls to `claim_batch`.
    pub(crate) fn fail_claims(self, n: usize) -> Self {
        self.claim_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` calls to `mark_completed`.
    pub(crate) fn fail_completions(self, n: usize) -> Self {
        self.complete_failures.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn inner(&self) -> &InMemoryJobStore {
        &self.inner
    }

    fn trip(counter: &AtomicUsize) -> Result<(), StoreError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StoreError::Storage("blip".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.inner.insert(job).await
    }
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }
    async fn claim_batch(&self, q: &QueueName, l: usize, n: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Self::trip(&self.claim_failures)?;
        self.inner.claim_batch(q, l, n).await
    }
    async fn mark_completed(&self, id: JobId, r: serde_json::Value, n: DateTime<Utc>) -> Result<(), StoreError> {
        Self::trip(&self.complete_failures)?;
        self.inner.mark_completed(id, r, n).await
    }
    async fn mark_retry(
        &self,
        id: JobId,
        e: &str,
        a: u32,
        r: DateTime<Utc>,
        n: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.mark_retry(id, e, a, r, n).await
    }
    async fn mark_failed(&self, id: JobId, e: &str, a: u32, n: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.mark_failed(id, e, a, n).await
    }
    async fn release(&self, id: JobId, e: &str, r: DateTime<Utc>, n: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.release(id, e, r, n).await
    }
    async fn stats(&self, q: &QueueName) -> Result<QueueStats, StoreError> {
        self.inner.stats(q).await
    }
    async fn delete_older_than(
        &self,
        q: &QueueName,
        c: DateTime<Utc>,
        s: &[JobStatus],
    ) -> Result<u64, StoreError> {
        self.inner.delete_older_than(q, c, s).await
    }
}
