//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use jobqueue_core::{DomainError, DomainResult, Job, JobId, JobStatus, NewJob, QueueName};

/// Job store abstraction.
///
/// Every status change is a conditional transition: it only succeeds when the
/// job is currently in the status the transition starts from. Implementations
/// must make `claim_batch` atomic with respect to concurrent callers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job.
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Claim up to `limit` due pending jobs of `queue`, moving them to
    /// `processing`.
    ///
    /// Jobs are returned by priority descending, then creation time ascending.
    /// A job returned here is never returned to another caller until it is
    /// back in `pending`.
    async fn claim_batch(
        &self,
        queue: &QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// processing → completed.
    async fn mark_completed(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// processing → pending with a new attempt count and a later `run_at`.
    async fn mark_retry(
        &self,
        id: JobId,
        error: &str,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// processing → failed.
    async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// processing → pending without counting an attempt.
    async fn release(
        &self,
        id: JobId,
        error: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Count jobs of `queue` per status.
    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, StoreError>;

    /// Delete jobs of `queue` in one of `statuses` last updated before `cutoff`.
    /// Returns the number of deleted jobs.
    async fn delete_older_than(
        &self,
        queue: &QueueName,
        cutoff: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) => StoreError::InvalidTransition(msg),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

/// Job counts per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// In-memory job store for tests/dev.
///
/// A single lock guards the whole table, which makes every operation,
/// including the claim, atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs across all queues.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn transition<F>(&self, id: JobId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job) -> DomainResult<()> + Send,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply(job)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let job = Job::from_new(job, Utc::now());
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        queue: &QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.jobs.write().await;

        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|j| &j.queue_name == queue && j.is_due(now))
            .collect();
        candidates.sort_by(|a, b| Job::claim_order(a, b));
        let ids: Vec<JobId> = candidates.into_iter().take(limit).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.claim(now)?;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(id, |job| job.complete(result, now)).await
    }

    async fn mark_retry(
        &self,
        id: JobId,
        error: &str,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(id, |job| job.schedule_retry(attempts, error, next_run_at, now))
            .await
    }

    async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(id, |job| job.fail(attempts, error, now)).await
    }

    async fn release(
        &self,
        id: JobId,
        error: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(id, |job| job.release(error, run_at, now)).await
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, StoreError> {
        let jobs = self.jobs.read().await;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| &j.queue_name == queue) {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }

    async fn delete_older_than(
        &self,
        queue: &QueueName,
        cutoff: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(&j.queue_name == queue && statuses.contains(&j.status) && j.updated_at < cutoff)
        });
        Ok((before - jobs.len()) as u64)
    }
}
