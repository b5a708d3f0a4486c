//! The job record and its status state machine.
//!
//! ```text
//!            claim                complete
//!  pending ─────────► processing ─────────► completed
//!     ▲                  │    │
//!     └──── retry ───────┘    └── fail ───► failed
//!     └──── release ─────┘
//! ```
//!
//! `completed` and `failed` are terminal: nothing but deletion touches them.

use core::cmp::Ordering;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::name::{JobType, QueueName};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at` and a free dispatcher.
    Pending,
    /// Claimed by exactly one dispatcher.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Handler failed and retries are exhausted.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Statuses the reaper is allowed to delete.
    pub const TERMINAL: [JobStatus; 2] = [JobStatus::Completed, JobStatus::Failed];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// `at + delay`, saturating at the largest representable timestamp.
pub fn advance(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A job as submitted by a producer, before the store assigns timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub queue_name: QueueName,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: u32,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// A job that is due immediately, with priority 0 and the default retry ceiling.
    pub fn new(queue_name: QueueName, job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            queue_name,
            job_type,
            payload,
            priority: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            run_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Schedule the job for a specific time.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = at;
        self
    }

    /// Schedule the job `delay` after `now`.
    pub fn delayed(mut self, now: DateTime<Utc>, delay: Duration) -> Self {
        self.run_at = advance(now, delay);
        self
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: QueueName,
    pub job_type: JobType,
    /// Opaque to the queue; handed verbatim to the handler.
    pub payload: serde_json::Value,
    /// Higher claims first.
    pub priority: i32,
    pub max_retries: u32,
    /// Failed executions so far. Never exceeds `max_retries`.
    pub attempts: u32,
    pub status: JobStatus,
    /// Earliest time the job may be claimed. Never moves backwards.
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    /// Message of the most recent failure.
    pub error: Option<String>,
}

impl Job {
    /// Materialize a submitted job as a fresh `pending` record.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            queue_name: new.queue_name,
            job_type: new.job_type,
            payload: new.payload,
            priority: new.priority,
            max_retries: new.max_retries,
            attempts: 0,
            status: JobStatus::Pending,
            run_at: new.run_at,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
        }
    }

    /// Claim order: priority descending, then oldest first, then id.
    pub fn claim_order(a: &Job, b: &Job) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Attempt count to record after one more failed execution.
    ///
    /// Clamped at `max_retries`, so a job with `max_retries == 0` fails on its
    /// first error with `attempts == 0`.
    pub fn attempts_after_failure(&self) -> u32 {
        self.attempts.saturating_add(1).min(self.max_retries)
    }

    /// pending → processing.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_due(now) {
            return Err(self.illegal("claim"));
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// processing → completed.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_processing("complete")?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// processing → pending, after a failure that still has retries left.
    pub fn schedule_retry(
        &mut self,
        attempts: u32,
        error: impl Into<String>,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.expect_processing("retry")?;
        self.set_attempts(attempts)?;
        self.status = JobStatus::Pending;
        self.error = Some(error.into());
        self.run_at = self.run_at.max(next_run_at);
        self.updated_at = now;
        Ok(())
    }

    /// processing → failed.
    pub fn fail(&mut self, attempts: u32, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_processing("fail")?;
        self.set_attempts(attempts)?;
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// processing → pending without counting a failed attempt.
    pub fn release(&mut self, error: impl Into<String>, run_at: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_processing("release")?;
        self.status = JobStatus::Pending;
        self.error = Some(error.into());
        self.run_at = self.run_at.max(run_at);
        self.updated_at = now;
        Ok(())
    }

    fn set_attempts(&mut self, attempts: u32) -> DomainResult<()> {
        if attempts < self.attempts || attempts > self.max_retries {
            return Err(DomainError::invalid_transition(format!(
                "job {}: attempts {} outside {}..={}",
                self.id, attempts, self.attempts, self.max_retries
            )));
        }
        self.attempts = attempts;
        Ok(())
    }

    fn expect_processing(&self, action: &str) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(action));
        }
        Ok(())
    }

    fn illegal(&self, action: &str) -> DomainError {
        DomainError::invalid_transition(format!("job {}: cannot {} a {} job", self.id, action, self.status))
    }
}
