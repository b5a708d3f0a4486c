//! Polling dispatcher.
//!
//! Each tick claims a batch of due jobs, runs their handlers, records the
//! outcome of every job, then runs the reaper. Ticks happen on a fixed
//! interval and additionally whenever an enqueue wakes the loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobqueue_core::job::advance;
use jobqueue_core::{Job, QueueName, RetryPolicy};

use super::reaper::Reaper;
use super::registry::{JobHandler, WorkerRegistry};
use super::store::{JobStore, StoreError};
use crate::config::{ConfigError, MissingHandlerPolicy, QueueConfig};

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Jobs put back to `pending` because no handler was registered.
    pub released: usize,
    pub reaped: u64,
}

impl TickReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Released => self.released += 1,
        }
    }

    fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Retried,
    Failed,
    Released,
}

/// Cumulative dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    /// Jobs whose handler ran. Released jobs are not counted.
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_released: u64,
    pub jobs_reaped: u64,
    /// Ticks that hit a store error.
    pub store_errors: u64,
}

impl DispatcherStats {
    fn absorb(&mut self, report: &TickReport) {
        self.jobs_processed += report.claimed.saturating_sub(report.released) as u64;
        self.jobs_succeeded += report.completed as u64;
        self.jobs_retried += report.retried as u64;
        self.jobs_failed += report.failed as u64;
        self.jobs_released += report.released as u64;
        self.jobs_reaped += report.reaped;
    }
}

/// Claims and executes jobs of one queue.
pub struct Dispatcher<S> {
    store: Arc<S>,
    registry: Arc<WorkerRegistry>,
    config: Arc<QueueConfig>,
    queue: QueueName,
    policy: RetryPolicy,
    reaper: Reaper<S>,
    wake: Arc<Notify>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            queue: self.queue.clone(),
            policy: self.policy,
            reaper: self.reaper.clone(),
            wake: self.wake.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<S: JobStore + 'static> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<WorkerRegistry>,
        config: QueueConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let queue = config.queue()?;
        let reaper = Reaper::new(store.clone(), queue.clone(), config.retention);

        Ok(Self {
            store,
            registry,
            policy: config.retry_policy(),
            config: Arc::new(config),
            queue,
            reaper,
            wake: Arc::new(Notify::new()),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        })
    }

    /// Share a wake-up signal with enqueuers. A notification triggers an
    /// immediate tick instead of waiting for the next interval.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    ///
    /// A failed claim ends the tick before any job runs. A failed outcome
    /// write only affects its own job: the rest of the batch still runs,
    /// the first such error is returned, and the reaper is skipped. The job
    /// whose write failed stays in `processing`. Outcomes recorded before
    /// the error are still counted in [`DispatcherStats`].
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();
        let result = self.execute_tick(now, &mut report).await;

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.ticks += 1;
        stats.absorb(&report);
        if result.is_err() {
            stats.store_errors += 1;
        }
        result.map(|()| report)
    }

    async fn execute_tick(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), StoreError> {
        if self.registry.is_empty() {
            debug!(queue = %self.queue, "no handlers registered, skipping tick");
            return Ok(());
        }

        let jobs = self
            .store
            .claim_batch(&self.queue, self.config.batch_size, now)
            .await?;
        report.claimed = jobs.len();
        if !jobs.is_empty() {
            debug!(queue = %self.queue, claimed = jobs.len(), "claimed jobs");
        }

        if self.config.max_concurrent <= 1 {
            self.run_sequentially(jobs, now, report).await?;
        } else {
            self.run_concurrently(jobs, now, report).await?;
        }

        report.reaped = self.reaper.reap(now).await?;
        Ok(())
    }

    async fn run_sequentially(
        &self,
        jobs: Vec<Job>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let mut first_error = None;
        for job in jobs {
            let id = job.id;
            match self.run_job(job, now).await {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    warn!(queue = %self.queue, job_id = %id, error = %err, "failed to record job outcome");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_concurrently(
        &self,
        jobs: Vec<Job>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let mut running = JoinSet::new();
        let mut first_error = None;

        for job in jobs {
            while running.len() >= self.config.max_concurrent {
                if let Some(joined) = running.join_next().await {
                    collect(joined, report, &mut first_error);
                }
            }
            let this = self.clone();
            running.spawn(async move { this.run_job(job, now).await });
        }
        while let Some(joined) = running.join_next().await {
            collect(joined, report, &mut first_error);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_job(&self, job: Job, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        let Some(handler) = self.registry.lookup(job.job_type.as_str()) else {
            return self.handle_missing(&job, now).await;
        };

        let started = Instant::now();
        let outcome = self.invoke(handler, job.payload.clone()).await;
        let finished_at = advance(now, started.elapsed());

        match outcome {
            Ok(result) => {
                self.store.mark_completed(job.id, result, finished_at).await?;
                debug!(
                    queue = %self.queue,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "job completed"
                );
                Ok(Outcome::Completed)
            }
            Err(message) => self.record_failure(&job, &message, finished_at).await,
        }
    }

    /// Run the handler in its own task so a panic or timeout only affects
    /// this job.
    async fn invoke(
        &self,
        handler: Arc<dyn JobHandler>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let mut task = tokio::spawn(async move { handler.handle(payload).await });

        let joined = match self.config.job_timeout.filter(|limit| !limit.is_zero()) {
            Some(limit) => match time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(format!("job timed out after {limit:?}"));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(err) if err.is_panic() => Err("handler panicked".to_string()),
            Err(_) => Err("handler cancelled".to_string()),
        }
    }

    async fn record_failure(
        &self,
        job: &Job,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        let attempts = job.attempts_after_failure();

        if RetryPolicy::should_retry(attempts, job.max_retries) {
            let next_run_at = advance(now, self.policy.backoff_delay(attempts));
            self.store
                .mark_retry(job.id, message, attempts, next_run_at, now)
                .await?;
            debug!(
                queue = %self.queue,
                job_id = %job.id,
                job_type = %job.job_type,
                attempts,
                %next_run_at,
                error = message,
                "job failed, retry scheduled"
            );
            Ok(Outcome::Retried)
        } else {
            self.store.mark_failed(job.id, message, attempts, now).await?;
            warn!(
                queue = %self.queue,
                job_id = %job.id,
                job_type = %job.job_type,
                attempts,
                error = message,
                "job failed permanently"
            );
            Ok(Outcome::Failed)
        }
    }

    async fn handle_missing(&self, job: &Job, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        let message = format!("no handler registered for job type '{}'", job.job_type);
        warn!(
            queue = %self.queue,
            job_id = %job.id,
            job_type = %job.job_type,
            policy = ?self.config.missing_handler,
            "no handler for claimed job"
        );

        match self.config.missing_handler {
            MissingHandlerPolicy::Release => {
                let run_at = advance(now, self.config.poll_interval);
                self.store.release(job.id, &message, run_at, now).await?;
                Ok(Outcome::Released)
            }
            MissingHandlerPolicy::Fail => {
                self.store
                    .mark_failed(job.id, &message, job.attempts, now)
                    .await?;
                Ok(Outcome::Failed)
            }
        }
    }

    /// Start the polling loop on the current runtime.
    ///
    /// The first tick runs immediately.
    pub fn spawn(self) -> DispatcherHandle {
        let cancel = CancellationToken::new();
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(cancel.clone()));

        DispatcherHandle {
            cancel,
            join: Some(join),
            stats,
        }
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            queue = %self.queue,
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "job dispatcher started"
        );

        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            match self.tick().await {
                Ok(report) if !report.is_idle() => {
                    debug!(queue = %self.queue, ?report, "tick finished");
                }
                Ok(_) => {}
                Err(err) => {
                    error!(queue = %self.queue, error = %err, "dispatcher tick failed");
                }
            }
        }

        info!(queue = %self.queue, "job dispatcher stopped");
    }
}

fn collect(
    joined: Result<Result<Outcome, StoreError>, JoinError>,
    report: &mut TickReport,
    first_error: &mut Option<StoreError>,
) {
    match joined {
        Ok(Ok(outcome)) => report.record(outcome),
        Ok(Err(err)) => {
            warn!(error = %err, "failed to record job outcome");
            first_error.get_or_insert(err);
        }
        Err(err) => error!(error = %err, "job task did not finish"),
    }
}

/// Handle to a running dispatcher loop.
///
/// Dropping the handle stops the loop without waiting for it.
#[derive(Debug)]
pub struct DispatcherHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop scheduling ticks and wait for the in-flight tick to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "dispatcher task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use jobqueue_core::{JobId, JobStatus, JobType, NewJob};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::testing::{BrokenStore, FlakyStore};

    fn queue() -> QueueName {
        QueueName::new("default").unwrap()
    }

    fn job_type(name: &str) -> JobType {
        JobType::new(name).unwrap()
    }

    async fn enqueue(store: &InMemoryJobStore, kind: &str, max_retries: u32) -> JobId {
        let job = NewJob::new(queue(), job_type(kind), serde_json::json!({ "to": "a@example.com" }))
            .with_max_retries(max_retries)
            .run_at(Utc::now() - chrono::Duration::seconds(1));
        store.insert(job).await.unwrap()
    }

    fn dispatcher(
        store: Arc<InMemoryJobStore>,
        registry: Arc<WorkerRegistry>,
        config: QueueConfig,
    ) -> Dispatcher<InMemoryJobStore> {
        Dispatcher::new(store, registry, config).unwrap()
    }

    #[tokio::test]
    async fn skips_tick_without_handlers() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "send-email", 3).await;
        let dispatcher = dispatcher(store.clone(), Arc::new(WorkerRegistry::new()), QueueConfig::default());

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn successful_job_is_completed_with_result() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "send-email", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |payload: serde_json::Value| async move {
            Ok(serde_json::json!({ "sent_to": payload["to"] }))
        });

        let report = dispatcher(store.clone(), registry, QueueConfig::default())
            .tick()
            .await
            .unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.result, Some(serde_json::json!({ "sent_to": "a@example.com" })));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_schedules_retry_with_backoff() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "send-email", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { anyhow::bail!("SMTP down") });

        let now = Utc::now();
        let report = dispatcher(store.clone(), registry, QueueConfig::default())
            .tick_at(now)
            .await
            .unwrap();
        assert_eq!(report.retried, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("SMTP down"));
        assert!(job.run_at >= now + chrono::Duration::seconds(1));
        assert!(job.run_at < now + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn retries_until_exhausted_then_fails() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "send-email", 3).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(WorkerRegistry::new());
        {
            let calls = calls.clone();
            registry.register(job_type("send-email"), move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("SMTP down")
                }
            });
        }
        let dispatcher = dispatcher(store.clone(), registry, QueueConfig::default());

        let start = Utc::now();
        for minute in 0..5 {
            dispatcher
                .tick_at(start + chrono::Duration::minutes(minute))
                .await
                .unwrap();
        }

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.as_deref(), Some("SMTP down"));
        assert!(job.failed_at.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = dispatcher.stats();
        assert_eq!(stats.ticks, 5);
        assert_eq!(stats.jobs_retried, 2);
        assert_eq!(stats.jobs_failed, 1);
    }

    #[tokio::test]
    async fn zero_max_retries_fails_on_first_error() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "send-email", 0).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { anyhow::bail!("SMTP down") });

        dispatcher(store.clone(), registry, QueueConfig::default())
            .tick()
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn missing_handler_releases_job_by_default() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "generate-report", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { Ok(serde_json::Value::Null) });

        let now = Utc::now();
        let config = QueueConfig::default();
        let report = dispatcher(store.clone(), registry, config.clone())
            .tick_at(now)
            .await
            .unwrap();
        assert_eq!(report.released, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.run_at, advance(now, config.poll_interval));
        assert_eq!(
            job.error.as_deref(),
            Some("no handler registered for job type 'generate-report'")
        );
    }

    #[tokio::test]
    async fn released_jobs_are_not_counted_as_processed() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "generate-report", 3).await;
        enqueue(&store, "send-email", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { Ok(serde_json::Value::Null) });

        let dispatcher = dispatcher(store, registry, QueueConfig::default());
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.claimed, 2);

        let stats = dispatcher.stats();
        assert_eq!(stats.jobs_released, 1);
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_processed, 1);
    }

    #[tokio::test]
    async fn missing_handler_can_fail_job() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "generate-report", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { Ok(serde_json::Value::Null) });

        let config = QueueConfig::default().with_missing_handler(MissingHandlerPolicy::Fail);
        let report = dispatcher(store.clone(), registry, config).tick().await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "slow", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("slow"), |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(serde_json::Value::Null)
        });

        let config = QueueConfig::default().with_job_timeout(Some(Duration::from_millis(50)));
        let report = dispatcher(store.clone(), registry, config).tick().await.unwrap();
        assert_eq!(report.retried, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("job timed out after 50ms"));
    }

    #[tokio::test]
    async fn panicking_handler_is_recorded_as_failure() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "explode", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("explode"), |_| async {
            panic!("boom");
        });

        let report = dispatcher(store.clone(), registry, QueueConfig::default())
            .tick()
            .await
            .unwrap();
        assert_eq!(report.retried, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn store_errors_abort_the_tick() {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { Ok(serde_json::Value::Null) });
        let dispatcher = Dispatcher::new(Arc::new(BrokenStore), registry, QueueConfig::default()).unwrap();

        assert!(matches!(dispatcher.tick().await, Err(StoreError::Storage(_))));
        assert_eq!(dispatcher.stats().store_errors, 1);
        assert_eq!(dispatcher.stats().ticks, 1);
    }

    #[tokio::test]
    async fn failed_outcome_write_does_not_strand_the_rest_of_the_batch() {
        let store = Arc::new(FlakyStore::default().fail_completions(1));
        for _ in 0..3 {
            enqueue(store.inner(), "send-email", 3).await;
        }
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(WorkerRegistry::new());
        {
            let runs = runs.clone();
            registry.register(job_type("send-email"), move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                async { Ok(serde_json::Value::Null) }
            });
        }
        let dispatcher = Dispatcher::new(store.clone(), registry, QueueConfig::default()).unwrap();

        assert!(matches!(dispatcher.tick().await, Err(StoreError::Storage(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        let counts = store.stats(&queue()).await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.processing, 1);

        let stats = dispatcher.stats();
        assert_eq!(stats.store_errors, 1);
        assert_eq!(stats.jobs_succeeded, 2);
        assert_eq!(stats.jobs_processed, 3);
    }

    #[tokio::test]
    async fn bounded_concurrency_runs_batch_in_parallel() {
        let store = InMemoryJobStore::arc();
        for _ in 0..8 {
            enqueue(&store, "work", 3).await;
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(WorkerRegistry::new());
        {
            let active = active.clone();
            let peak = peak.clone();
            registry.register(job_type("work"), move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            });
        }

        let config = QueueConfig::default().with_max_concurrent(4);
        let report = dispatcher(store.clone(), registry, config).tick().await.unwrap();

        assert_eq!(report.completed, 8);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak concurrency {peak}");
        assert!(peak >= 2, "peak concurrency {peak}");
        assert_eq!(store.stats(&queue()).await.unwrap().completed, 8);
    }

    async fn wait_for_status(store: &InMemoryJobStore, id: JobId, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.get(id).await.unwrap().map(|j| j.status) == Some(status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach expected status");
    }

    #[tokio::test]
    async fn spawned_loop_ticks_immediately_and_on_wake() {
        let store = InMemoryJobStore::arc();
        let first = enqueue(&store, "send-email", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { Ok(serde_json::Value::Null) });

        let wake = Arc::new(Notify::new());
        let config = QueueConfig::default().with_poll_interval(Duration::from_secs(3600));
        let dispatcher = dispatcher(store.clone(), registry, config).with_wake(wake.clone());
        let handle = dispatcher.clone().spawn();
        assert!(handle.is_running());

        wait_for_status(&store, first, JobStatus::Completed).await;

        let second = enqueue(&store, "send-email", 3).await;
        wake.notify_one();
        wait_for_status(&store, second, JobStatus::Completed).await;

        handle.shutdown().await;
        assert_eq!(dispatcher.stats().jobs_succeeded, 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_handler() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, "slow", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("slow"), |_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(serde_json::json!("done"))
        });

        let config = QueueConfig::default().with_poll_interval(Duration::from_secs(3600));
        let handle = dispatcher(store.clone(), registry, config).spawn();

        wait_for_status(&store, id, JobStatus::Processing).await;
        handle.shutdown().await;

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(serde_json::json!("done")));
    }

    #[tokio::test]
    async fn spawned_loop_survives_store_errors() {
        let store = Arc::new(FlakyStore::default().fail_claims(1));
        let id = enqueue(store.inner(), "send-email", 3).await;
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(job_type("send-email"), |_| async { Ok(serde_json::Value::Null) });

        let config = QueueConfig::default().with_poll_interval(Duration::from_millis(20));
        let dispatcher = Dispatcher::new(store.clone(), registry, config).unwrap();
        let handle = dispatcher.clone().spawn();

        wait_for_status(store.inner(), id, JobStatus::Completed).await;
        assert!(handle.is_running());
        handle.shutdown().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.store_errors, 1);
        assert_eq!(stats.jobs_succeeded, 1);
    }
}
