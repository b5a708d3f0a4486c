//! `JobQueue` facade: enqueue, register handlers, run the dispatcher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use jobqueue_core::{DomainError, JobId, JobType, NewJob, QueueName};

use super::dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats};
use super::registry::{HandlerResult, JobHandler, WorkerRegistry};
use super::stats::StatsReporter;
use super::store::{JobStore, QueueStats, StoreError};
use crate::config::{ConfigError, QueueConfig};

/// Per-job overrides for [`JobQueue::enqueue`]. Unset fields fall back to
/// the queue configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the job becomes claimable.
    pub delay: Option<Duration>,
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Job queue facade error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One named queue: its store, handlers, and dispatcher.
///
/// Several queues may share a store; each owns its registry and loop.
pub struct JobQueue<S> {
    store: Arc<S>,
    registry: Arc<WorkerRegistry>,
    config: QueueConfig,
    queue: QueueName,
    wake: Arc<Notify>,
    dispatcher: Dispatcher<S>,
    reporter: StatsReporter<S>,
    running: Mutex<Option<DispatcherHandle>>,
}

impl<S: JobStore + 'static> JobQueue<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Result<Self, QueueError> {
        let registry = Arc::new(WorkerRegistry::new());
        let wake = Arc::new(Notify::new());
        let dispatcher = Dispatcher::new(store.clone(), registry.clone(), config.clone())?
            .with_wake(wake.clone());
        let queue = dispatcher.queue().clone();
        let reporter = StatsReporter::new(store.clone(), queue.clone());

        Ok(Self {
            store,
            registry,
            config,
            queue,
            wake,
            dispatcher,
            reporter,
            running: Mutex::new(None),
        })
    }

    /// Persist a new `pending` job and return its ID.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let job_type = JobType::new(job_type)?;
        let now = Utc::now();

        let mut job = NewJob::new(self.queue.clone(), job_type, payload)
            .with_priority(options.priority.unwrap_or(self.config.default_priority))
            .with_max_retries(options.max_retries.unwrap_or(self.config.default_max_retries));
        job = match options.delay {
            Some(delay) => job.delayed(now, delay),
            None => job.run_at(now),
        };

        let job_type = job.job_type.clone();
        let id = self.store.insert(job).await?;
        debug!(queue = %self.queue, job_id = %id, %job_type, "job enqueued");

        if options.delay.is_none_or(|delay| delay.is_zero()) {
            self.wake.notify_one();
        }
        Ok(id)
    }

    /// Register a closure handler for `job_type`.
    pub fn process<F, Fut>(&self, job_type: &str, handler: F) -> Result<(), QueueError>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.process_handler(job_type, handler)
    }

    /// Register any [`JobHandler`] for `job_type`.
    pub fn process_handler<H: JobHandler>(&self, job_type: &str, handler: H) -> Result<(), QueueError> {
        let job_type = JobType::new(job_type)?;
        if self.registry.register_handler(job_type.clone(), handler) {
            info!(queue = %self.queue, %job_type, "replaced job handler");
        }
        Ok(())
    }

    /// Start the dispatcher loop. Calling it while running is a no-op.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(DispatcherHandle::is_running) {
            return;
        }
        *running = Some(self.dispatcher.clone().spawn());
    }

    /// Stop the dispatcher loop, letting the in-flight tick finish.
    pub async fn stop(&self) {
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(DispatcherHandle::is_running)
    }

    /// Per-status job counts of this queue.
    pub async fn stats(&self) -> QueueStats {
        self.reporter.stats().await
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// The dispatcher, for driving ticks by hand.
    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}
