//! Infrastructure layer: job persistence, the dispatcher runtime, and
//! configuration loading.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, MissingHandlerPolicy, QueueConfig};
pub use jobs::{
    Dispatcher, DispatcherHandle, DispatcherStats, EnqueueOptions, HandlerResult, InMemoryJobStore,
    JobHandler, JobQueue, JobStore, PostgresJobStore, QueueError, QueueStats, Reaper, StatsReporter,
    StoreError, TickReport, WorkerRegistry,
};
