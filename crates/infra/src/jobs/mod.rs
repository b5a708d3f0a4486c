//! Durable job queue with retry, backoff, and retention cleanup.
//!
//! ## Design
//!
//! - Jobs live in a named queue and are routed to handlers by job type
//! - Claiming is a single atomic transition, so concurrent dispatchers never
//!   run the same job from one claim
//! - Failures are retried with exponential backoff until `max_retries`
//! - Terminal jobs are deleted once they are older than the retention window
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory for tests/dev, Postgres for production)
//! - `WorkerRegistry`: job type → handler
//! - `Dispatcher`: polling loop that claims, executes, and records outcomes
//! - `Reaper`: retention cleanup run after every tick
//! - `StatsReporter`: per-status counts for dashboards and health checks
//! - `JobQueue`: facade tying the above together

pub mod dispatcher;
pub mod postgres;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod stats;
pub mod store;

#[cfg(test)]
mod testing;

pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats, TickReport};
pub use postgres::PostgresJobStore;
pub use queue::{EnqueueOptions, JobQueue, QueueError};
pub use reaper::Reaper;
pub use registry::{HandlerResult, JobHandler, WorkerRegistry};
pub use stats::StatsReporter;
pub use store::{InMemoryJobStore, JobStore, QueueStats, StoreError};
