//! `jobqueue-core` — job queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no storage or runtime
//! concerns): identifiers, the job record and its status state machine, and
//! the retry/backoff arithmetic.

pub mod error;
pub mod id;
pub mod job;
pub mod name;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobStatus, NewJob};
pub use name::{JobType, QueueName};
pub use retry::RetryPolicy;
