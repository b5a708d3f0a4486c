//! Tracing/logging setup shared by the job queue binaries and tests.

/// Initialize process-wide logging from the environment.
///
/// `RUST_LOG` selects the filter (default `info`), `JOBQUEUE_LOG_FORMAT`
/// selects `json` (default) or `pretty` output. Safe to call multiple times;
/// subsequent calls are no-ops.
pub fn init() {
    self::tracing::init(LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogFormat, UnknownLogFormat};
