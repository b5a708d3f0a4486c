//! Job type → handler mapping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use jobqueue_core::JobType;

/// What a handler produces: a result value stored on the job, or an error
/// whose message is recorded and drives the retry decision.
pub type HandlerResult = anyhow::Result<serde_json::Value>;

/// Performs the work for one job type.
///
/// Any `Fn(serde_json::Value) -> impl Future<Output = HandlerResult>` closure
/// is a handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: serde_json::Value) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value) -> HandlerResult {
        (self)(payload).await
    }
}

/// Handlers registered for one queue instance.
///
/// One handler per job type; registering a type again replaces the previous
/// handler. Safe to update while a dispatcher is running.
#[derive(Default)]
pub struct WorkerRegistry {
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `job_type`. Returns `true` if it replaced a
    /// previous handler.
    pub fn register<F, Fut>(&self, job_type: JobType, handler: F) -> bool
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(job_type, handler)
    }

    /// Register any [`JobHandler`] for `job_type`.
    pub fn register_handler<H: JobHandler>(&self, job_type: JobType, handler: H) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type, Arc::new(handler))
            .is_some()
    }

    pub fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl core::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_type(name: &str) -> JobType {
        JobType::new(name).unwrap()
    }

    #[tokio::test]
    async fn registered_handler_is_found() {
        let registry = WorkerRegistry::new();
        assert!(registry.is_empty());

        registry.register(job_type("send-email"), |payload: serde_json::Value| async move {
            Ok(serde_json::json!({ "echo": payload }))
        });

        let handler = registry.lookup("send-email").unwrap();
        let out = handler.handle(serde_json::json!(1)).await.unwrap();
        assert_eq!(out, serde_json::json!({ "echo": 1 }));
        assert!(registry.lookup("unknown").is_none());
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = WorkerRegistry::new();
        let first = registry.register(job_type("roi"), |_| async { Ok(serde_json::json!("first")) });
        let second = registry.register(job_type("roi"), |_| async { Ok(serde_json::json!("second")) });

        assert!(!first);
        assert!(second);
        assert_eq!(registry.len(), 1);

        let out = registry.lookup("roi").unwrap().handle(serde_json::Value::Null).await.unwrap();
        assert_eq!(out, serde_json::json!("second"));
    }

    #[test]
    fn job_types_are_sorted() {
        let registry = WorkerRegistry::new();
        registry.register(job_type("b"), |_| async { Ok(serde_json::Value::Null) });
        registry.register(job_type("a"), |_| async { Ok(serde_json::Value::Null) });

        let names: Vec<_> = registry.job_types().into_iter().map(String::from).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn handle(&self, _payload: serde_json::Value) -> HandlerResult {
            anyhow::bail!("SMTP down")
        }
    }

    #[tokio::test]
    async fn struct_handlers_work_too() {
        let registry = WorkerRegistry::new();
        registry.register_handler(job_type("send-email"), Failing);

        let err = registry.lookup("send-email").unwrap().handle(serde_json::Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "SMTP down");
    }
}
