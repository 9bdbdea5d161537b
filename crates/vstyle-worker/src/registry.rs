//! Work function registry.
//!
//! Work functions are registered per `(queue, kind)` at startup. Each carries
//! an [`ErrorClassifier`] deciding whether its failures are worth retrying.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use vstyle_models::QueueName;

use crate::error::{WorkError, WorkResult};
use crate::progress::ProgressReporter;

/// An opaque unit of analysis or render work.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    /// Run one attempt.
    async fn run(&self, payload: Value, progress: ProgressReporter) -> WorkResult<Value>;

    /// Reject a payload at submission time.
    fn validate(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Closure adapter produced by [`work_fn`].
pub struct FnWork<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`WorkFunction`].
///
/// ```ignore
/// let extract = work_fn(|payload, progress| async move {
///     progress.report(50)?;
///     Ok(json!({ "style": "noir" }))
/// });
/// ```
pub fn work_fn<F, Fut>(f: F) -> FnWork<F, Fut>
where
    F: Fn(Value, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = WorkResult<Value>> + Send,
{
    FnWork {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> WorkFunction for FnWork<F, Fut>
where
    F: Fn(Value, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = WorkResult<Value>> + Send,
{
    async fn run(&self, payload: Value, progress: ProgressReporter) -> WorkResult<Value> {
        (self.f)(payload, progress).await
    }
}

/// Whether a failed attempt should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Fatal,
}

/// Classifies work failures.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &WorkError) -> Retryability;
}

/// Retries what [`WorkError::is_retryable`] says is retryable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &WorkError) -> Retryability {
        if error.is_retryable() {
            Retryability::Retryable
        } else {
            Retryability::Fatal
        }
    }
}

impl<F> ErrorClassifier for F
where
    F: Fn(&WorkError) -> Retryability + Send + Sync,
{
    fn classify(&self, error: &WorkError) -> Retryability {
        self(error)
    }
}

/// A registered work function with its classifier.
#[derive(Clone)]
pub struct Registration {
    pub work: Arc<dyn WorkFunction>,
    pub classifier: Arc<dyn ErrorClassifier>,
}

/// Lookup table from `(queue, kind)` to work function.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    entries: HashMap<(QueueName, String), Registration>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `work` with the default classifier, replacing any previous
    /// registration for the same key.
    pub fn register(
        &mut self,
        queue: impl Into<QueueName>,
        kind: impl Into<String>,
        work: impl WorkFunction + 'static,
    ) {
        self.register_with_classifier(queue, kind, work, DefaultClassifier);
    }

    pub fn register_with_classifier(
        &mut self,
        queue: impl Into<QueueName>,
        kind: impl Into<String>,
        work: impl WorkFunction + 'static,
        classifier: impl ErrorClassifier + 'static,
    ) {
        self.entries.insert(
            (queue.into(), kind.into()),
            Registration {
                work: Arc::new(work),
                classifier: Arc::new(classifier),
            },
        );
    }

    pub fn get(&self, queue: &QueueName, kind: &str) -> Option<&Registration> {
        self.entries.get(&(queue.clone(), kind.to_string()))
    }

    /// Whether anything is registered on `queue`.
    pub fn has_queue(&self, queue: &QueueName) -> bool {
        self.entries.keys().any(|(q, _)| q == queue)
    }

    /// Distinct queues with at least one registration.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<_> = self.entries.keys().map(|(q, _)| q.clone()).collect();
        queues.sort();
        queues.dedup();
        queues
    }
}
