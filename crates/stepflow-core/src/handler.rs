//! Task handler interface and registry
//!
//! The engine treats task implementations as opaque capabilities: a handler
//! receives the step's input and returns success with output or a typed
//! failure. The registry maps the `resource` names used in definitions to
//! handler implementations; it is populated at startup and read-only after.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Outcome of a task handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Success {
        output: Value,
    },
    Failure {
        error_type: String,
        error_message: String,
    },
}

impl TaskResult {
    /// Successful result carrying the handler's output.
    pub fn success(output: Value) -> Self {
        Self::Success { output }
    }

    /// Typed failure.
    pub fn failure(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self::Failure {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }
}

/// Per-invocation context passed to a handler.
///
/// The deadline is advisory, derived from the state's `timeout` seconds:
/// handlers SHOULD stop work past it, but the engine never aborts a running
/// handler. A handler that never returns is recovered by the reaper.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// User-visible execution id
    pub execution_id: String,
    /// Name of the state being executed
    pub step_name: String,
    /// Advisory deadline for this invocation
    pub deadline: Option<DateTime<Utc>>,
}

/// A task implementation, keyed in the registry by resource name.
///
/// Handlers must tolerate concurrent invocation with different inputs, and
/// may be re-invoked with the same input after a crash recovery (at-least-once
/// execution).
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn execute(&self, input: Value, ctx: TaskContext) -> TaskResult;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Value, TaskContext) -> BoxedHandlerFuture + Send + Sync + 'static,
{
    async fn execute(&self, input: Value, ctx: TaskContext) -> TaskResult {
        (self.0)(input, ctx).await
    }
}

/// Maps resource names to handlers.
///
/// Built once by the host, then shared immutably across workers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a resource name.
    pub fn register(&mut self, resource: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(resource.into(), handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, resource: impl Into<String>, handler: F)
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let boxed = move |input: Value, ctx: TaskContext| -> BoxedHandlerFuture {
            Box::pin(handler(input, ctx))
        };
        self.register(resource, Arc::new(FnHandler(boxed)));
    }

    /// Look up a handler by resource name.
    pub fn get(&self, resource: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(resource).cloned()
    }

    /// Registered resource names.
    pub fn resources(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
