//! Typed dispatch table mapping task discriminants to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::Value;

use crate::error::TaskError;
use crate::task::{Params, WorkerRequest, WorkerResponse};
use crate::worker::builtin;

/// Stop request raised when the owning worker context shuts down.
///
/// Handlers doing long work should poll it and return early once set.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this flag to stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(TaskError::Stopped)` once a stop has been requested.
    pub fn check(&self, kind: &str) -> Result<(), TaskError> {
        if self.is_stopped() {
            Err(TaskError::Stopped {
                kind: kind.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// An operation a worker knows how to run.
///
/// Handlers run synchronously on the worker's own thread; the pool never
/// hands a worker a second task before the first one reports back. Shutdown
/// waits for the running handler, so long operations should watch `stop`.
pub trait TaskHandler: Send + Sync {
    /// Discriminant this handler answers to.
    fn kind(&self) -> &str;

    /// Run the operation with the task's parameters.
    fn run(&self, params: &Params, stop: &StopFlag) -> Result<Value, TaskError>;
}

/// Registry of task handlers, shared read-only by every worker of a pool.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register a handler. A later registration replaces an earlier one of
    /// the same kind.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let kind = handler.kind().to_string();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::debug!(kind = %kind, "Replaced task handler");
        } else {
            tracing::debug!(kind = %kind, "Registered task handler");
        }
    }

    /// Builder-style `register`.
    pub fn with(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Get a handler by discriminant.
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(kind)
    }

    /// Check if a discriminant is known.
    pub fn has(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// All registered discriminants, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run a request and turn the outcome into the response message.
    ///
    /// Unknown discriminants are reported as an error response here; this is
    /// the only place task kinds are validated.
    pub fn execute(&self, request: &WorkerRequest, stop: &StopFlag) -> WorkerResponse {
        let kind = request.task.kind.as_str();
        let start = Instant::now();

        let outcome = match self.get(kind) {
            Some(handler) => handler.run(&request.task.params, stop),
            None => Err(TaskError::UnknownType {
                kind: kind.to_string(),
            }),
        };

        match outcome {
            Ok(result) => WorkerResponse::Result {
                id: request.id,
                result,
                duration: start.elapsed(),
            },
            Err(e) => WorkerResponse::Error {
                id: request.id,
                error: e.to_string(),
            },
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Extract a required unsigned integer parameter.
pub fn require_u64(kind: &str, params: &Params, name: &str) -> Result<u64, TaskError> {
    optional_u64(kind, params, name)?.ok_or_else(|| TaskError::InvalidParameters {
        kind: kind.to_string(),
        reason: format!("missing `{name}`"),
    })
}

/// Extract an optional unsigned integer parameter.
///
/// Whole-valued floats are accepted since callers often build parameters
/// from arithmetic (`size / 4`).
pub fn optional_u64(kind: &str, params: &Params, name: &str) -> Result<Option<u64>, TaskError> {
    let Some(value) = params.get(name) else {
        return Ok(None);
    };

    let parsed = value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    });

    parsed.map(Some).ok_or_else(|| TaskError::InvalidParameters {
        kind: kind.to_string(),
        reason: format!("`{name}` must be a non-negative integer, got {value}"),
    })
}
