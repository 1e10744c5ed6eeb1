//! Error types for the worker pool.

use uuid::Uuid;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker pool needs a tokio runtime: {0}")]
    Runtime(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures raised inside a worker while running a task.
///
/// These never cross the thread boundary as values: the worker flattens them
/// into the `error` string of its response message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown task type: {kind}")]
    UnknownType { kind: String },

    #[error("Invalid parameters for {kind}: {reason}")]
    InvalidParameters { kind: String, reason: String },

    #[error("Task {kind} failed: {reason}")]
    Failed { kind: String, reason: String },

    #[error("Task {kind} stopped: worker shutting down")]
    Stopped { kind: String },
}

/// Caller-facing outcome of a rejected submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The worker ran the task and reported an error.
    #[error("{message}")]
    Task { id: Uuid, message: String },

    /// The worker context died while this task was in flight.
    #[error("Worker {worker} crashed while running task {id}: {reason}")]
    WorkerCrashed {
        id: Uuid,
        worker: usize,
        reason: String,
    },

    /// The task was refused before dispatch.
    #[error("Invalid task: {0}")]
    InvalidTask(TaskError),

    #[error("Worker pool terminated")]
    Terminated,

    #[error("No live workers left in the pool")]
    NoWorkers,

    #[error("Task queue is full ({max} pending tasks)")]
    QueueFull { max: usize },
}

impl PoolError {
    /// Message reported by the worker, if this is a task-level failure.
    pub fn task_message(&self) -> Option<&str> {
        match self {
            Self::Task { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
