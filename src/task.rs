//! Task and worker message types.
//!
//! A task travels as a flat JSON-style object: the `type` discriminant sits
//! next to the operation's named parameters. Requests add the correlation
//! `id`; responses are tagged `result` or `error` and echo that id back.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TaskError;

/// Correlation identifier assigned by the pool at submission time.
pub type TaskId = Uuid;

/// Named task parameters.
pub type Params = Map<String, Value>;

/// Keys owned by the request envelope; a parameter may not use them.
pub const RESERVED_KEYS: &[&str] = &["type", "id"];

/// A caller-supplied unit of work: discriminant plus flat parameter bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Selects the operation the worker runs.
    #[serde(rename = "type")]
    pub kind: String,
    /// Operation-specific parameters.
    #[serde(flatten)]
    pub params: Params,
}

impl Task {
    /// Create a task with no parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Params::new(),
        }
    }

    /// Add a named parameter. Reserved names are dropped.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if RESERVED_KEYS.contains(&name.as_str()) {
            tracing::warn!(kind = %self.kind, param = %name, "Ignoring reserved task parameter");
            return self;
        }
        self.params.insert(name, value.into());
        self
    }

    /// Parse a flat `{"type": ..., ...params}` object.
    pub fn from_value(value: Value) -> Result<Self, TaskError> {
        let Value::Object(mut params) = value else {
            return Err(TaskError::InvalidParameters {
                kind: "<unknown>".to_string(),
                reason: "task must be a JSON object".to_string(),
            });
        };

        let task = match params.remove("type") {
            Some(Value::String(kind)) => Self { kind, params },
            _ => {
                return Err(TaskError::InvalidParameters {
                    kind: "<unknown>".to_string(),
                    reason: "task needs a string `type` field".to_string(),
                });
            }
        };
        task.check_params()?;
        Ok(task)
    }

    /// Reject parameters that would collide with the request envelope.
    pub fn check_params(&self) -> Result<(), TaskError> {
        match RESERVED_KEYS.iter().find(|key| self.params.contains_key(**key)) {
            Some(key) => Err(TaskError::InvalidParameters {
                kind: self.kind.clone(),
                reason: format!("`{key}` is reserved and cannot be a parameter"),
            }),
            None => Ok(()),
        }
    }

    /// Look up a parameter by name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// Message sent from the pool to a worker: `{"type", "id", ...params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: TaskId,
    #[serde(flatten)]
    pub task: Task,
}

/// Message sent from a worker back to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Result {
        id: TaskId,
        result: Value,
        #[serde(with = "duration_ms")]
        duration: Duration,
    },
    Error {
        id: TaskId,
        error: String,
    },
}

impl WorkerResponse {
    /// Correlation id echoed by the worker.
    pub fn id(&self) -> TaskId {
        match self {
            Self::Result { id, .. } | Self::Error { id, .. } => *id,
        }
    }
}

/// Successful outcome delivered to the submitting caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutput {
    /// Value produced by the worker.
    pub result: Value,
    /// Time the worker spent executing the task.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl TaskOutput {
    pub fn new(result: Value, duration: Duration) -> Self {
        Self { result, duration }
    }
}

/// Durations on the wire are fractional milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(millis / 1000.0).map_err(D::Error::custom)
    }
}
