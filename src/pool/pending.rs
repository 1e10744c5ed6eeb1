//! Pending entries and the caller-side handle they settle.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::PoolError;
use crate::task::{Task, TaskId, TaskOutput, WorkerRequest};

type Outcome = Result<TaskOutput, PoolError>;

/// Bookkeeping record tying a submitted task to its caller.
///
/// `resolve` and `reject` consume the entry, so an entry is settled at most
/// once. Dropping an unsettled entry surfaces as `PoolError::Terminated` on
/// the caller's handle.
#[derive(Debug)]
pub struct PendingEntry {
    id: TaskId,
    task: Task,
    submitted_at: DateTime<Utc>,
    reply: oneshot::Sender<Outcome>,
}

impl PendingEntry {
    /// Assign a fresh correlation id and pair the entry with its handle.
    pub fn new(task: Task) -> (Self, TaskHandle) {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        let entry = Self {
            id,
            task,
            submitted_at: Utc::now(),
            reply,
        };
        (entry, TaskHandle { id, rx })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Message to send to the worker for this entry.
    pub fn request(&self) -> WorkerRequest {
        WorkerRequest {
            id: self.id,
            task: self.task.clone(),
        }
    }

    /// Whether the caller dropped its handle.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub fn resolve(self, output: TaskOutput) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply.send(Ok(output));
    }

    pub fn reject(self, error: PoolError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Future returned by `WorkerPool::submit`.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Outcome>,
}

impl TaskHandle {
    /// Correlation id assigned to the task.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Terminated)))
    }
}
