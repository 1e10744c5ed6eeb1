//! Worker execution contexts.
//!
//! Core components:
//! - `registry` — `TaskHandler` trait and the discriminant → handler table
//! - `builtin` — CPU-bound handlers (primes, fibonacci, mandelbrot, ...)
//! - `WorkerContext` — one long-lived OS thread running one task at a time

pub mod builtin;
pub mod registry;

pub use registry::{HandlerRegistry, StopFlag, TaskHandler};

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use crate::task::{WorkerRequest, WorkerResponse};

/// Identity of one worker context. Never reused within a pool, so a
/// replacement context is distinguishable from the one it replaced.
pub type WorkerId = usize;

/// What a worker context reports back to the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker finished a task (successfully or not).
    Response {
        worker: WorkerId,
        response: WorkerResponse,
    },
    /// The context itself died. No further events follow from this worker.
    Crashed { worker: WorkerId, reason: String },
}

/// The pool's side of a worker context.
pub trait WorkerLink: Send {
    fn id(&self) -> WorkerId;

    /// Hand a request to the worker. Gives the request back if the context
    /// can no longer accept work.
    fn dispatch(&mut self, request: WorkerRequest) -> Result<(), WorkerRequest>;

    /// Ask the context to stop: no further work is accepted and a running
    /// task is told to stop. Returns without waiting. Must be idempotent.
    fn shutdown(&mut self);

    /// Block until the context has fully exited. Call after `shutdown`.
    fn join(&mut self);
}

/// Creates worker contexts; used at pool construction and to replace
/// crashed workers.
pub trait WorkerFactory: Send {
    type Link: WorkerLink + 'static;

    fn spawn(&mut self, id: WorkerId) -> io::Result<Self::Link>;
}

/// A worker running on its own OS thread.
pub struct WorkerContext {
    id: WorkerId,
    inbox: Option<mpsc::UnboundedSender<WorkerRequest>>,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

impl WorkerContext {
    /// Start a worker thread.
    pub fn spawn(
        id: WorkerId,
        name: String,
        registry: Arc<HandlerRegistry>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> io::Result<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let stop = StopFlag::new();
        let thread_stop = stop.clone();

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(id, &registry, inbox_rx, &events, &thread_stop))?;

        tracing::debug!(worker = id, "Worker context started");

        Ok(Self {
            id,
            inbox: Some(inbox_tx),
            stop,
            thread: Some(thread),
        })
    }

    /// Whether the worker thread is still running, shut down or not.
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl WorkerLink for WorkerContext {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn dispatch(&mut self, request: WorkerRequest) -> Result<(), WorkerRequest> {
        match &self.inbox {
            Some(inbox) => inbox.send(request).map_err(|e| e.0),
            None => Err(request),
        }
    }

    fn shutdown(&mut self) {
        // Closing the inbox ends the worker loop once its current task returns.
        self.stop.stop();
        if self.inbox.take().is_some() {
            tracing::debug!(worker = self.id, "Worker context shut down");
        }
    }

    fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.join().is_err() {
            tracing::warn!(worker = self.id, "Worker thread panicked outside a task");
        } else {
            tracing::debug!(worker = self.id, "Worker thread joined");
        }
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    id: WorkerId,
    registry: &HandlerRegistry,
    mut inbox: mpsc::UnboundedReceiver<WorkerRequest>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    stop: &StopFlag,
) {
    while let Some(request) = inbox.blocking_recv() {
        let task_id = request.id;
        let kind = request.task.kind.clone();

        match panic::catch_unwind(AssertUnwindSafe(|| registry.execute(&request, stop))) {
            Ok(response) => {
                let event = WorkerEvent::Response {
                    worker: id,
                    response,
                };
                if events.send(event).is_err() {
                    // Pool is gone.
                    break;
                }
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::warn!(
                    worker = id,
                    task_id = %task_id,
                    kind = %kind,
                    reason = %reason,
                    "Worker context crashed"
                );
                let _ = events.send(WorkerEvent::Crashed { worker: id, reason });
                return;
            }
        }
    }

    tracing::debug!(worker = id, "Worker loop exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Spawns `WorkerContext` threads named `{prefix}-{id}`.
pub struct ThreadWorkerFactory {
    name_prefix: String,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl ThreadWorkerFactory {
    pub fn new(
        name_prefix: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            registry,
            events,
        }
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    type Link = WorkerContext;

    fn spawn(&mut self, id: WorkerId) -> io::Result<WorkerContext> {
        WorkerContext::spawn(
            id,
            format!("{}-{}", self.name_prefix, id),
            Arc::clone(&self.registry),
            self.events.clone(),
        )
    }
}
