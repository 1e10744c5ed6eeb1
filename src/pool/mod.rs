//! Task dispatch pool.
//!
//! Core components:
//! - `pending` — `PendingEntry` (correlation id + reply slot) and the caller's `TaskHandle`
//! - `dispatcher` — busy set, FIFO queue and drain policy
//! - `WorkerPool` — cloneable handle to the coordinator task that owns the dispatcher
//!
//! Callers talk to the coordinator through a command channel and workers
//! talk to it through an event channel; the dispatcher state itself is only
//! ever touched from the coordinator task.

pub mod dispatcher;
pub mod pending;

pub use dispatcher::{Dispatcher, PoolStats};
pub use pending::{PendingEntry, TaskHandle};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::PoolConfig;
use crate::error::{Error, PoolError, Result};
use crate::task::{Task, TaskOutput};
use crate::worker::{HandlerRegistry, ThreadWorkerFactory, WorkerEvent, WorkerFactory, WorkerLink};

/// Requests from pool handles to the coordinator.
enum Command {
    Submit(PendingEntry),
    Stats(oneshot::Sender<PoolStats>),
    Terminate(oneshot::Sender<()>),
}

/// Fixed-size pool of worker threads with FIFO dispatch.
///
/// Cloning gives another handle to the same pool. The pool shuts down when
/// `terminate` is called or the last handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    size: usize,
}

impl WorkerPool {
    /// Start a pool running the built-in handlers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_registry(config, HandlerRegistry::builtin())
    }

    /// Start a pool whose workers dispatch through `registry`.
    pub fn with_registry(config: PoolConfig, registry: HandlerRegistry) -> Result<Self> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let factory = ThreadWorkerFactory::new(
            config.thread_name_prefix.clone(),
            Arc::new(registry),
            events_tx,
        );
        let dispatcher = Dispatcher::new(&config, factory)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        runtime.spawn(coordinate(dispatcher, commands_rx, events_rx));

        tracing::info!(
            size = config.size,
            max_queued = ?config.max_queued,
            "Worker pool started"
        );

        Ok(Self {
            commands: commands_tx,
            size: config.size,
        })
    }

    /// Number of worker slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a task. Never blocks; the outcome arrives through the handle.
    pub fn submit(&self, task: Task) -> TaskHandle {
        let (entry, handle) = PendingEntry::new(task);
        if let Err(mpsc::error::SendError(Command::Submit(entry))) =
            self.commands.send(Command::Submit(entry))
        {
            entry.reject(PoolError::Terminated);
        }
        handle
    }

    /// Submit a task and wait for its outcome.
    pub async fn execute(&self, task: Task) -> std::result::Result<TaskOutput, PoolError> {
        self.submit(task).await
    }

    /// Current load snapshot, or `None` once the pool has shut down.
    pub async fn stats(&self) -> Option<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Stats(tx)).ok()?;
        rx.await.ok()
    }

    /// Reject all outstanding tasks and shut down every worker.
    ///
    /// Returns once every worker thread has exited, so no handler is still
    /// running afterwards. Calling this again, from any handle, is a no-op.
    pub async fn terminate(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Terminate(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Whether the pool has shut down.
    pub fn is_terminated(&self) -> bool {
        self.commands.is_closed()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Coordinator loop: the only place the dispatcher is mutated.
async fn coordinate<F: WorkerFactory>(
    mut dispatcher: Dispatcher<F>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    let ack = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Submit(entry)) => dispatcher.submit(entry),
                Some(Command::Stats(reply)) => {
                    let _ = reply.send(dispatcher.stats());
                }
                Some(Command::Terminate(ack)) => break Some(ack),
                None => {
                    tracing::debug!("All pool handles dropped");
                    break None;
                }
            },
            Some(event) = events.recv() => dispatcher.handle_event(event),
        }
    };

    dispatcher.terminate();
    join_workers(dispatcher.release_workers()).await;

    // Close before acknowledging so every handle observes the shutdown once
    // `terminate` returns.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Submit(entry) => entry.reject(PoolError::Terminated),
            Command::Stats(_) => {}
            Command::Terminate(other) => {
                let _ = other.send(());
            }
        }
    }

    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

/// Wait for every context to exit without stalling the runtime.
async fn join_workers<L: WorkerLink + 'static>(mut links: Vec<L>) {
    let count = links.len();
    let joined = tokio::task::spawn_blocking(move || {
        for link in &mut links {
            link.join();
        }
    })
    .await;

    match joined {
        Ok(()) => tracing::debug!(count, "Worker contexts joined"),
        Err(e) => tracing::warn!(error = %e, "Failed to join worker contexts"),
    }
}
