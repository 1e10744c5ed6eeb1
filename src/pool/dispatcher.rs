//! Dispatch bookkeeping: busy set, FIFO wait queue and correlation table.
//!
//! `Dispatcher` is plain synchronous state. It is owned by exactly one
//! coordinator and only mutated in response to a submission, a worker event
//! or a shutdown request, so it needs no locking of its own.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use serde::Serialize;

use crate::config::PoolConfig;
use crate::error::{Error, PoolError};
use crate::pool::pending::PendingEntry;
use crate::task::{TaskOutput, WorkerResponse};
use crate::worker::{WorkerEvent, WorkerFactory, WorkerId, WorkerLink};

/// Snapshot of the pool's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured number of worker slots.
    pub size: usize,
    /// Slots holding a usable worker context.
    pub live: usize,
    /// Workers with a task in flight.
    pub busy: usize,
    /// Tasks waiting for a free worker.
    pub queued: usize,
    /// Tasks resolved with a result.
    pub completed: u64,
    /// Tasks rejected by a worker error or crash.
    pub failed: u64,
}

/// Matches queued tasks to free workers and routes responses back.
///
/// A worker is busy exactly when it has an entry in `in_flight`; there is no
/// separate busy flag to keep in sync.
pub struct Dispatcher<F: WorkerFactory> {
    factory: F,
    /// One slot per configured worker; `None` once a context is lost for good.
    workers: Vec<Option<F::Link>>,
    /// Shut-down contexts that still have to be joined.
    retired: Vec<F::Link>,
    in_flight: HashMap<WorkerId, PendingEntry>,
    queue: VecDeque<PendingEntry>,
    next_worker_id: WorkerId,
    max_queued: Option<usize>,
    replace_crashed: bool,
    completed: u64,
    failed: u64,
    terminated: bool,
}

impl<F: WorkerFactory> Dispatcher<F> {
    /// Eagerly create every worker context.
    pub fn new(config: &PoolConfig, mut factory: F) -> Result<Self, Error> {
        config.validate()?;

        let mut workers = Vec::with_capacity(config.size);
        for id in 0..config.size {
            match factory.spawn(id) {
                Ok(link) => workers.push(Some(link)),
                Err(e) => {
                    for link in workers.iter_mut().flatten() {
                        link.shutdown();
                        link.join();
                    }
                    return Err(Error::Spawn(e));
                }
            }
        }

        Ok(Self {
            factory,
            workers,
            retired: Vec::new(),
            in_flight: HashMap::new(),
            queue: VecDeque::new(),
            next_worker_id: config.size,
            max_queued: config.max_queued,
            replace_crashed: config.replace_crashed_workers,
            completed: 0,
            failed: 0,
            terminated: false,
        })
    }

    /// Queue a task and try to dispatch it right away.
    pub fn submit(&mut self, entry: PendingEntry) {
        if self.terminated {
            entry.reject(PoolError::Terminated);
            return;
        }

        if self.live_workers() == 0 {
            entry.reject(PoolError::NoWorkers);
            return;
        }

        if let Err(e) = entry.task().check_params() {
            tracing::debug!(task_id = %entry.id(), error = %e, "Rejecting invalid task");
            entry.reject(PoolError::InvalidTask(e));
            return;
        }

        if let Some(max) = self.max_queued
            && self.queue.len() >= max
        {
            tracing::warn!(task_id = %entry.id(), max, "Task queue full, rejecting");
            entry.reject(PoolError::QueueFull { max });
            return;
        }

        tracing::debug!(
            task_id = %entry.id(),
            kind = %entry.task().kind,
            "Task submitted"
        );
        self.queue.push_back(entry);
        self.drain();
    }

    /// Hand queued tasks to free workers, oldest first, until either runs out.
    ///
    /// Returns the number of tasks dispatched.
    pub fn drain(&mut self) -> usize {
        let mut dispatched = 0;

        while !self.queue.is_empty() {
            let Some(slot) = self.free_slot() else {
                break;
            };
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            if entry.is_abandoned() {
                tracing::debug!(task_id = %entry.id(), "Caller went away, dropping queued task");
                continue;
            }
            let Some(link) = self.workers[slot].as_mut() else {
                self.queue.push_front(entry);
                break;
            };

            let worker = link.id();
            match link.dispatch(entry.request()) {
                Ok(()) => {
                    let waited = Utc::now() - entry.submitted_at();
                    tracing::debug!(
                        task_id = %entry.id(),
                        worker,
                        waited_ms = waited.num_milliseconds(),
                        "Task dispatched"
                    );
                    self.in_flight.insert(worker, entry);
                    dispatched += 1;
                }
                Err(_) => {
                    // Context is gone; the task goes back to the head of the line.
                    self.queue.push_front(entry);
                    self.retire(slot, "worker refused dispatch");
                }
            }
        }

        dispatched
    }

    /// Route a worker event.
    pub fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Response { worker, response } => self.handle_response(worker, response),
            WorkerEvent::Crashed { worker, reason } => self.handle_crash(worker, &reason),
        }
    }

    /// Settle the in-flight entry a response belongs to, then drain.
    ///
    /// Responses whose id does not match the worker's in-flight task are
    /// ignored.
    pub fn handle_response(&mut self, worker: WorkerId, response: WorkerResponse) {
        match self.in_flight.get(&worker) {
            Some(entry) if entry.id() == response.id() => {}
            Some(entry) => {
                tracing::warn!(
                    worker,
                    expected = %entry.id(),
                    received = %response.id(),
                    "Ignoring stale worker message"
                );
                return;
            }
            None => {
                tracing::warn!(
                    worker,
                    received = %response.id(),
                    "Ignoring message from idle worker"
                );
                return;
            }
        }

        let Some(entry) = self.in_flight.remove(&worker) else {
            return;
        };

        match response {
            WorkerResponse::Result {
                result, duration, ..
            } => {
                tracing::debug!(
                    task_id = %entry.id(),
                    worker,
                    duration_ms = duration.as_millis() as u64,
                    "Task completed"
                );
                self.completed += 1;
                entry.resolve(TaskOutput::new(result, duration));
            }
            WorkerResponse::Error { error, .. } => {
                tracing::debug!(task_id = %entry.id(), worker, error = %error, "Task failed");
                self.failed += 1;
                let id = entry.id();
                entry.reject(PoolError::Task { id, message: error });
            }
        }

        self.drain();
    }

    /// A worker context died: reject its in-flight task, replace or retire
    /// the worker, then drain.
    pub fn handle_crash(&mut self, worker: WorkerId, reason: &str) {
        let Some(slot) = self.slot_of(worker) else {
            tracing::debug!(worker, "Crash report from a retired worker");
            return;
        };

        tracing::warn!(worker, reason = %reason, "Worker context failed");

        if let Some(entry) = self.in_flight.remove(&worker) {
            self.failed += 1;
            let id = entry.id();
            entry.reject(PoolError::WorkerCrashed {
                id,
                worker,
                reason: reason.to_string(),
            });
        }

        self.retire(slot, reason);
        self.drain();
    }

    /// Reject everything outstanding and tell every worker context to stop.
    /// Safe to call more than once. The contexts still have to be joined; see
    /// `release_workers`.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        let queued = self.queue.len();
        let in_flight = self.in_flight.len();

        for entry in self.queue.drain(..) {
            entry.reject(PoolError::Terminated);
        }
        for (_, entry) in self.in_flight.drain() {
            entry.reject(PoolError::Terminated);
        }
        for link in self.workers.iter_mut().flatten() {
            link.shutdown();
        }

        tracing::info!(queued, in_flight, "Worker pool terminated");
    }

    /// Hand over every context, live or retired, for joining.
    ///
    /// Only meaningful after `terminate`; the dispatcher has no workers left
    /// afterwards.
    pub fn release_workers(&mut self) -> Vec<F::Link> {
        let mut links: Vec<F::Link> = self.workers.iter_mut().filter_map(Option::take).collect();
        links.append(&mut self.retired);
        links
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.workers.len(),
            live: self.live_workers(),
            busy: self.in_flight.len(),
            queued: self.queue.len(),
            completed: self.completed,
            failed: self.failed,
        }
    }

    /// Workers currently holding a task.
    pub fn busy_workers(&self) -> Vec<WorkerId> {
        let mut busy: Vec<WorkerId> = self.in_flight.keys().copied().collect();
        busy.sort_unstable();
        busy
    }

    fn live_workers(&self) -> usize {
        self.workers.iter().flatten().count()
    }

    fn free_slot(&self) -> Option<usize> {
        self.workers.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|link| !self.in_flight.contains_key(&link.id()))
        })
    }

    fn slot_of(&self, worker: WorkerId) -> Option<usize> {
        self.workers
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|link| link.id() == worker))
    }

    /// Drop the context in `slot`, spawning a replacement when configured.
    fn retire(&mut self, slot: usize, reason: &str) {
        if let Some(mut link) = self.workers[slot].take() {
            link.shutdown();
            self.retired.push(link);
        }

        if self.replace_crashed && !self.terminated {
            let id = self.next_worker_id;
            self.next_worker_id += 1;
            match self.factory.spawn(id) {
                Ok(link) => {
                    tracing::info!(slot, worker = id, reason = %reason, "Replaced worker context");
                    self.workers[slot] = Some(link);
                }
                Err(e) => {
                    tracing::warn!(slot, error = %e, "Failed to replace worker context");
                }
            }
        }

        if self.live_workers() == 0 {
            tracing::warn!(
                queued = self.queue.len(),
                "No live workers left, rejecting queued tasks"
            );
            for entry in self.queue.drain(..) {
                entry.reject(PoolError::NoWorkers);
            }
        }
    }
}
