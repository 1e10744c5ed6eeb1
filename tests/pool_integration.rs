//! Integration tests for the worker pool.
//!
//! Each test starts a real pool (OS-thread workers) and exercises it only
//! through the public submit / execute / terminate surface.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::{Value, json};
use tokio::time::timeout;

use worker_pool::task::Params;
use worker_pool::{
    HandlerRegistry, PoolConfig, PoolError, StopFlag, Task, TaskError, TaskHandler, WorkerPool,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn within<F: Future>(fut: F) -> F::Output {
    timeout(TEST_TIMEOUT, fut).await.expect("test timed out")
}

#[derive(Debug, Clone, PartialEq)]
enum Mark {
    Started(i64),
    Finished(i64),
}

/// `record {val, delay_ms}` — logs start and finish around an optional sleep.
struct Recorder {
    log: Arc<Mutex<Vec<Mark>>>,
}

impl TaskHandler for Recorder {
    fn kind(&self) -> &str {
        "record"
    }

    fn run(&self, params: &Params, _stop: &StopFlag) -> Result<Value, TaskError> {
        let val = params.get("val").and_then(Value::as_i64).unwrap_or_default();
        let delay = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);

        self.log.lock().unwrap().push(Mark::Started(val));
        thread::sleep(Duration::from_millis(delay));
        self.log.lock().unwrap().push(Mark::Finished(val));

        Ok(json!(val))
    }
}

/// `track {delay_ms}` — records the highest number of concurrent runs.
struct ConcurrencyTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl TaskHandler for ConcurrencyTracker {
    fn kind(&self) -> &str {
        "track"
    }

    fn run(&self, params: &Params, _stop: &StopFlag) -> Result<Value, TaskError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(5);
        thread::sleep(Duration::from_millis(delay));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

/// `crash` — kills the worker context.
struct Crash;

impl TaskHandler for Crash {
    fn kind(&self) -> &str {
        "crash"
    }

    fn run(&self, _params: &Params, _stop: &StopFlag) -> Result<Value, TaskError> {
        panic!("worker context lost");
    }
}

fn record(val: i64, delay_ms: u64) -> Task {
    Task::new("record")
        .with_param("val", val)
        .with_param("delay_ms", delay_ms)
}

fn recording_pool(size: usize) -> (WorkerPool, Arc<Mutex<Vec<Mark>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::builtin().with(Arc::new(Recorder {
        log: Arc::clone(&log),
    }));
    let pool = WorkerPool::with_registry(PoolConfig::with_size(size), registry).unwrap();
    (pool, log)
}

fn position(log: &[Mark], mark: &Mark) -> usize {
    log.iter()
        .position(|m| m == mark)
        .unwrap_or_else(|| panic!("{mark:?} not in {log:?}"))
}

#[tokio::test]
async fn two_workers_three_echo_tasks() {
    let (pool, log) = recording_pool(2);

    let a = pool.submit(record(1, 100));
    let b = pool.submit(record(2, 100));
    let c = pool.submit(record(3, 10));

    let results = within(join_all([a, b, c])).await;
    let values: Vec<Value> = results.into_iter().map(|r| r.unwrap().result).collect();
    assert_eq!(values, vec![json!(1), json!(2), json!(3)]);

    let log = log.lock().unwrap().clone();
    let first_finish = position(&log, &Mark::Finished(1)).min(position(&log, &Mark::Finished(2)));

    // A and B start right away; C waits for one of them to free a worker.
    assert!(position(&log, &Mark::Started(1)) < first_finish);
    assert!(position(&log, &Mark::Started(2)) < first_finish);
    assert!(position(&log, &Mark::Started(3)) > first_finish);

    pool.terminate().await;
}

#[tokio::test]
async fn builtin_echo_scenario() {
    let pool = WorkerPool::new(PoolConfig::with_size(2)).unwrap();

    let handles: Vec<_> = (1..=3)
        .map(|val| {
            pool.submit(
                Task::new("echo")
                    .with_param("val", val)
                    .with_param("delay_ms", 20),
            )
        })
        .collect();

    let results = within(join_all(handles)).await;
    for (expected, result) in (1..=3).zip(results) {
        let output = result.unwrap();
        assert_eq!(output.result, json!(expected));
        assert!(output.duration >= Duration::from_millis(20));
    }

    pool.terminate().await;
}

#[tokio::test]
async fn concurrency_bounded_by_pool_size() {
    let tracker = Arc::new(ConcurrencyTracker {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let registry = HandlerRegistry::new().with(Arc::clone(&tracker) as Arc<dyn TaskHandler>);
    let pool = WorkerPool::with_registry(PoolConfig::with_size(3), registry).unwrap();

    let handles: Vec<_> = (0..12).map(|_| pool.submit(Task::new("track"))).collect();
    for result in within(join_all(handles)).await {
        result.unwrap();
    }

    let peak = tracker.peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency {peak}");

    pool.terminate().await;
}

#[tokio::test]
async fn queued_tasks_start_in_submission_order() {
    let (pool, log) = recording_pool(1);

    let handles: Vec<_> = (0..6).map(|val| pool.submit(record(val, 1))).collect();
    for result in within(join_all(handles)).await {
        result.unwrap();
    }

    let starts: Vec<i64> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| match m {
            Mark::Started(v) => Some(*v),
            Mark::Finished(_) => None,
        })
        .collect();
    assert_eq!(starts, vec![0, 1, 2, 3, 4, 5]);

    pool.terminate().await;
}

#[tokio::test]
async fn unknown_task_type_rejects_and_pool_stays_usable() {
    let pool = WorkerPool::new(PoolConfig::with_size(1)).unwrap();

    let err = within(pool.execute(Task::new("bogus"))).await.unwrap_err();
    match &err {
        PoolError::Task { message, .. } => assert_eq!(message, "Unknown task type: bogus"),
        other => panic!("Expected task error, got {other:?}"),
    }

    let output = within(pool.execute(Task::new("echo").with_param("val", 9)))
        .await
        .unwrap();
    assert_eq!(output.result, json!(9));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);

    pool.terminate().await;
}

#[tokio::test]
async fn builtin_workloads() {
    let pool = WorkerPool::new(PoolConfig::with_size(2)).unwrap();

    let primes = pool.submit(
        Task::new("findPrimes")
            .with_param("start", 1)
            .with_param("end", 100),
    );
    let fib = pool.submit(Task::new("fibonacci").with_param("n", 100));
    let image = pool.submit(
        Task::new("mandelbrot")
            .with_param("width", 20)
            .with_param("height", 5)
            .with_param("iterations", 10),
    );
    let heavy = pool.submit(Task::new("heavyComputation").with_param("iterations", 1000));

    let (primes, fib, image, heavy) = within(async {
        tokio::join!(primes, fib, image, heavy)
    })
    .await;

    assert_eq!(primes.unwrap().result.as_array().unwrap().len(), 25);
    assert_eq!(fib.unwrap().result, json!("354224848179261915075"));
    assert_eq!(image.unwrap().result.as_array().unwrap().len(), 100);
    assert!(heavy.unwrap().result.is_f64());

    pool.terminate().await;
}

#[tokio::test]
async fn invalid_parameters_reject() {
    let pool = WorkerPool::new(PoolConfig::with_size(1)).unwrap();

    let task = Task::from_value(json!({"type": "fibonacci", "n": "ten"})).unwrap();
    let err = within(pool.execute(task)).await.unwrap_err();
    assert!(
        err.task_message()
            .is_some_and(|m| m.starts_with("Invalid parameters for fibonacci")),
        "unexpected error: {err}"
    );

    pool.terminate().await;
}

#[tokio::test]
async fn worker_crash_rejects_task_and_worker_is_replaced() {
    let registry = HandlerRegistry::builtin().with(Arc::new(Crash));
    let pool = WorkerPool::with_registry(PoolConfig::with_size(1), registry).unwrap();

    let crashed = pool.submit(Task::new("crash"));
    let queued = pool.submit(Task::new("echo").with_param("val", "after"));

    match within(crashed).await {
        Err(PoolError::WorkerCrashed { reason, .. }) => {
            assert_eq!(reason, "worker context lost");
        }
        other => panic!("Expected WorkerCrashed, got {other:?}"),
    }
    assert_eq!(within(queued).await.unwrap().result, json!("after"));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.failed, 1);

    pool.terminate().await;
}

#[tokio::test]
async fn terminate_rejects_outstanding_and_is_idempotent() {
    let (pool, log) = recording_pool(1);

    let running = pool.submit(record(1, 300));
    let waiting = pool.submit(record(2, 0));

    // Let the first task reach its worker.
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.terminate().await;
    pool.terminate().await;
    pool.clone().terminate().await;

    assert_eq!(within(running).await.unwrap_err(), PoolError::Terminated);
    // Terminate waited for the running handler to return.
    assert_eq!(*log.lock().unwrap(), vec![Mark::Started(1), Mark::Finished(1)]);
    assert_eq!(within(waiting).await.unwrap_err(), PoolError::Terminated);
    assert!(pool.is_terminated());

    let late = pool.submit(record(3, 0));
    assert_eq!(within(late).await.unwrap_err(), PoolError::Terminated);
}

#[tokio::test]
async fn no_handler_runs_after_terminate_returns() {
    let tracker = Arc::new(ConcurrencyTracker {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let registry = HandlerRegistry::new().with(Arc::clone(&tracker) as Arc<dyn TaskHandler>);
    let pool = WorkerPool::with_registry(PoolConfig::with_size(2), registry).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| pool.submit(Task::new("track").with_param("delay_ms", 400)))
        .collect();
    within(async {
        while tracker.active.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    within(pool.terminate()).await;
    assert_eq!(tracker.active.load(Ordering::SeqCst), 0);

    for result in join_all(handles).await {
        assert_eq!(result.unwrap_err(), PoolError::Terminated);
    }
}

#[tokio::test]
async fn terminate_stops_long_builtin_work() {
    let pool = WorkerPool::new(PoolConfig::with_size(1)).unwrap();

    let endless = pool.submit(Task::new("heavyComputation").with_param("iterations", u64::MAX));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    within(pool.terminate()).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(within(endless).await.unwrap_err(), PoolError::Terminated);
}

#[tokio::test]
async fn reserved_parameter_names_are_refused() {
    let pool = WorkerPool::new(PoolConfig::with_size(1)).unwrap();

    let err = Task::from_value(json!({"type": "echo", "id": 1})).unwrap_err();
    assert!(matches!(err, TaskError::InvalidParameters { .. }));

    let mut task = Task::new("echo");
    task.params.insert("type".to_string(), json!("fibonacci"));
    let err = within(pool.execute(task)).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidTask(_)), "unexpected error: {err}");

    // Builder drops the reserved name, so the task still runs.
    let output = within(pool.execute(Task::new("echo").with_param("id", 1).with_param("val", 2)))
        .await
        .unwrap();
    assert_eq!(output.result, json!(2));

    pool.terminate().await;
}

#[tokio::test]
async fn dropping_last_handle_terminates() {
    let (pool, _log) = recording_pool(1);
    let other = pool.clone();

    let pending = pool.submit(record(1, 300));
    drop(pool);

    // One handle is still alive, so the task is still outstanding.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!other.is_terminated());

    drop(other);
    assert_eq!(within(pending).await.unwrap_err(), PoolError::Terminated);
}

#[tokio::test]
async fn queue_limit_rejects_overflow() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new().with(Arc::new(Recorder {
        log: Arc::clone(&log),
    }));
    let config = PoolConfig {
        max_queued: Some(1),
        ..PoolConfig::with_size(1)
    };
    let pool = WorkerPool::with_registry(config, registry).unwrap();

    let running = pool.submit(record(1, 100));
    let waiting = pool.submit(record(2, 0));
    let overflow = pool.submit(record(3, 0));

    assert_eq!(
        within(overflow).await.unwrap_err(),
        PoolError::QueueFull { max: 1 }
    );
    assert_eq!(within(running).await.unwrap().result, json!(1));
    assert_eq!(within(waiting).await.unwrap().result, json!(2));

    pool.terminate().await;
}
