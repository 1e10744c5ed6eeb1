use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::join_all;
use serde_json::Value;

use worker_pool::worker::builtin::find_primes;
use worker_pool::{PoolConfig, Task, TaskOutput, WorkerPool};

fn millis(d: Duration) -> String {
    format!("{:.2}ms", d.as_secs_f64() * 1000.0)
}

/// Submit every task up front and wait for all of them, in submission order.
async fn run_all(pool: &WorkerPool, tasks: Vec<Task>) -> anyhow::Result<Vec<TaskOutput>> {
    let handles: Vec<_> = tasks.into_iter().map(|task| pool.submit(task)).collect();
    join_all(handles)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .context("task failed")
}

fn array_len(value: &Value) -> usize {
    value.as_array().map(Vec::len).unwrap_or(0)
}

async fn demo_primes(pool: &WorkerPool) -> anyhow::Result<()> {
    eprintln!("\n── Parallel prime search ──────────────────────────");

    let ranges = [(1, 25_000), (25_001, 50_000), (50_001, 75_000), (75_001, 100_000)];
    let tasks = ranges
        .iter()
        .map(|(start, end)| {
            Task::new("findPrimes")
                .with_param("start", *start)
                .with_param("end", *end)
        })
        .collect();

    let started = Instant::now();
    let results = run_all(pool, tasks).await?;
    let total: usize = results.iter().map(|r| array_len(&r.result)).sum();

    eprintln!("   Primes found: {} in {}", total, millis(started.elapsed()));
    for (i, r) in results.iter().enumerate() {
        eprintln!(
            "   Range {}: {} primes ({})",
            i + 1,
            array_len(&r.result),
            millis(r.duration)
        );
    }
    Ok(())
}

async fn demo_fibonacci(pool: &WorkerPool) -> anyhow::Result<()> {
    eprintln!("\n── Large Fibonacci numbers ────────────────────────");

    let ns = [100u64, 500, 1000, 2000, 3000];
    let tasks = ns
        .iter()
        .map(|n| Task::new("fibonacci").with_param("n", *n))
        .collect();

    for (n, r) in ns.iter().zip(run_all(pool, tasks).await?) {
        let digits = r.result.as_str().unwrap_or_default();
        let head: String = digits.chars().take(20).collect();
        eprintln!(
            "   F({}) = {}... ({} digits, {})",
            n,
            head,
            digits.len(),
            millis(r.duration)
        );
    }
    Ok(())
}

async fn demo_mandelbrot(pool: &WorkerPool) -> anyhow::Result<()> {
    eprintln!("\n── Mandelbrot quarters ────────────────────────────");

    let size = 200;
    let tasks = (0..4)
        .map(|_| {
            Task::new("mandelbrot")
                .with_param("width", size)
                .with_param("height", size / 4)
                .with_param("iterations", 50)
        })
        .collect();

    let started = Instant::now();
    let results = run_all(pool, tasks).await?;
    let pixels: usize = results.iter().map(|r| array_len(&r.result)).sum();
    eprintln!("   Pixels computed: {} in {}", pixels, millis(started.elapsed()));
    Ok(())
}

async fn demo_load(pool: &WorkerPool) -> anyhow::Result<()> {
    eprintln!("\n── CPU load spread ────────────────────────────────");

    let tasks = (1..=8)
        .map(|i| {
            Task::new("heavyComputation")
                .with_param("iterations", 10_000_000)
                .with_param("taskId", i)
        })
        .collect();

    let started = Instant::now();
    let results = run_all(pool, tasks).await?;
    eprintln!("   8 tasks in {}", millis(started.elapsed()));
    for (i, r) in results.iter().enumerate() {
        eprintln!("   Task {}: {}", i + 1, millis(r.duration));
    }
    Ok(())
}

fn single_threaded_baseline() {
    eprintln!("\n── Single-threaded baseline ───────────────────────");
    let started = Instant::now();
    let count = find_primes(1, 50_000).len();
    eprintln!(
        "   Primes up to 50000: {} in {}",
        count,
        millis(started.elapsed())
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PoolConfig::from_env()?;

    eprintln!("Worker pool demo v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.size);

    let pool = WorkerPool::new(config)?;

    let outcome = async {
        demo_primes(&pool).await?;
        demo_fibonacci(&pool).await?;
        demo_mandelbrot(&pool).await?;
        demo_load(&pool).await?;
        single_threaded_baseline();
        anyhow::Ok(())
    }
    .await;

    pool.terminate().await;
    eprintln!("\nWorker pool terminated");

    outcome
}
