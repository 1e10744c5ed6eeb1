//! Built-in CPU-bound task handlers.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::TaskError;
use crate::task::Params;
use crate::worker::registry::{HandlerRegistry, StopFlag, TaskHandler, optional_u64, require_u64};

/// Upper bound on mandelbrot buffer size (pixels).
const MAX_MANDELBROT_PIXELS: u64 = 16 * 1024 * 1024;

/// Largest `n` a fibonacci task accepts. F(100000) has 20899 digits.
const MAX_FIBONACCI_N: u64 = 100_000;

/// Loop iterations between stop-flag checks in the tight loops.
const STOP_CHECK_INTERVAL: u64 = 1 << 14;

/// Granularity of an interruptible echo delay.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Default escape-time iteration limit for mandelbrot tasks.
const DEFAULT_MANDELBROT_ITERATIONS: u64 = 100;

/// Register every built-in handler.
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(FindPrimes));
    registry.register(Arc::new(Fibonacci));
    registry.register(Arc::new(Mandelbrot));
    registry.register(Arc::new(HeavyComputation));
    registry.register(Arc::new(Echo));
}

/// `findPrimes {start, end}` — primes in the inclusive range.
pub struct FindPrimes;

impl TaskHandler for FindPrimes {
    fn kind(&self) -> &str {
        "findPrimes"
    }

    fn run(&self, params: &Params, stop: &StopFlag) -> Result<Value, TaskError> {
        let start = require_u64(self.kind(), params, "start")?;
        let end = require_u64(self.kind(), params, "end")?;
        let primes = primes_in(start, end, stop).ok_or_else(|| stopped(self.kind()))?;
        Ok(Value::from(primes))
    }
}

/// `fibonacci {n}` — F(n) as a decimal string.
pub struct Fibonacci;

impl TaskHandler for Fibonacci {
    fn kind(&self) -> &str {
        "fibonacci"
    }

    fn run(&self, params: &Params, stop: &StopFlag) -> Result<Value, TaskError> {
        let n = require_u64(self.kind(), params, "n")?;
        if n > MAX_FIBONACCI_N {
            return Err(TaskError::InvalidParameters {
                kind: self.kind().to_string(),
                reason: format!("`n` must be at most {MAX_FIBONACCI_N}, got {n}"),
            });
        }
        let digits = fibonacci_in(n, stop).ok_or_else(|| stopped(self.kind()))?;
        Ok(Value::String(digits))
    }
}

/// `mandelbrot {width, height, iterations}` — escape-time intensity bytes.
pub struct Mandelbrot;

impl TaskHandler for Mandelbrot {
    fn kind(&self) -> &str {
        "mandelbrot"
    }

    fn run(&self, params: &Params, stop: &StopFlag) -> Result<Value, TaskError> {
        let kind = self.kind();
        let width = require_u64(kind, params, "width")?;
        let height = require_u64(kind, params, "height")?;
        let iterations =
            optional_u64(kind, params, "iterations")?.unwrap_or(DEFAULT_MANDELBROT_ITERATIONS);

        if iterations == 0 {
            return Err(TaskError::InvalidParameters {
                kind: kind.to_string(),
                reason: "`iterations` must be at least 1".to_string(),
            });
        }

        match width.checked_mul(height) {
            Some(pixels) if pixels <= MAX_MANDELBROT_PIXELS => {}
            _ => {
                return Err(TaskError::InvalidParameters {
                    kind: kind.to_string(),
                    reason: format!("{width}x{height} exceeds {MAX_MANDELBROT_PIXELS} pixels"),
                });
            }
        }

        let iterations = u32::try_from(iterations).map_err(|_| TaskError::InvalidParameters {
            kind: kind.to_string(),
            reason: format!("`iterations` too large: {iterations}"),
        })?;

        let buffer = mandelbrot_in(width as usize, height as usize, iterations, stop)
            .ok_or_else(|| stopped(kind))?;
        Ok(Value::from(buffer))
    }
}

/// `heavyComputation {iterations}` — sum of `sqrt(i) * sin(i)`.
pub struct HeavyComputation;

impl TaskHandler for HeavyComputation {
    fn kind(&self) -> &str {
        "heavyComputation"
    }

    fn run(&self, params: &Params, stop: &StopFlag) -> Result<Value, TaskError> {
        let iterations = require_u64(self.kind(), params, "iterations")?;
        let mut sum = 0.0f64;
        for i in 0..iterations {
            if i % STOP_CHECK_INTERVAL == 0 {
                stop.check(self.kind())?;
            }
            let x = i as f64;
            sum += x.sqrt() * x.sin();
        }
        Ok(Value::from(sum))
    }
}

/// `echo {val, delay_ms}` — returns `val` unchanged after an optional delay.
pub struct Echo;

impl TaskHandler for Echo {
    fn kind(&self) -> &str {
        "echo"
    }

    fn run(&self, params: &Params, stop: &StopFlag) -> Result<Value, TaskError> {
        if let Some(delay) = optional_u64(self.kind(), params, "delay_ms")? {
            let deadline = Instant::now() + Duration::from_millis(delay);
            loop {
                stop.check(self.kind())?;
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                thread::sleep(left.min(SLEEP_SLICE));
            }
        }
        Ok(params.get("val").cloned().unwrap_or(Value::Null))
    }
}

fn stopped(kind: &str) -> TaskError {
    TaskError::Stopped {
        kind: kind.to_string(),
    }
}

fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }

    let mut i = 5u64;
    while i.saturating_mul(i) <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// Primes in `start..=end`.
pub fn find_primes(start: u64, end: u64) -> Vec<u64> {
    primes_in(start, end, &StopFlag::new()).unwrap_or_default()
}

/// `None` if `stop` was raised before the range was covered.
fn primes_in(start: u64, end: u64, stop: &StopFlag) -> Option<Vec<u64>> {
    let mut primes = Vec::new();
    for n in start..=end {
        if (n - start) % STOP_CHECK_INTERVAL == 0 && stop.is_stopped() {
            return None;
        }
        if is_prime(n) {
            primes.push(n);
        }
    }
    Some(primes)
}

/// Base of one limb in the decimal big-number representation.
const LIMB_BASE: u32 = 1_000_000_000;

/// F(n), exact, as a decimal string.
pub fn fibonacci(n: u64) -> String {
    fibonacci_in(n, &StopFlag::new()).unwrap_or_default()
}

fn fibonacci_in(n: u64, stop: &StopFlag) -> Option<String> {
    // Little-endian base-1e9 limbs.
    let mut prev: Vec<u32> = vec![0];
    let mut curr: Vec<u32> = vec![1];

    if n == 0 {
        return Some("0".to_string());
    }

    for i in 1..n {
        if i % 1024 == 0 && stop.is_stopped() {
            return None;
        }
        let next = add_limbs(&prev, &curr);
        prev = std::mem::replace(&mut curr, next);
    }

    let mut out = String::new();
    let mut limbs = curr.iter().rev();
    if let Some(head) = limbs.next() {
        out.push_str(&head.to_string());
    }
    for limb in limbs {
        out.push_str(&format!("{limb:09}"));
    }
    Some(out)
}

fn add_limbs(a: &[u32], b: &[u32]) -> Vec<u32> {
    let len = a.len().max(b.len());
    let mut sum = Vec::with_capacity(len + 1);
    let mut carry = 0u32;

    for i in 0..len {
        let digit = a.get(i).copied().unwrap_or(0) + b.get(i).copied().unwrap_or(0) + carry;
        sum.push(digit % LIMB_BASE);
        carry = digit / LIMB_BASE;
    }
    if carry > 0 {
        sum.push(carry);
    }
    sum
}

/// Escape-time rendering of the mandelbrot set over `[-2.5, 1] x [-1, 1]`.
pub fn mandelbrot(width: usize, height: usize, max_iterations: u32) -> Vec<u8> {
    mandelbrot_in(width, height, max_iterations, &StopFlag::new()).unwrap_or_default()
}

fn mandelbrot_in(
    width: usize,
    height: usize,
    max_iterations: u32,
    stop: &StopFlag,
) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; width * height];

    for y in 0..height {
        if stop.is_stopped() {
            return None;
        }
        for x in 0..width {
            let cx = (x as f64 / width as f64) * 3.5 - 2.5;
            let cy = (y as f64 / height as f64) * 2.0 - 1.0;

            let (mut zx, mut zy) = (0.0f64, 0.0f64);
            let mut iteration = 0;
            while zx * zx + zy * zy < 4.0 && iteration < max_iterations {
                let tmp = zx * zx - zy * zy + cx;
                zy = 2.0 * zx * zy + cy;
                zx = tmp;
                iteration += 1;
            }

            buffer[y * width + x] = (iteration as f64 / max_iterations as f64 * 255.0) as u8;
        }
    }

    Some(buffer)
}
