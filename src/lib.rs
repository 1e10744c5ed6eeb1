//! Worker pool — fixed-size background workers with FIFO task dispatch.

pub mod config;
pub mod error;
pub mod pool;
pub mod task;
pub mod worker;

pub use config::PoolConfig;
pub use error::{Error, PoolError, Result, TaskError};
pub use pool::{PoolStats, TaskHandle, WorkerPool};
pub use task::{Task, TaskId, TaskOutput};
pub use worker::{HandlerRegistry, StopFlag, TaskHandler};
