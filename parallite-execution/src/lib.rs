//! Worker-pool execution engine for the parallite daemon
//!
//! This crate owns the executor side of the daemon: spawning worker
//! processes, leasing them out of a bounded pool, correlating in-flight
//! tasks with their deadlines, and dispatching one submission to one
//! worker at a time.

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod worker;

// Re-export main types
pub use dispatcher::Dispatcher;
pub use error::ExecutionError;
pub use executor::{Executor, FailMode};
pub use pool::{resolve_capacity, PoolCounts, WorkerPool};
pub use registry::{Registration, TaskRegistry};
pub use worker::{WorkerProcess, WorkerSpec, DEFAULT_SHUTDOWN_GRACE};
