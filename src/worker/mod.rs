//! Worker pool and protocol (C7, spec.md §4.6).
//!
//! This module provides:
//! - [`WorkerPool`] - concurrent task execution with backpressure
//! - [`BackpressureConfig`] - load-aware task acceptance configuration
//! - [`PollerConfig`] - task polling with exponential backoff
//! - [`protocol::router`] - the HTTP register/claim/heartbeat/report surface
//!   a standalone worker process talks to
//!
//! # Example
//!
//! ```ignore
//! use gowe::worker::{WorkerPool, WorkerPoolConfig};
//! use gowe::value::ExecutorType;
//!
//! let config = WorkerPoolConfig::new(vec![ExecutorType::Local])
//!     .with_worker_id("local-worker-1")
//!     .with_max_concurrency(20);
//!
//! let pool = WorkerPool::new(store, config);
//!
//! pool.register_executor(ExecutorType::Local, |task| async move {
//!     // run the tool, return outputs
//!     todo!()
//! });
//!
//! pool.start().await?;
//! pool.shutdown().await?;
//! ```

mod backpressure;
mod poller;
mod pool;
pub mod protocol;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use poller::{AdaptivePoller, PollerConfig, PollerError, TaskPoller};
pub use pool::{TaskExecutor, TaskExecutionResult, TaskOutcome, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
