//! # gowe
//!
//! A CWL (Common Workflow Language) v1.2 workflow execution engine: bundles
//! packed `$graph` documents, normalizes CommandLineTool/ExpressionTool/
//! Workflow processes, schedules their steps over a DAG with scatter and
//! sub-workflow support, and dispatches tasks to local, containerized, or
//! remote pull-based workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                              │
//! │  (admits submissions, resolves/schedules steps, dispatches,  │
//! │   reconciles to a terminal state — spec.md §4.7)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                                │
//! │  (PostgreSQL: gowe_workflows, submissions, tasks, workers)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               ExecutorRegistry / WorkerPool                   │
//! │  (local/container executors in-process; remote workers poll  │
//! │   register/claim/heartbeat/report over HTTP)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use gowe::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let mut executors = ExecutorRegistry::new();
//! let local = Arc::new(LocalExecutor::new());
//! executors.register(ExecutorType::Local, local.clone());
//! executors.register(ExecutorType::Container, local);
//!
//! let scheduler = Scheduler::new(store, Arc::new(executors), GoweConfig::default(), work_root);
//! let workflow = scheduler.ingest(packed_document).await?;
//! loop {
//!     scheduler.tick().await?;
//! }
//! ```

pub mod bench;
pub mod bundler;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod expr;
pub mod parser;
pub mod reliability;
pub mod scheduler;
pub mod store;
pub mod value;
pub mod worker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::GoweConfig;
    pub use crate::error::{ClassifiedError, ErrorKind, ErrorSummary};
    pub use crate::executor::{ExecutionContext, Executor, ExecutorError, ExecutorRegistry, LocalExecutor, TaskOutcome};
    pub use crate::expr::{EvalContext, Evaluator};
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    pub use crate::scheduler::{Scheduler, SchedulerError, TickReport};
    pub use crate::store::{InMemoryStore, PostgresStore, Store, StoreError, TaskFilter, WorkerFilter};
    pub use crate::value::{
        CwlValue, ExecutorType, Submission, SubmissionState, Task, TaskState, Worker, WorkerState, Workflow,
    };
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root.
pub use config::GoweConfig;
pub use error::{ClassifiedError, ErrorKind, ErrorSummary};
pub use executor::{Executor, ExecutorError, ExecutorRegistry, LocalExecutor};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerError, TickReport};
pub use store::{InMemoryStore, PostgresStore, Store, StoreError};
pub use value::{CwlValue, ExecutorType, Submission, SubmissionState, Task, TaskState, Workflow};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
