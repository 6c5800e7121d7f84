//! Executor registry (C9, spec.md §4.9): binds an [`ExecutorType`] to an
//! implementation and routes tasks accordingly. A type-erased factory map
//! keyed by the closed `ExecutorType` enum rather than an open string map —
//! there is no "unknown workflow type" failure mode here, only "nothing
//! registered for this (valid) variant yet".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ClassifiedError, ErrorKind, ErrorSummary};
use crate::expr::Evaluator;
use crate::parser::NormalizedTool;
use crate::value::{CwlValue, ExecutorType, Task};

pub mod local;

pub use local::LocalExecutor;

/// Everything an executor needs to run one task, beyond the task record
/// itself: resolved scratch directories and the pieces needed to build its
/// command line (spec.md §4.4/§4.5).
pub struct ExecutionContext {
    pub work_dir: std::path::PathBuf,
    pub tmp_dir: std::path::PathBuf,
    pub tool: NormalizedTool,
    pub evaluator: Evaluator,
}

/// Outcome of a task that ran to completion, independent of which executor
/// ran it (spec.md §4.5 post-execution, §4.8).
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success {
        outputs: HashMap<String, CwlValue>,
        exit_code: Option<i32>,
    },
    Failure(ErrorSummary),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no executor registered for {0:?}")]
    Unregistered(ExecutorType),

    #[error("command build failed: {0}")]
    CommandBuild(#[from] crate::command::CommandBuildError),

    #[error("expression error: {0}")]
    Expression(#[from] crate::expr::ExpressionError),

    #[error("io error: {0}")]
    Io(String),

    #[error("output collection failed: {0}")]
    OutputCollection(String),

    #[error("process exited with code {0}, not in successCodes")]
    NonZeroExit(i32),

    #[error("tool timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

impl ClassifiedError for ExecutorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unregistered(_) => ErrorKind::Internal,
            Self::CommandBuild(_) | Self::Expression(_) => ErrorKind::ExpressionError,
            Self::Io(_) | Self::TimedOut(_) => ErrorKind::ExecutorTransport,
            Self::OutputCollection(_) => ErrorKind::OutputCollection,
            Self::NonZeroExit(_) => ErrorKind::ToolFailure,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::TimedOut(_))
    }
}

/// A pluggable per-task backend. The registry is the only place that picks
/// which implementation handles a task (spec.md §4.9); implementations
/// carry no per-task state of their own, only shared configuration.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn submit(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskOutcome, ExecutorError>;

    /// Request that a running task abort. Local/container executors signal
    /// the child process; this is a best-effort request, not a guarantee
    /// the task stops before `submit` returns.
    async fn cancel(&self, task: &Task) -> Result<(), ExecutorError>;
}

/// Maps each [`ExecutorType`] to the [`Executor`] that handles it.
///
/// # Example
///
/// ```ignore
/// use gowe::executor::{ExecutorRegistry, LocalExecutor};
/// use gowe::value::ExecutorType;
///
/// let mut registry = ExecutorRegistry::new();
/// registry.register(ExecutorType::Local, Arc::new(LocalExecutor::new()));
/// ```
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorType, Arc<dyn Executor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor_type: ExecutorType, executor: Arc<dyn Executor>) {
        self.executors.insert(executor_type, executor);
    }

    pub fn contains(&self, executor_type: ExecutorType) -> bool {
        self.executors.contains_key(&executor_type)
    }

    pub fn get(&self, executor_type: ExecutorType) -> Result<Arc<dyn Executor>, ExecutorError> {
        self.executors
            .get(&executor_type)
            .cloned()
            .ok_or(ExecutorError::Unregistered(executor_type))
    }

    pub async fn submit(
        &self,
        executor_type: ExecutorType,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutcome, ExecutorError> {
        self.get(executor_type)?.submit(task, ctx).await
    }

    pub async fn cancel(&self, executor_type: ExecutorType, task: &Task) -> Result<(), ExecutorError> {
        self.get(executor_type)?.cancel(task).await
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn registered_types(&self) -> impl Iterator<Item = &ExecutorType> {
        self.executors.keys()
    }
}
