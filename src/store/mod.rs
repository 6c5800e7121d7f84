//! Persisted state (§6.6): a typed `Store` trait covering upsert/get/list
//! and CAS-on-state operations for Workflow, Submission, Task and Worker
//! records, plus the two required implementations.
//!
//! Generalizes [`everruns_durable`]'s event-sourced `WorkflowEventStore`
//! (append/replay events) into direct entity CRUD: this domain derives
//! submission/task state from stored records rather than replaying an
//! event log, so there is no event-append API here.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorKind};
use crate::value::{Submission, SubmissionState, Task, TaskState, Worker, WorkerState, Workflow};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("submission not found: {0}")]
    SubmissionNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("conflict: expected state {expected}, actual {actual}")]
    Conflict { expected: String, actual: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClassifiedError for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::WorkflowNotFound(_)
            | StoreError::SubmissionNotFound(_)
            | StoreError::TaskNotFound(_)
            | StoreError::WorkerNotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::Database(_) | StoreError::Serialization(_) => ErrorKind::Internal,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Filter for listing tasks eligible for a given phase of the scheduler
/// tick (spec.md §4.7).
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub submission_id: Option<Uuid>,
    pub state: Option<TaskState>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub state: Option<WorkerState>,
}

/// The persistence boundary. Implementations must be thread-safe and
/// support concurrent access; CAS (`try_transition_task`,
/// `try_transition_worker`) is the only synchronization primitive relied on
/// by the scheduler (spec.md §9 "Worker lease").
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // Workflow operations

    async fn put_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError>;
    async fn find_workflow_by_hash(&self, content_hash: &str) -> Result<Option<Workflow>, StoreError>;

    // Submission operations

    async fn put_submission(&self, submission: Submission) -> Result<(), StoreError>;
    async fn get_submission(&self, submission_id: Uuid) -> Result<Submission, StoreError>;
    async fn list_submissions(&self, state: Option<SubmissionState>) -> Result<Vec<Submission>, StoreError>;
    async fn update_submission(&self, submission: Submission) -> Result<(), StoreError>;

    // Task operations

    async fn put_task(&self, task: Task) -> Result<(), StoreError>;
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;
    async fn update_task(&self, task: Task) -> Result<(), StoreError>;

    /// Atomically transition a task from `expected` to `new_state`,
    /// mutating it with `mutate` iff the compare succeeds. Returns
    /// `StoreError::Conflict` if the task's current state doesn't match
    /// `expected`. This is the claim/CAS primitive backing §4.6's
    /// "at most one worker claims a task" invariant.
    async fn try_transition_task(
        &self,
        task_id: Uuid,
        expected: TaskState,
        new_state: TaskState,
        mutate: Box<dyn FnOnce(&mut Task) + Send>,
    ) -> Result<Task, StoreError>;

    /// Claim up to `max_tasks` `Queued` tasks whose executor type is
    /// `Worker` and runtime matches `worker_id`'s capabilities, atomically
    /// transitioning each to `Running` (spec.md §4.6 `claim`).
    async fn claim_tasks(&self, worker_id: &str, max_tasks: usize) -> Result<Vec<Task>, StoreError>;

    // Worker operations

    async fn register_worker(&self, worker: Worker) -> Result<(), StoreError>;
    async fn get_worker(&self, worker_id: &str) -> Result<Worker, StoreError>;
    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<Worker>, StoreError>;
    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        current_task: Option<Uuid>,
    ) -> Result<(), StoreError>;
    async fn update_worker(&self, worker: Worker) -> Result<(), StoreError>;

    /// Find workers whose `last_seen` is older than `threshold` relative
    /// to `now` and still `Online` (spec.md §4.7 phase 1 "Reap workers").
    async fn find_stale_workers(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> Result<Vec<Worker>, StoreError>;
}
