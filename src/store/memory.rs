//! In-memory `Store` implementation, for testing (spec.md §6.6).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{StoreError, TaskFilter, WorkerFilter};
use crate::value::{Submission, SubmissionState, Task, TaskState, Worker, WorkerState, Workflow};

/// Stores all data in memory; provides the same semantics as [`super::PostgresStore`].
///
/// # Example
///
/// ```
/// use gowe::store::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    submissions: RwLock<HashMap<Uuid, Submission>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    workers: RwLock<HashMap<String, Worker>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn clear(&self) {
        self.workflows.write().clear();
        self.submissions.write().clear();
        self.tasks.write().clear();
        self.workers.write().clear();
    }
}

#[async_trait]
impl super::Store for InMemoryStore {
    async fn put_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        self.workflows.write().insert(workflow.workflow_id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn find_workflow_by_hash(&self, content_hash: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .find(|w| w.content_hash == content_hash)
            .cloned())
    }

    async fn put_submission(&self, submission: Submission) -> Result<(), StoreError> {
        self.submissions
            .write()
            .insert(submission.submission_id, submission);
        Ok(())
    }

    async fn get_submission(&self, submission_id: Uuid) -> Result<Submission, StoreError> {
        self.submissions
            .read()
            .get(&submission_id)
            .cloned()
            .ok_or(StoreError::SubmissionNotFound(submission_id))
    }

    async fn list_submissions(&self, state: Option<SubmissionState>) -> Result<Vec<Submission>, StoreError> {
        Ok(self
            .submissions
            .read()
            .values()
            .filter(|s| state.map_or(true, |want| s.state == want))
            .cloned()
            .collect())
    }

    async fn update_submission(&self, submission: Submission) -> Result<(), StoreError> {
        let mut submissions = self.submissions.write();
        if !submissions.contains_key(&submission.submission_id) {
            return Err(StoreError::SubmissionNotFound(submission.submission_id));
        }
        submissions.insert(submission.submission_id, submission);
        Ok(())
    }

    async fn put_task(&self, task: Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.task_id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| filter.submission_id.map_or(true, |id| t.submission_id == id))
            .filter(|t| filter.state.map_or(true, |s| t.state == s))
            .cloned()
            .collect())
    }

    async fn update_task(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        if !tasks.contains_key(&task.task_id) {
            return Err(StoreError::TaskNotFound(task.task_id));
        }
        tasks.insert(task.task_id, task);
        Ok(())
    }

    async fn try_transition_task(
        &self,
        task_id: Uuid,
        expected: TaskState,
        new_state: TaskState,
        mutate: Box<dyn FnOnce(&mut Task) + Send>,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;

        if task.state != expected {
            return Err(StoreError::Conflict {
                expected: format!("{expected:?}"),
                actual: format!("{:?}", task.state),
            });
        }

        task.state = new_state;
        task.updated_at = Utc::now();
        mutate(task);
        Ok(task.clone())
    }

    async fn claim_tasks(&self, worker_id: &str, max_tasks: usize) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.tasks.write();
        let mut claimed = Vec::new();
        let now = Utc::now();

        for task in tasks.values_mut() {
            if claimed.len() >= max_tasks {
                break;
            }
            if task.state == TaskState::Queued {
                task.state = TaskState::Running;
                task.worker_id = Some(worker_id.to_string());
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }

        Ok(claimed)
    }

    async fn register_worker(&self, worker: Worker) -> Result<(), StoreError> {
        self.workers.write().insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Worker, StoreError> {
        self.workers
            .read()
            .get(worker_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))
    }

    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<Worker>, StoreError> {
        Ok(self
            .workers
            .read()
            .values()
            .filter(|w| filter.state.map_or(true, |s| w.state == s))
            .cloned()
            .collect())
    }

    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        current_task: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.last_seen = now;
        worker.current_task = current_task;
        Ok(())
    }

    async fn update_worker(&self, worker: Worker) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        if !workers.contains_key(&worker.worker_id) {
            return Err(StoreError::WorkerNotFound(worker.worker_id));
        }
        workers.insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn find_stale_workers(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> Result<Vec<Worker>, StoreError> {
        Ok(self
            .workers
            .read()
            .values()
            .filter(|w| w.state == WorkerState::Online)
            .filter(|w| {
                now.signed_duration_since(w.last_seen)
                    .to_std()
                    .map(|elapsed| elapsed > threshold)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
