//! PostgreSQL `Store` implementation.
//!
//! Task claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! block each other on the same row; task/worker CAS operations compare
//! rows-affected rather than re-reading state, same as
//! [`everruns_durable`]'s task queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{StoreError, TaskFilter, WorkerFilter};
use crate::value::{Submission, SubmissionState, Task, TaskState, Worker, WorkerState, Workflow};

/// Uses a connection pool; safe to clone and share across the scheduler and
/// the worker-protocol HTTP handlers.
///
/// # Example
///
/// ```ignore
/// use gowe::store::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/gowe").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<Workflow, StoreError> {
    let inputs_json: serde_json::Value = row.get("inputs");
    let outputs_json: serde_json::Value = row.get("outputs");
    let steps_json: serde_json::Value = row.get("steps");
    let class_str: String = row.get("class");

    Ok(Workflow {
        workflow_id: row.get("id"),
        content_hash: row.get("content_hash"),
        cwl_version: row.get("cwl_version"),
        class: serde_json::from_value(serde_json::Value::String(class_str))
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        inputs: serde_json::from_value(inputs_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        outputs: serde_json::from_value(outputs_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        steps: serde_json::from_value(steps_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

fn row_to_submission(row: &sqlx::postgres::PgRow) -> Result<Submission, StoreError> {
    let state_str: String = row.get("state");
    let inputs_json: serde_json::Value = row.get("inputs");
    let outputs_json: serde_json::Value = row.get("outputs");
    let error_json: Option<serde_json::Value> = row.get("error");

    Ok(Submission {
        submission_id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        inputs: serde_json::from_value(inputs_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        outputs: serde_json::from_value(outputs_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        state: parse_submission_state(&state_str)?,
        cancel_requested: row.get("cancel_requested"),
        owner: row.get("owner"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        error: error_json.and_then(|v| serde_json::from_value(v).ok()),
    })
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
    let state_str: String = row.get("state");
    let executor_type_str: Option<String> = row.get("executor_type");
    let inputs_json: serde_json::Value = row.get("inputs");
    let outputs_json: serde_json::Value = row.get("outputs");
    let runtime_hints_json: serde_json::Value = row.get("runtime_hints");
    let depends_on_json: serde_json::Value = row.get("depends_on");
    let error_json: Option<serde_json::Value> = row.get("error");

    Ok(Task {
        task_id: row.get("id"),
        submission_id: row.get("submission_id"),
        step_id: row.get("step_id"),
        state: parse_task_state(&state_str)?,
        executor_type: executor_type_str
            .map(|s| serde_json::from_value(serde_json::Value::String(s)))
            .transpose()
            .map_err(|e: serde_json::Error| StoreError::Serialization(e.to_string()))?,
        inputs: serde_json::from_value(inputs_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        runtime_hints: serde_json::from_value(runtime_hints_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        outputs: serde_json::from_value(outputs_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        stdout_ref: row.get("stdout_ref"),
        stderr_ref: row.get("stderr_ref"),
        exit_code: row.get("exit_code"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        depends_on: serde_json::from_value(depends_on_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        worker_id: row.get("worker_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        error: error_json.and_then(|v| serde_json::from_value(v).ok()),
    })
}

fn row_to_worker(row: &sqlx::postgres::PgRow) -> Result<Worker, StoreError> {
    let state_str: String = row.get("state");
    let labels_json: serde_json::Value = row.get("labels");

    Ok(Worker {
        worker_id: row.get("id"),
        name: row.get("name"),
        hostname: row.get("hostname"),
        state: parse_worker_state(&state_str)?,
        container_runtime: row.get("container_runtime"),
        labels: serde_json::from_value(labels_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
        last_seen: row.get("last_seen"),
        current_task: row.get("current_task"),
        registered_at: row.get("registered_at"),
    })
}

fn parse_submission_state(s: &str) -> Result<SubmissionState, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_task_state(s: &str) -> Result<TaskState, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_worker_state(s: &str) -> Result<WorkerState, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl super::Store for PostgresStore {
    #[instrument(skip(self, workflow))]
    async fn put_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO gowe_workflows (id, content_hash, cwl_version, class, inputs, outputs, steps)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(workflow.workflow_id)
        .bind(&workflow.content_hash)
        .bind(&workflow.cwl_version)
        .bind(serde_json::to_value(workflow.class).unwrap())
        .bind(serde_json::to_value(&workflow.inputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(serde_json::to_value(&workflow.outputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(serde_json::to_value(&workflow.steps).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to insert workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(workflow_id = %workflow.workflow_id, "stored workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM gowe_workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        row_to_workflow(&row)
    }

    #[instrument(skip(self))]
    async fn find_workflow_by_hash(&self, content_hash: &str) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query("SELECT * FROM gowe_workflows WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.map(|r| row_to_workflow(&r)).transpose()
    }

    #[instrument(skip(self, submission))]
    async fn put_submission(&self, submission: Submission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO gowe_submissions
                (id, workflow_id, inputs, outputs, state, cancel_requested, owner, created_at, completed_at, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(submission.submission_id)
        .bind(submission.workflow_id)
        .bind(serde_json::to_value(&submission.inputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(serde_json::to_value(&submission.outputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(serde_json::to_value(submission.state).unwrap())
        .bind(submission.cancel_requested)
        .bind(&submission.owner)
        .bind(submission.created_at)
        .bind(submission.completed_at)
        .bind(submission.error.map(|e| serde_json::to_value(e).unwrap()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_submission(&self, submission_id: Uuid) -> Result<Submission, StoreError> {
        let row = sqlx::query("SELECT * FROM gowe_submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::SubmissionNotFound(submission_id))?;
        row_to_submission(&row)
    }

    #[instrument(skip(self))]
    async fn list_submissions(&self, state: Option<SubmissionState>) -> Result<Vec<Submission>, StoreError> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM gowe_submissions WHERE state = $1 ORDER BY created_at DESC")
                    .bind(serde_json::to_value(state).unwrap().as_str().unwrap_or_default())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM gowe_submissions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_submission).collect()
    }

    #[instrument(skip(self, submission))]
    async fn update_submission(&self, submission: Submission) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gowe_submissions
            SET outputs = $2, state = $3, cancel_requested = $4, completed_at = $5, error = $6
            WHERE id = $1
            "#,
        )
        .bind(submission.submission_id)
        .bind(serde_json::to_value(&submission.outputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(serde_json::to_value(submission.state).unwrap())
        .bind(submission.cancel_requested)
        .bind(submission.completed_at)
        .bind(submission.error.map(|e| serde_json::to_value(e).unwrap()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SubmissionNotFound(submission.submission_id));
        }
        Ok(())
    }

    #[instrument(skip(self, task))]
    async fn put_task(&self, task: Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO gowe_tasks
                (id, submission_id, step_id, state, executor_type, inputs, runtime_hints, outputs,
                 stdout_ref, stderr_ref, exit_code, retry_count, max_retries, depends_on, worker_id,
                 created_at, updated_at, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(task.task_id)
        .bind(task.submission_id)
        .bind(&task.step_id)
        .bind(serde_json::to_value(task.state).unwrap())
        .bind(task.executor_type.map(|e| serde_json::to_value(e).unwrap()))
        .bind(serde_json::to_value(&task.inputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(serde_json::to_value(&task.runtime_hints).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(serde_json::to_value(&task.outputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(&task.stdout_ref)
        .bind(&task.stderr_ref)
        .bind(task.exit_code)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(serde_json::to_value(&task.depends_on).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(&task.worker_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.error.map(|e| serde_json::to_value(e).unwrap()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM gowe_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        row_to_task(&row)
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = match (filter.submission_id, filter.state) {
            (Some(sid), Some(state)) => {
                sqlx::query("SELECT * FROM gowe_tasks WHERE submission_id = $1 AND state = $2")
                    .bind(sid)
                    .bind(serde_json::to_value(state).unwrap().as_str().unwrap_or_default())
                    .fetch_all(&self.pool)
                    .await
            }
            (Some(sid), None) => sqlx::query("SELECT * FROM gowe_tasks WHERE submission_id = $1")
                .bind(sid)
                .fetch_all(&self.pool)
                .await,
            (None, Some(state)) => sqlx::query("SELECT * FROM gowe_tasks WHERE state = $1")
                .bind(serde_json::to_value(state).unwrap().as_str().unwrap_or_default())
                .fetch_all(&self.pool)
                .await,
            (None, None) => sqlx::query("SELECT * FROM gowe_tasks").fetch_all(&self.pool).await,
        }
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self, task))]
    async fn update_task(&self, task: Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gowe_tasks
            SET state = $2, executor_type = $3, outputs = $4, stdout_ref = $5, stderr_ref = $6,
                exit_code = $7, retry_count = $8, worker_id = $9, updated_at = $10, error = $11
            WHERE id = $1
            "#,
        )
        .bind(task.task_id)
        .bind(serde_json::to_value(task.state).unwrap())
        .bind(task.executor_type.map(|e| serde_json::to_value(e).unwrap()))
        .bind(serde_json::to_value(&task.outputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(&task.stdout_ref)
        .bind(&task.stderr_ref)
        .bind(task.exit_code)
        .bind(task.retry_count as i32)
        .bind(&task.worker_id)
        .bind(task.updated_at)
        .bind(task.error.map(|e| serde_json::to_value(e).unwrap()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.task_id));
        }
        Ok(())
    }

    #[instrument(skip(self, mutate))]
    async fn try_transition_task(
        &self,
        task_id: Uuid,
        expected: TaskState,
        new_state: TaskState,
        mutate: Box<dyn FnOnce(&mut Task) + Send>,
    ) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM gowe_tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let mut task = row_to_task(&row)?;
        if task.state != expected {
            return Err(StoreError::Conflict {
                expected: format!("{expected:?}"),
                actual: format!("{:?}", task.state),
            });
        }

        task.state = new_state;
        task.updated_at = Utc::now();
        mutate(&mut task);

        sqlx::query(
            r#"
            UPDATE gowe_tasks
            SET state = $2, outputs = $3, exit_code = $4, retry_count = $5, worker_id = $6,
                updated_at = $7, error = $8
            WHERE id = $1
            "#,
        )
        .bind(task.task_id)
        .bind(serde_json::to_value(task.state).unwrap())
        .bind(serde_json::to_value(&task.outputs).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(task.exit_code)
        .bind(task.retry_count as i32)
        .bind(&task.worker_id)
        .bind(task.updated_at)
        .bind(task.error.clone().map(|e| serde_json::to_value(e).unwrap()))
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(task)
    }

    #[instrument(skip(self))]
    async fn claim_tasks(&self, worker_id: &str, max_tasks: usize) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM gowe_tasks
                WHERE state = 'queued'
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE gowe_tasks t
            SET state = 'running', worker_id = $1, updated_at = NOW()
            FROM claimable
            WHERE t.id = claimable.id
            RETURNING t.*
            "#,
        )
        .bind(worker_id)
        .bind(max_tasks as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self, worker))]
    async fn register_worker(&self, worker: Worker) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO gowe_workers
                (id, name, hostname, state, container_runtime, labels, last_seen, current_task, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET state = $4, last_seen = $7
            "#,
        )
        .bind(&worker.worker_id)
        .bind(&worker.name)
        .bind(&worker.hostname)
        .bind(serde_json::to_value(worker.state).unwrap())
        .bind(&worker.container_runtime)
        .bind(serde_json::to_value(&worker.labels).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(worker.last_seen)
        .bind(worker.current_task)
        .bind(worker.registered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_worker(&self, worker_id: &str) -> Result<Worker, StoreError> {
        let row = sqlx::query("SELECT * FROM gowe_workers WHERE id = $1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        row_to_worker(&row)
    }

    #[instrument(skip(self))]
    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<Worker>, StoreError> {
        let rows = match filter.state {
            Some(state) => sqlx::query("SELECT * FROM gowe_workers WHERE state = $1")
                .bind(serde_json::to_value(state).unwrap().as_str().unwrap_or_default())
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM gowe_workers").fetch_all(&self.pool).await,
        }
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_worker).collect()
    }

    #[instrument(skip(self))]
    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        current_task: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gowe_workers
            SET last_seen = $2, current_task = $3
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(current_task)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, worker))]
    async fn update_worker(&self, worker: Worker) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gowe_workers
            SET state = $2, current_task = $3, last_seen = $4
            WHERE id = $1
            "#,
        )
        .bind(&worker.worker_id)
        .bind(serde_json::to_value(worker.state).unwrap())
        .bind(worker.current_task)
        .bind(worker.last_seen)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(worker.worker_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_stale_workers(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> Result<Vec<Worker>, StoreError> {
        let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
        let rows = sqlx::query("SELECT * FROM gowe_workers WHERE state = 'online' AND last_seen < $1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_worker).collect()
    }
}
