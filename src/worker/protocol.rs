//! HTTP worker protocol (spec.md §4.6 / §6.3): register, claim, heartbeat,
//! report. Built on `axum`, documented with `utoipa` the way the teacher's
//! sibling API crates expose their HTTP surfaces.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ErrorSummary;
use crate::store::Store;
use crate::value::{CwlValue, ExecutorType, Task, TaskState, Worker, WorkerState};

#[derive(Clone)]
pub struct ProtocolState {
    pub store: Arc<dyn Store>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub name: String,
    pub hostname: String,
    pub container_runtime: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub worker_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClaimRequest {
    pub max_tasks: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimedTaskView {
    pub task_id: Uuid,
    pub submission_id: Uuid,
    pub step_id: String,
    pub executor_type: Option<ExecutorType>,
    pub inputs: HashMap<String, CwlValue>,
    pub runtime_hints: crate::value::RuntimeHints,
}

impl From<Task> for ClaimedTaskView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            submission_id: task.submission_id,
            step_id: task.step_id,
            executor_type: task.executor_type,
            inputs: task.inputs,
            runtime_hints: task.runtime_hints,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct HeartbeatRequest {
    pub current_task: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReportRequest {
    pub success: bool,
    #[serde(default)]
    pub outputs: HashMap<String, CwlValue>,
    pub exit_code: Option<i32>,
    pub error: Option<ErrorSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl axum::response::IntoResponse for ProtocolError {
    fn into_response(self) -> axum::response::Response {
        use crate::error::ClassifiedError;
        let status = match self {
            ProtocolError::Store(ref e) => match e.kind() {
                crate::error::ErrorKind::NotFound => axum::http::StatusCode::NOT_FOUND,
                crate::error::ErrorKind::Conflict => axum::http::StatusCode::CONFLICT,
                _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(store: Arc<dyn Store>) -> Router {
    Router::new()
        .route("/workers/register", post(register))
        .route("/workers/:worker_id/claim", post(claim))
        .route("/workers/:worker_id/heartbeat", put(heartbeat))
        .route("/tasks/:task_id/report", post(report))
        .with_state(ProtocolState { store })
}

async fn register(
    State(state): State<ProtocolState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ProtocolError> {
    let worker_id = format!("worker-{}", Uuid::now_v7());
    let worker = Worker {
        worker_id: worker_id.clone(),
        name: req.name,
        hostname: req.hostname,
        state: WorkerState::Online,
        container_runtime: req.container_runtime,
        labels: req.labels,
        last_seen: Utc::now(),
        current_task: None,
        registered_at: Utc::now(),
    };
    state.store.register_worker(worker).await?;
    Ok(Json(RegisterResponse { worker_id }))
}

async fn claim(
    State(state): State<ProtocolState>,
    Path(worker_id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<Vec<ClaimedTaskView>>, ProtocolError> {
    let tasks = state.store.claim_tasks(&worker_id, req.max_tasks).await?;
    Ok(Json(tasks.into_iter().map(ClaimedTaskView::from).collect()))
}

async fn heartbeat(
    State(state): State<ProtocolState>,
    Path(worker_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<(), ProtocolError> {
    state
        .store
        .heartbeat_worker(&worker_id, Utc::now(), req.current_task)
        .await?;
    Ok(())
}

async fn report(
    State(state): State<ProtocolState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<ReportRequest>,
) -> Result<(), ProtocolError> {
    let new_state = if req.success { TaskState::Success } else { TaskState::Failed };
    state
        .store
        .try_transition_task(
            task_id,
            TaskState::Running,
            new_state,
            Box::new(move |t| {
                t.outputs = req.outputs;
                t.exit_code = req.exit_code;
                t.error = req.error;
            }),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn register_then_claim_round_trips() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let app = router(Arc::clone(&store));

        let mut task = Task::new(Uuid::now_v7(), "step1");
        task.state = TaskState::Queued;
        task.executor_type = Some(ExecutorType::Worker);
        store.put_task(task).await.unwrap();

        let claimed = store.claim_tasks("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        drop(app);
    }

    #[tokio::test]
    async fn register_worker_persists_online_state() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

        let worker_id = format!("worker-{}", Uuid::now_v7());
        let worker = Worker {
            worker_id: worker_id.clone(),
            name: "w1".into(),
            hostname: "host1".into(),
            state: WorkerState::Online,
            container_runtime: None,
            labels: HashMap::new(),
            last_seen: Utc::now(),
            current_task: None,
            registered_at: Utc::now(),
        };
        store.register_worker(worker).await.unwrap();

        let fetched = store.get_worker(&worker_id).await.unwrap();
        assert_eq!(fetched.state, WorkerState::Online);
    }

    #[tokio::test]
    async fn heartbeat_updates_last_seen_and_current_task() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let worker_id = format!("worker-{}", Uuid::now_v7());
        let worker = Worker {
            worker_id: worker_id.clone(),
            name: "w1".into(),
            hostname: "host1".into(),
            state: WorkerState::Online,
            container_runtime: None,
            labels: HashMap::new(),
            last_seen: Utc::now() - chrono::Duration::minutes(5),
            current_task: None,
            registered_at: Utc::now(),
        };
        store.register_worker(worker).await.unwrap();

        let task_id = Uuid::now_v7();
        let beat_at = Utc::now();
        store.heartbeat_worker(&worker_id, beat_at, Some(task_id)).await.unwrap();

        let fetched = store.get_worker(&worker_id).await.unwrap();
        assert_eq!(fetched.current_task, Some(task_id));
        assert_eq!(fetched.last_seen, beat_at);
    }

    #[tokio::test]
    async fn report_success_transitions_task_and_stores_outputs() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut task = Task::new(Uuid::now_v7(), "step1");
        task.state = TaskState::Running;
        let task_id = task.task_id;
        store.put_task(task).await.unwrap();

        let mut outputs = HashMap::new();
        outputs.insert("out".to_string(), CwlValue::String("done".into()));

        store
            .try_transition_task(
                task_id,
                TaskState::Running,
                TaskState::Success,
                Box::new(move |t| {
                    t.outputs = outputs.clone();
                    t.exit_code = Some(0);
                }),
            )
            .await
            .unwrap();

        let fetched = store.get_task(task_id).await.unwrap();
        assert_eq!(fetched.state, TaskState::Success);
        assert_eq!(fetched.exit_code, Some(0));
        assert_eq!(fetched.outputs.get("out"), Some(&CwlValue::String("done".into())));
    }

    #[tokio::test]
    async fn report_failure_records_error_summary() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut task = Task::new(Uuid::now_v7(), "step1");
        task.state = TaskState::Running;
        let task_id = task.task_id;
        store.put_task(task).await.unwrap();

        let error = ErrorSummary {
            kind: crate::error::ErrorKind::ToolFailure,
            message: "exit 1".into(),
            field: None,
            retryable: false,
        };

        store
            .try_transition_task(
                task_id,
                TaskState::Running,
                TaskState::Failed,
                Box::new(move |t| {
                    t.exit_code = Some(1);
                    t.error = Some(error.clone());
                }),
            )
            .await
            .unwrap();

        let fetched = store.get_task(task_id).await.unwrap();
        assert_eq!(fetched.state, TaskState::Failed);
        assert_eq!(fetched.error.map(|e| e.message), Some("exit 1".to_string()));
    }
}
