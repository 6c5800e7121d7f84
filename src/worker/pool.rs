//! Worker pool for task execution (C7, spec.md §4.6).
//!
//! Manages concurrent task execution with backpressure and graceful
//! shutdown. A pool can run embedded (polling [`crate::store::Store`]
//! directly, in-process with the scheduler) or standalone (polling the
//! worker-protocol HTTP surface in [`crate::worker::protocol`]); both share
//! this executor loop, differing only in what `Arc<dyn Store>` they're
//! given — a local store, or an HTTP-backed shim implementing the same
//! trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::poller::{PollerConfig, PollerError, TaskPoller};
use crate::error::ErrorSummary;
use crate::store::{Store, StoreError};
use crate::value::{ExecutorType, Task, TaskState, Worker, WorkerState};

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    pub name: String,

    /// Executor types this worker handles (spec.md §4.9).
    pub executor_types: Vec<ExecutorType>,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    pub backpressure: BackpressureConfig,

    pub poller: PollerConfig,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            name: "worker".to_string(),
            executor_types: vec![ExecutorType::Local],
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(executor_types: Vec<ExecutorType>) -> Self {
        Self {
            executor_types,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    #[error("no executor registered for executor type: {0:?}")]
    HandlerNotFound(ExecutorType),
}

/// The outcome a registered executor reports for a claimed task.
pub enum TaskOutcome {
    Success {
        outputs: HashMap<String, crate::value::CwlValue>,
        exit_code: Option<i32>,
    },
    Failure(ErrorSummary),
}

pub type TaskExecutionResult = Result<TaskOutcome, ErrorSummary>;

/// Executor function type, keyed by [`ExecutorType`] (§4.9).
pub type TaskExecutor = Arc<
    dyn Fn(Task) -> std::pin::Pin<Box<dyn std::future::Future<Output = TaskExecutionResult> + Send>>
        + Send
        + Sync,
>;

/// Executes claimed tasks concurrently, reporting results back through the
/// [`Store`].
///
/// # Example
///
/// ```ignore
/// use gowe::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new(vec![gowe::value::ExecutorType::Local])
///     .with_max_concurrency(10);
///
/// let pool = WorkerPool::new(store, config);
/// pool.register_executor(gowe::value::ExecutorType::Local, |task| async move {
///     // run the tool, return outputs
///     todo!()
/// });
///
/// pool.start().await?;
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn Store>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    executors: std::sync::RwLock<HashMap<ExecutorType, TaskExecutor>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: std::sync::RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn Store>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));

        Self {
            store,
            config: config.clone(),
            backpressure,
            executors: std::sync::RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            status: std::sync::RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            poll_handle: std::sync::Mutex::new(None),
            heartbeat_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn register_executor<F, Fut>(&self, executor_type: ExecutorType, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskExecutionResult> + Send + 'static,
    {
        let handler: TaskExecutor = Arc::new(move |task| Box::pin(handler(task)));
        self.executors.write().unwrap().insert(executor_type, handler);
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            executor_types = ?self.config.executor_types,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        self.register_worker().await?;
        *self.status.write().unwrap() = WorkerPoolStatus::Running;

        self.start_poll_loop();
        self.start_heartbeat_loop();

        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("all tasks completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "shutdown timeout reached"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.deregister_worker().await?;
        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn is_accepting(&self) -> bool {
        self.backpressure.is_accepting() && *self.status.read().unwrap() == WorkerPoolStatus::Running
    }

    async fn register_worker(&self) -> Result<(), WorkerPoolError> {
        let worker = Worker {
            worker_id: self.config.worker_id.clone(),
            name: self.config.name.clone(),
            hostname: hostname(),
            state: WorkerState::Online,
            container_runtime: None,
            labels: HashMap::new(),
            last_seen: Utc::now(),
            current_task: None,
            registered_at: Utc::now(),
        };
        self.store.register_worker(worker).await?;
        Ok(())
    }

    async fn deregister_worker(&self) -> Result<(), WorkerPoolError> {
        let mut worker = self.store.get_worker(&self.config.worker_id).await?;
        worker.state = WorkerState::Offline;
        self.store.update_worker(worker).await?;
        Ok(())
    }

    fn start_poll_loop(&self) {
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let backpressure = Arc::clone(&self.backpressure);
        let executors = self.executors.read().unwrap().clone();
        let active_tasks = Arc::clone(&self.active_tasks);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller = TaskPoller::new(
                store.clone(),
                config.worker_id.clone(),
                config.poller.clone(),
                shutdown_rx.clone(),
            );

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                if !backpressure.should_accept() {
                    debug!("poll loop: under backpressure, waiting");
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let available_slots = backpressure.available_slots();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let executor_type = match task.executor_type {
                                Some(t) => t,
                                None => {
                                    warn!(task_id = %task.task_id, "task has no executor type");
                                    continue;
                                }
                            };

                            let handler = match executors.get(&executor_type) {
                                Some(h) => Arc::clone(h),
                                None => {
                                    warn!(?executor_type, "no executor registered");
                                    continue;
                                }
                            };

                            let permit = match active_tasks.clone().try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    debug!("no permits available");
                                    break;
                                }
                            };

                            backpressure.task_started();

                            let store = Arc::clone(&store);
                            let bp = Arc::clone(&backpressure);

                            tokio::spawn(async move {
                                let task_id = task.task_id;
                                let result = handler(task).await;

                                let outcome = match result {
                                    Ok(outcome) => outcome,
                                    Err(summary) => TaskOutcome::Failure(summary),
                                };

                                let transition = match outcome {
                                    TaskOutcome::Success { outputs, exit_code } => {
                                        store
                                            .try_transition_task(
                                                task_id,
                                                TaskState::Running,
                                                TaskState::Success,
                                                Box::new(move |t| {
                                                    t.outputs = outputs;
                                                    t.exit_code = exit_code;
                                                }),
                                            )
                                            .await
                                    }
                                    TaskOutcome::Failure(summary) => {
                                        store
                                            .try_transition_task(
                                                task_id,
                                                TaskState::Running,
                                                TaskState::Failed,
                                                Box::new(move |t| t.error = Some(summary)),
                                            )
                                            .await
                                    }
                                };

                                if let Err(e) = transition {
                                    error!(%task_id, "failed to report task result: {}", e);
                                }

                                bp.task_completed();
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock().unwrap() = Some(handle);
    }

    fn start_heartbeat_loop(&self) {
        let store = Arc::clone(&self.store);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat_worker(&worker_id, Utc::now(), None).await {
                            error!("heartbeat failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("heartbeat loop exited");
        });

        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_local_executor() {
        let config = WorkerPoolConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.executor_types, vec![ExecutorType::Local]);
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn config_builder_overrides_fields() {
        let config = WorkerPoolConfig::new(vec![ExecutorType::Worker])
            .with_worker_id("test-worker")
            .with_max_concurrency(20)
            .with_heartbeat_interval(Duration::from_secs(10));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.executor_types, vec![ExecutorType::Worker]);
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn worker_pool_status_equality() {
        assert_ne!(WorkerPoolStatus::Running, WorkerPoolStatus::Stopped);
        assert_ne!(WorkerPoolStatus::Draining, WorkerPoolStatus::Running);
    }
}
