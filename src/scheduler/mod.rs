//! Scheduler (C8, spec.md §4.7): the tick loop that admits submissions,
//! resolves step inputs, expands scatter, dispatches ready tasks to the
//! executor registry, and reconciles submissions to a terminal state.
//!
//! A tick polls every `Running` submission and its tasks directly against
//! the [`Store`] and advances whatever is ready, rather than replaying an
//! event-sourced log.

pub mod dag;
pub mod flatten;
pub mod resolve;
pub mod scatter;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::bundler::PackedDocument;
use crate::config::GoweConfig;
use crate::error::{ClassifiedError, ErrorKind, ErrorSummary};
use crate::executor::{ExecutionContext, ExecutorError, ExecutorRegistry, TaskOutcome};
use crate::expr::{EvalContext, Evaluator};
use crate::parser::{self, GraphDocument, NormalizedTool, ParseError};
use crate::store::{Store, StoreError, TaskFilter};
use crate::value::{
    CwlValue, ExecutorType, OutputSource, ProcessClass, RuntimeHints, ScatterMethod, Step, Submission,
    SubmissionState, Task, TaskState, Workflow,
};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Dag(#[from] dag::DagError),

    #[error(transparent)]
    Flatten(#[from] flatten::FlattenError),

    #[error("workflow {0} has no cached document registered")]
    UnknownDocument(Uuid),

    #[error("workflow {0} has no main workflow in its $graph")]
    NoMainWorkflow(Uuid),
}

impl ClassifiedError for SchedulerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Parse(e) => e.kind(),
            Self::Dag(_) | Self::Flatten(_) | Self::NoMainWorkflow(_) => ErrorKind::InvalidWorkflow,
            Self::UnknownDocument(_) => ErrorKind::Internal,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.retryable())
    }
}

/// Tallies produced by one [`Scheduler::tick`], surfaced as metrics/logs by
/// the caller (spec.md §6.4 metrics).
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub workers_reaped: usize,
    pub submissions_admitted: usize,
    pub tasks_created: usize,
    pub tasks_dispatched: usize,
    pub submissions_finalized: usize,
    /// Non-terminal tasks skipped (or signaled to abort) by a cancellation
    /// finalized this tick (spec.md §4.8).
    pub tasks_cancelled: usize,
    /// Tasks that were already terminal when a cancellation was finalized
    /// this tick, so cancellation had no effect on them (spec.md §4.8).
    pub tasks_already_completed: usize,
}

/// Result of one [`Scheduler::reconcile_and_finalize`] call. The
/// cancellation tallies are only nonzero on the tick that actually finalizes
/// a cancelled submission (spec.md §4.8).
#[derive(Debug, Clone, Copy, Default)]
struct ReconcileOutcome {
    finalized: bool,
    tasks_cancelled: usize,
    tasks_already_completed: usize,
}

/// The persisted [`Workflow`] record only carries the top-level
/// steps/inputs/outputs (spec.md §3.1). Tool bodies, nested sub-workflows,
/// and raw argument/schema JSON don't round-trip through the `Store` since
/// [`NormalizedTool`] and friends don't derive `Serialize`/`Deserialize` —
/// so the full parse result is cached here in-process, keyed by
/// `workflow_id`, alongside the steps already flattened and DAG-validated.
struct CachedDocument {
    document: GraphDocument,
    flat_steps: Vec<Step>,
    output_alias: HashMap<String, Vec<String>>,
}

pub struct Scheduler<S: Store> {
    store: Arc<S>,
    executors: Arc<ExecutorRegistry>,
    config: GoweConfig,
    documents: DashMap<Uuid, Arc<CachedDocument>>,
    work_root: PathBuf,
}

impl<S: Store> Scheduler<S> {
    pub fn new(store: Arc<S>, executors: Arc<ExecutorRegistry>, config: GoweConfig, work_root: PathBuf) -> Self {
        Self {
            store,
            executors,
            config,
            documents: DashMap::new(),
            work_root,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Parse a bundled document, hash it for dedup, and either reuse the
    /// existing [`Workflow`] record or persist and cache a new one
    /// (spec.md §4.1 "Submit", §6.1).
    #[instrument(skip(self, packed))]
    pub async fn ingest(&self, packed: PackedDocument) -> Result<Workflow, SchedulerError> {
        let hash = content_hash(&packed);
        if let Some(existing) = self.store.find_workflow_by_hash(&hash).await? {
            self.register_document(existing.workflow_id, &packed)?;
            return Ok(existing);
        }

        let record = parser::to_workflow_record(&parser::parse(&packed)?, hash)?;
        self.register_document(record.workflow_id, &packed)?;
        self.store.put_workflow(record.clone()).await?;
        Ok(record)
    }

    /// Parse, flatten and DAG-validate `packed`, caching the result under
    /// `workflow_id` so later ticks don't reparse it.
    fn register_document(&self, workflow_id: Uuid, packed: &PackedDocument) -> Result<(), SchedulerError> {
        let document = parser::parse(packed)?;
        let main = document
            .main_workflow()
            .ok_or(SchedulerError::NoMainWorkflow(workflow_id))?;
        let flattened = flatten::flatten(&document, main)?;
        dag::validate(&flattened.steps)?;

        self.documents.insert(
            workflow_id,
            Arc::new(CachedDocument {
                document,
                flat_steps: flattened.steps,
                output_alias: flattened.output_alias,
            }),
        );
        Ok(())
    }

    fn document(&self, workflow_id: Uuid) -> Result<Arc<CachedDocument>, SchedulerError> {
        self.documents
            .get(&workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or(SchedulerError::UnknownDocument(workflow_id))
    }

    /// Run one pass of the five phases described in spec.md §4.7: reap
    /// stale workers, admit pending submissions, resolve-and-schedule ready
    /// steps, dispatch queued local/container tasks, and reconcile
    /// submissions whose tasks have all gone terminal.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();

        report.workers_reaped = self.reap_workers().await?;
        report.submissions_admitted = self.admit_submissions().await?;

        let running = self.store.list_submissions(Some(SubmissionState::Running)).await?;
        for submission in &running {
            match self.resolve_and_schedule(submission).await {
                Ok(created) => report.tasks_created += created,
                Err(err) => warn!(submission_id = %submission.submission_id, error = %err, "resolve-and-schedule failed"),
            }
        }

        let queued = self
            .store
            .list_tasks(TaskFilter {
                submission_id: None,
                state: Some(TaskState::Queued),
            })
            .await?;
        for task in queued {
            match task.executor_type {
                Some(ExecutorType::External) => self.fail_unsupported_executor(task).await?,
                Some(ExecutorType::Worker) => {} // polled by workers via the claim/heartbeat/report protocol
                _ => {
                    self.dispatch(task).await?;
                    report.tasks_dispatched += 1;
                }
            }
        }

        for submission in &running {
            let outcome = self.reconcile_and_finalize(submission).await?;
            if outcome.finalized {
                report.submissions_finalized += 1;
            }
            report.tasks_cancelled += outcome.tasks_cancelled;
            report.tasks_already_completed += outcome.tasks_already_completed;
        }

        Ok(report)
    }

    /// Reclaim tasks owned by workers whose heartbeat has gone stale past
    /// `worker_lease_timeout` (spec.md §4.6 "Worker lease").
    async fn reap_workers(&self) -> Result<usize, SchedulerError> {
        let stale = self
            .store
            .find_stale_workers(Utc::now(), self.config.worker_lease_timeout)
            .await?;

        for worker in &stale {
            let mut offline = worker.clone();
            offline.state = crate::value::WorkerState::Offline;
            self.store.update_worker(offline).await?;

            let running = self
                .store
                .list_tasks(TaskFilter {
                    submission_id: None,
                    state: Some(TaskState::Running),
                })
                .await?;
            for task in running {
                if task.worker_id.as_deref() == Some(worker.worker_id.as_str()) {
                    let error = ErrorSummary::new(ErrorKind::ExecutorTransport, "worker lease expired").retryable(true);
                    self.retry_or_fail(task, error).await?;
                }
            }
        }
        Ok(stale.len())
    }

    /// Promote `Pending` submissions to `Running`, deferring any whose
    /// workflow hasn't been registered yet (e.g. process restarted without
    /// re-ingesting; this waits rather than errors since ingestion is
    /// idempotent and may simply not have run yet on this instance).
    async fn admit_submissions(&self) -> Result<usize, SchedulerError> {
        let pending = self.store.list_submissions(Some(SubmissionState::Pending)).await?;
        let mut admitted = 0;
        for submission in pending {
            if self.documents.get(&submission.workflow_id).is_none() {
                warn!(submission_id = %submission.submission_id, workflow_id = %submission.workflow_id, "deferring admission: workflow not cached");
                continue;
            }
            let mut running = submission.clone();
            running.state = SubmissionState::Running;
            self.store.update_submission(running).await?;
            admitted += 1;
        }
        Ok(admitted)
    }

    async fn resolve_and_schedule(&self, submission: &Submission) -> Result<usize, SchedulerError> {
        let cached = match self.document(submission.workflow_id) {
            Ok(c) => c,
            Err(_) => return Ok(0),
        };

        let tasks = self
            .store
            .list_tasks(TaskFilter {
                submission_id: Some(submission.submission_id),
                state: None,
            })
            .await?;

        let mut tasks_by_step: HashMap<String, Vec<Task>> = HashMap::new();
        for task in tasks {
            tasks_by_step.entry(base_step_id(&task.step_id).to_string()).or_default().push(task);
        }

        let started: HashSet<String> = tasks_by_step.keys().cloned().collect();
        let completed: HashSet<String> = tasks_by_step
            .iter()
            .filter(|(_, group)| !group.is_empty() && group.iter().all(|t| t.state.is_terminal()))
            .filter(|(_, group)| group.iter().all(|t| t.state != TaskState::Failed))
            .map(|(id, _)| id.clone())
            .collect();

        let mut outputs_by_step: HashMap<String, HashMap<String, CwlValue>> = HashMap::new();
        for step_id in &completed {
            let step = cached.flat_steps.iter().find(|s| &s.step_id == step_id);
            outputs_by_step.insert(step_id.clone(), merge_step_outputs(step, &tasks_by_step[step_id]));
        }

        let ready = dag::ready_steps(&cached.flat_steps, &completed, &started);
        let mut created = 0;
        for step in ready {
            created += self.schedule_step(submission, &cached, step, &outputs_by_step).await?;
        }
        Ok(created)
    }

    async fn schedule_step(
        &self,
        submission: &Submission,
        cached: &CachedDocument,
        step: &Step,
        outputs_by_step: &HashMap<String, HashMap<String, CwlValue>>,
    ) -> Result<usize, SchedulerError> {
        let tool = cached.document.tools.get(&step.run);
        let evaluator = Evaluator::new(tool.map(|t| t.requirements.expression_lib.clone()).unwrap_or_default());

        let mut resolved: HashMap<String, CwlValue> = HashMap::new();
        for input in &step.inputs {
            let value = resolve::resolve_merge(&input.sources, input.link_merge, input.pick_value, |s| {
                resolve::lookup_source(s, &submission.inputs, outputs_by_step)
            })
            .unwrap_or(CwlValue::Null);
            let value = if value.is_null() {
                input.default.clone().unwrap_or(CwlValue::Null)
            } else {
                value
            };
            resolved.insert(input.id.clone(), value);
        }

        if let Some(when) = &step.when {
            if !eval_when(&evaluator, when, &resolved) {
                let mut task = Task::new(submission.submission_id, step.step_id.clone());
                task.state = TaskState::Skipped;
                self.store.put_task(task).await?;
                return Ok(1);
            }
        }

        let executor_type = tool
            .map(|t| {
                if t.requirements.docker.is_some() {
                    ExecutorType::Container
                } else {
                    ExecutorType::Local
                }
            })
            .unwrap_or(ExecutorType::Local);
        let runtime_hints = tool.map(runtime_hints_for).unwrap_or_default();

        if step.scatter.is_empty() {
            let mut task = Task::new(submission.submission_id, step.step_id.clone());
            task.inputs = resolved;
            task.executor_type = Some(executor_type);
            task.runtime_hints = runtime_hints;
            task.max_retries = self.config.retry.max_attempts.saturating_sub(1);
            task.state = TaskState::Queued;
            self.store.put_task(task).await?;
            return Ok(1);
        }

        let method = step.scatter_method.unwrap_or(ScatterMethod::Dotproduct);
        let combos = match scatter::expand(&step.scatter, method, &resolved) {
            Ok(c) => c,
            Err(err) => {
                let mut task = Task::new(submission.submission_id, step.step_id.clone());
                task.state = TaskState::Failed;
                task.error = Some(ErrorSummary::new(ErrorKind::InvalidInput, err.to_string()));
                self.store.put_task(task).await?;
                return Ok(1);
            }
        };

        let scattered: HashSet<&String> = step.scatter.iter().collect();
        let mut created = 0;
        for combo in combos {
            let suffix = combo.indices.iter().map(usize::to_string).collect::<Vec<_>>().join(".");
            let mut task = Task::new(submission.submission_id, format!("{}#{suffix}", step.step_id));
            for (id, value) in &resolved {
                if !scattered.contains(id) {
                    task.inputs.insert(id.clone(), value.clone());
                }
            }
            task.inputs.extend(combo.values);
            task.executor_type = Some(executor_type);
            task.runtime_hints = runtime_hints.clone();
            task.max_retries = self.config.retry.max_attempts.saturating_sub(1);
            task.state = TaskState::Queued;
            self.store.put_task(task).await?;
            created += 1;
        }
        Ok(created)
    }

    async fn dispatch(&self, task: Task) -> Result<(), SchedulerError> {
        let submission = self.store.get_submission(task.submission_id).await?;
        let Ok(cached) = self.document(submission.workflow_id) else {
            return Ok(());
        };
        let base_id = base_step_id(&task.step_id);
        let Some(step) = cached.flat_steps.iter().find(|s| s.step_id == base_id) else {
            return Ok(());
        };
        let Some(tool) = cached.document.tools.get(&step.run) else {
            return Ok(());
        };

        let mut running = task;
        running.state = TaskState::Running;
        running.updated_at = Utc::now();
        self.store.update_task(running.clone()).await?;

        let outcome = if tool.class == ProcessClass::ExpressionTool {
            run_expression_tool(tool, &running)
        } else {
            let task_dir = self
                .work_root
                .join(running.submission_id.to_string())
                .join(running.task_id.to_string());
            let ctx = ExecutionContext {
                work_dir: task_dir.join("work"),
                tmp_dir: task_dir.join("tmp"),
                tool: tool.clone(),
                evaluator: Evaluator::new(tool.requirements.expression_lib.clone()),
            };
            self.executors
                .submit(running.executor_type.unwrap_or(ExecutorType::Local), &running, &ctx)
                .await
                .map_err(|e: ExecutorError| ErrorSummary::from_classified(&e))
        };

        match outcome {
            Ok(TaskOutcome::Success { outputs, exit_code }) => {
                running.state = TaskState::Success;
                running.outputs = outputs;
                running.exit_code = exit_code;
                running.updated_at = Utc::now();
                self.store.update_task(running).await?;
            }
            Ok(TaskOutcome::Failure(summary)) => self.retry_or_fail(running, summary).await?,
            Err(summary) => self.retry_or_fail(running, summary).await?,
        }
        Ok(())
    }

    /// Requeue `task` if it has attempts remaining and the error is
    /// retryable, otherwise mark it `Failed`. Retries are requeued
    /// immediately rather than after `RetryPolicy::delay_for_attempt`'s
    /// backoff — the tick interval already spaces dispatch attempts out;
    /// a precise per-attempt delay would need a `retry_after` timestamp on
    /// `Task`, which isn't worth the schema churn for this engine's scale.
    async fn retry_or_fail(&self, mut task: Task, error: ErrorSummary) -> Result<(), SchedulerError> {
        let has_attempts = task.retry_count < task.max_retries;
        let retryable = error.retryable && has_attempts && self.config.retry.should_retry(Some(&error.kind.to_string()));
        task.error = Some(error);
        task.updated_at = Utc::now();
        if retryable {
            task.retry_count += 1;
            task.state = TaskState::Queued;
        } else {
            task.state = TaskState::Failed;
        }
        self.store.update_task(task).await?;
        Ok(())
    }

    async fn fail_unsupported_executor(&self, mut task: Task) -> Result<(), SchedulerError> {
        task.state = TaskState::Failed;
        task.error = Some(
            ErrorSummary::new(ErrorKind::Internal, "external executor type has no implementation in this engine")
                .retryable(false),
        );
        task.updated_at = Utc::now();
        self.store.update_task(task).await?;
        Ok(())
    }

    async fn reconcile_and_finalize(&self, submission: &Submission) -> Result<ReconcileOutcome, SchedulerError> {
        let cached = match self.document(submission.workflow_id) {
            Ok(c) => c,
            Err(_) => return Ok(ReconcileOutcome::default()),
        };

        let tasks = self
            .store
            .list_tasks(TaskFilter {
                submission_id: Some(submission.submission_id),
                state: None,
            })
            .await?;

        if submission.cancel_requested {
            return self.finalize_cancellation(submission, tasks).await;
        }

        let mut tasks_by_step: HashMap<String, Vec<Task>> = HashMap::new();
        for task in tasks {
            tasks_by_step.entry(base_step_id(&task.step_id).to_string()).or_default().push(task);
        }

        if tasks_by_step.len() < cached.flat_steps.len() {
            return Ok(ReconcileOutcome::default());
        }
        let all_terminal = tasks_by_step.values().all(|group| !group.is_empty() && group.iter().all(|t| t.state.is_terminal()));
        if !all_terminal {
            return Ok(ReconcileOutcome::default());
        }

        let mut updated = submission.clone();
        updated.completed_at = Some(Utc::now());

        let failed_task = tasks_by_step.values().flatten().find(|t| t.state == TaskState::Failed).cloned();
        if let Some(failed) = failed_task {
            updated.state = SubmissionState::Failed;
            updated.error = failed.error;
        } else {
            let mut outputs_by_step = HashMap::new();
            for (step_id, group) in &tasks_by_step {
                let step = cached.flat_steps.iter().find(|s| &s.step_id == step_id);
                outputs_by_step.insert(step_id.clone(), merge_step_outputs(step, group));
            }
            updated.outputs = resolve_workflow_outputs(&cached, submission, &outputs_by_step);
            updated.state = SubmissionState::Completed;
        }

        self.store.update_submission(updated).await?;
        Ok(ReconcileOutcome {
            finalized: true,
            ..Default::default()
        })
    }

    /// Skip every non-terminal task (requesting an abort first for ones
    /// already `Running`) and mark the submission `Cancelled`, tallying how
    /// many tasks were actually cancelled versus already done (spec.md
    /// §4.8, scenario (d)).
    async fn finalize_cancellation(
        &self,
        submission: &Submission,
        tasks: Vec<Task>,
    ) -> Result<ReconcileOutcome, SchedulerError> {
        let mut tasks_cancelled = 0usize;
        let mut tasks_already_completed = 0usize;

        for task in tasks {
            if task.state.is_terminal() {
                tasks_already_completed += 1;
                continue;
            }
            if task.state == TaskState::Running {
                if let Some(executor_type) = task.executor_type {
                    if let Err(err) = self.executors.cancel(executor_type, &task).await {
                        debug!(task_id = %task.task_id, error = %err, "cancel request failed, marking skipped anyway");
                    }
                }
            }
            tasks_cancelled += 1;
            let mut skipped = task;
            skipped.state = TaskState::Skipped;
            skipped.updated_at = Utc::now();
            self.store.update_task(skipped).await?;
        }

        let mut updated = submission.clone();
        updated.state = SubmissionState::Cancelled;
        updated.completed_at = Some(Utc::now());
        self.store.update_submission(updated).await?;
        Ok(ReconcileOutcome {
            finalized: true,
            tasks_cancelled,
            tasks_already_completed,
        })
    }
}

fn eval_when(evaluator: &Evaluator, when: &str, resolved: &HashMap<String, CwlValue>) -> bool {
    let inputs_json = serde_json::Value::Object(resolved.iter().map(|(k, v)| (k.clone(), v.to_json())).collect());
    let ctx = EvalContext::new(inputs_json, serde_json::Value::Null, serde_json::Value::Null);
    evaluator
        .interpolate(when, &ctx)
        .ok()
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

fn runtime_hints_for(tool: &NormalizedTool) -> RuntimeHints {
    RuntimeHints {
        docker_image: tool.requirements.docker.as_ref().map(|d| d.image.clone()),
        cores: tool.requirements.resource.as_ref().and_then(|r| r.cores_min),
        ram_mb: tool.requirements.resource.as_ref().and_then(|r| r.ram_min),
        namespaces: HashMap::new(),
        expression_lib: tool.requirements.expression_lib.clone(),
        temporary_fail_codes: tool.temporary_fail_codes.clone(),
        success_codes: tool.success_codes.clone(),
    }
}

fn run_expression_tool(tool: &NormalizedTool, task: &Task) -> Result<TaskOutcome, ErrorSummary> {
    let body = tool
        .expression
        .as_deref()
        .ok_or_else(|| ErrorSummary::new(ErrorKind::InvalidWorkflow, "ExpressionTool has no expression body"))?;

    let evaluator = Evaluator::new(tool.requirements.expression_lib.clone());
    let inputs_json = serde_json::Value::Object(task.inputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect());
    let ctx = EvalContext::new(inputs_json, serde_json::Value::Null, serde_json::Value::Null);
    let result = evaluator
        .interpolate(body, &ctx)
        .map_err(|e| ErrorSummary::new(ErrorKind::ExpressionError, e.to_string()))?;

    let serde_json::Value::Object(map) = result else {
        return Err(ErrorSummary::new(ErrorKind::ExpressionError, "ExpressionTool body must evaluate to an object"));
    };
    let outputs = map.into_iter().map(|(k, v)| (k, CwlValue::from_json(v))).collect();
    Ok(TaskOutcome::Success { outputs, exit_code: None })
}

/// Combine a step's sibling task outputs (one task if unscattered, one per
/// combo otherwise) into the output shape `reassemble` implies, ordered by
/// each task's scatter index suffix.
fn merge_step_outputs(step: Option<&Step>, tasks: &[Task]) -> HashMap<String, CwlValue> {
    let Some(step) = step else {
        return HashMap::new();
    };
    if step.scatter.is_empty() {
        return tasks.first().map(|t| t.outputs.clone()).unwrap_or_default();
    }

    let mut ordered: Vec<&Task> = tasks.iter().collect();
    ordered.sort_by_key(|t| scatter_indices(&t.step_id));

    let dim_count = ordered.first().map(|t| scatter_indices(&t.step_id).len()).unwrap_or(1);
    let mut dims = vec![0usize; dim_count];
    for t in &ordered {
        for (d, idx) in scatter_indices(&t.step_id).into_iter().enumerate() {
            dims[d] = dims[d].max(idx + 1);
        }
    }

    let method = step.scatter_method.unwrap_or(ScatterMethod::Dotproduct);
    let mut merged = HashMap::new();
    for output in &step.outputs {
        let values: Vec<CwlValue> = ordered.iter().map(|t| t.outputs.get(&output.id).cloned().unwrap_or(CwlValue::Null)).collect();
        merged.insert(output.id.clone(), scatter::reassemble(method, &dims, values));
    }
    merged
}

fn resolve_workflow_outputs(
    cached: &CachedDocument,
    submission: &Submission,
    outputs_by_step: &HashMap<String, HashMap<String, CwlValue>>,
) -> HashMap<String, CwlValue> {
    let Some(main) = cached.document.main_workflow() else {
        return HashMap::new();
    };
    main.outputs
        .iter()
        .map(|(id, source): (&String, &OutputSource)| {
            let sources = flatten::apply_output_alias(&source.sources, &cached.output_alias);
            let value = resolve::resolve_merge(&sources, source.link_merge, source.pick_value, |s| {
                resolve::lookup_source(s, &submission.inputs, outputs_by_step)
            })
            .unwrap_or(CwlValue::Null);
            (id.clone(), value)
        })
        .collect()
}

/// A scattered step's tasks use `<step_id>#<i0>.<i1>...` as their
/// `step_id`, so downstream steps' `depends_on` still matches on the bare
/// step id while siblings stay distinguishable for reassembly.
fn base_step_id(step_id: &str) -> &str {
    step_id.split('#').next().unwrap_or(step_id)
}

fn scatter_indices(step_id: &str) -> Vec<usize> {
    step_id
        .split('#')
        .nth(1)
        .map(|suffix| suffix.split('.').filter_map(|s| s.parse().ok()).collect())
        .unwrap_or_default()
}

fn content_hash(packed: &PackedDocument) -> String {
    let bytes = serde_json::to_vec(&packed.to_json()).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}
