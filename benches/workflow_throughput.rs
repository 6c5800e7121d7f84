//! Workflow throughput benchmark
//!
//! Tests the target scenario: thousands of parallel submissions, each with
//! many sequential steps, driven through the worker pull protocol.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Runtime;

use gowe::bench::{BenchmarkMetrics, BenchmarkReport, ReportConfig};
use gowe::store::InMemoryStore;
use gowe::value::{ExecutorType, Task, TaskState};
use gowe::Store;
use uuid::Uuid;

/// Per-submission progress tracking.
struct SubmissionState {
    id: Uuid,
    current_step: AtomicU64,
    total_steps: u64,
    completed: AtomicBool,
}

/// Many-submission, many-step-per-submission scenario.
struct WorkflowScenario {
    store: Arc<InMemoryStore>,
    submissions: Vec<Arc<SubmissionState>>,
    submission_count: usize,
    steps_per_submission: u64,
    worker_count: usize,
    queued_at: Arc<parking_lot::Mutex<std::collections::HashMap<Uuid, Instant>>>,
}

impl WorkflowScenario {
    fn new(submission_count: usize, steps_per_submission: u64, worker_count: usize) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            submissions: Vec::new(),
            submission_count,
            steps_per_submission,
            worker_count,
            queued_at: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
        }
    }

    fn setup(&mut self) {
        for _ in 0..self.submission_count {
            self.submissions.push(Arc::new(SubmissionState {
                id: Uuid::now_v7(),
                current_step: AtomicU64::new(0),
                total_steps: self.steps_per_submission,
                completed: AtomicBool::new(false),
            }));
        }
    }

    /// Enqueue step 0 of every submission.
    async fn start_submissions(&self) {
        for submission in &self.submissions {
            self.enqueue_step(submission, 0).await;
        }
    }

    async fn enqueue_step(&self, submission: &SubmissionState, step: u64) {
        let mut task = Task::new(submission.id, format!("step-{step}"));
        task.executor_type = Some(ExecutorType::Worker);
        task.state = TaskState::Queued;
        let enqueue_time = Instant::now();
        self.queued_at.lock().insert(task.task_id, enqueue_time);
        self.store.put_task(task).await.unwrap();
    }

    /// Run workers that claim and complete steps, enqueuing the next step of
    /// the same submission until it reaches `total_steps`.
    async fn run(&self, metrics: &BenchmarkMetrics, simulate_execution: bool, pb: &ProgressBar) -> (u64, Duration) {
        let start = Instant::now();
        let completed_submissions = Arc::new(AtomicU64::new(0));
        let total_tasks_completed = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();

        for worker_id in 0..self.worker_count {
            let store = self.store.clone();
            let submissions = self.submissions.clone();
            let queued_at = self.queued_at.clone();
            let completed_submissions = completed_submissions.clone();
            let total_tasks_completed = total_tasks_completed.clone();
            let submission_count = self.submission_count;
            let schedule_to_start = metrics.schedule_to_start.clone();
            let execution = metrics.execution.clone();
            let end_to_end = metrics.end_to_end.clone();
            let tasks_completed_counter = metrics.tasks_completed.clone();
            let pb = pb.clone();

            handles.push(tokio::spawn(async move {
                let worker_name = format!("worker-{worker_id}");

                loop {
                    if completed_submissions.load(Ordering::Relaxed) >= submission_count as u64 {
                        break;
                    }

                    let claimed = store.claim_tasks(&worker_name, 1).await.unwrap();
                    if claimed.is_empty() {
                        if completed_submissions.load(Ordering::Relaxed) >= submission_count as u64 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_micros(50)).await;
                        continue;
                    }

                    let claim_time = Instant::now();

                    for mut task in claimed {
                        if let Some(enqueue_time) = queued_at.lock().get(&task.task_id).copied() {
                            schedule_to_start.record(claim_time.duration_since(enqueue_time));
                        }

                        let exec_start = Instant::now();
                        if simulate_execution {
                            let duration = Duration::from_micros(1000 + rand::random::<u64>() % 9000);
                            tokio::time::sleep(duration).await;
                        }
                        execution.record(exec_start.elapsed());

                        task.state = TaskState::Success;
                        store.update_task(task.clone()).await.unwrap();

                        if let Some(enqueue_time) = queued_at.lock().get(&task.task_id).copied() {
                            end_to_end.record(Instant::now().duration_since(enqueue_time));
                        }

                        tasks_completed_counter.increment();
                        let current = total_tasks_completed.fetch_add(1, Ordering::Relaxed) + 1;
                        pb.set_position(current);

                        if let Some(submission) = submissions.iter().find(|s| s.id == task.submission_id) {
                            let current_step = submission.current_step.fetch_add(1, Ordering::SeqCst);
                            let next_step = current_step + 1;

                            if next_step >= submission.total_steps {
                                submission.completed.store(true, Ordering::Release);
                                completed_submissions.fetch_add(1, Ordering::Relaxed);
                            } else {
                                let mut next_task = Task::new(submission.id, format!("step-{next_step}"));
                                next_task.executor_type = Some(ExecutorType::Worker);
                                next_task.state = TaskState::Queued;
                                let enqueue_time = Instant::now();
                                queued_at.lock().insert(next_task.task_id, enqueue_time);
                                store.put_task(next_task).await.unwrap();
                            }
                        }
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let elapsed = start.elapsed();
        let total = total_tasks_completed.load(Ordering::Relaxed);

        (total, elapsed)
    }
}

async fn run_workflow_test(
    name: &str,
    submission_count: usize,
    steps_per_submission: u64,
    worker_count: usize,
    simulate_execution: bool,
) -> Arc<BenchmarkMetrics> {
    let metrics = Arc::new(BenchmarkMetrics::new(name));
    let total_tasks = submission_count as u64 * steps_per_submission;

    println!("\nRunning: {name}");
    println!("   Submissions: {submission_count}, Steps/submission: {steps_per_submission}, Workers: {worker_count}");
    println!("   Total tasks: {total_tasks}");

    let mut scenario = WorkflowScenario::new(submission_count, steps_per_submission, worker_count);
    scenario.setup();

    let pb = ProgressBar::new(total_tasks);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap()
            .progress_chars("=>-"),
    );

    let metrics_clone = metrics.clone();
    let sampling_handle = tokio::spawn(async move {
        loop {
            metrics_clone.sample();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    scenario.start_submissions().await;
    let (completed_tasks, elapsed) = scenario.run(&metrics, simulate_execution, &pb).await;

    sampling_handle.abort();
    metrics.sample();
    pb.finish_and_clear();

    let e2e = metrics.end_to_end.summary();
    let s2s = metrics.schedule_to_start.summary();
    let exec = metrics.execution.summary();

    println!("Completed {submission_count} submissions in {:.2}s", elapsed.as_secs_f64());
    println!(
        "   Task throughput:       {:.1} tasks/sec",
        completed_tasks as f64 / elapsed.as_secs_f64()
    );
    println!(
        "   Submission throughput: {:.1} submissions/sec",
        submission_count as f64 / elapsed.as_secs_f64()
    );
    println!(
        "   Schedule-to-Start:     P50={:.2}ms P99={:.2}ms",
        s2s.p50.as_secs_f64() * 1000.0,
        s2s.p99.as_secs_f64() * 1000.0
    );
    println!(
        "   End-to-End (task):     P50={:.2}ms P99={:.2}ms",
        e2e.p50.as_secs_f64() * 1000.0,
        e2e.p99.as_secs_f64() * 1000.0
    );

    let s2s_p99_ms = s2s.p99.as_secs_f64() * 1000.0;
    if s2s_p99_ms < 10.0 {
        println!("   S2S P99 < 10ms: tasks picked up instantly");
    } else if s2s_p99_ms < 50.0 {
        println!("   S2S P99 {s2s_p99_ms:.1}ms: could add more workers");
    } else {
        println!("   S2S P99 {s2s_p99_ms:.1}ms: workers are backlogged");
    }

    let overhead_ms = (e2e.p50.as_secs_f64() - s2s.p50.as_secs_f64() - exec.p50.as_secs_f64()) * 1000.0;
    if overhead_ms > 5.0 {
        println!("   Scheduling overhead {:.1}ms: check for contention", overhead_ms.max(0.0));
    }

    metrics
}

fn main() {
    let rt = Runtime::new().unwrap();

    println!("================================================================");
    println!("         Submission Throughput Benchmark");
    println!("================================================================");
    println!("\nSimulates the target scenario:");
    println!("  - Thousands of parallel submissions");
    println!("  - Each submission has many sequential steps");
    println!("  - Workers claim and execute steps, advancing submissions");

    let small = rt.block_on(run_workflow_test("small_10sub_10steps", 10, 10, 10, false));
    let medium = rt.block_on(run_workflow_test("medium_100sub_50steps", 100, 50, 50, false));
    let target = rt.block_on(run_workflow_test("target_1000sub_100steps", 1000, 100, 100, false));
    let target_exec = rt.block_on(run_workflow_test("target_1000sub_100steps_exec", 1000, 100, 100, true));
    let high_parallel = rt.block_on(run_workflow_test("parallel_5000sub_20steps", 5000, 20, 200, false));
    let deep = rt.block_on(run_workflow_test("deep_100sub_500steps", 100, 500, 50, false));

    println!("\n================================================================");
    println!("                    Summary");
    println!("================================================================");
    println!("\n{:<32} {:>12} {:>12} {:>12} {:>12}", "Scenario", "Tasks/sec", "Sub/sec", "P50 S2S", "P99 S2S");
    println!("{:-<32} {:->12} {:->12} {:->12} {:->12}", "", "", "", "", "");

    for (name, m, sub_count) in [
        ("small_10sub_10steps", &small, 10),
        ("medium_100sub_50steps", &medium, 100),
        ("target_1000sub_100steps", &target, 1000),
        ("target_1000sub_100steps_exec", &target_exec, 1000),
        ("parallel_5000sub_20steps", &high_parallel, 5000),
        ("deep_100sub_500steps", &deep, 100),
    ] {
        let task_throughput = m.tasks_completed.throughput();
        let sub_throughput = sub_count as f64 / m.elapsed().as_secs_f64();
        let s2s = m.schedule_to_start.summary();
        println!(
            "{:<32} {:>10.1}/s {:>10.1}/s {:>10.2}ms {:>10.2}ms",
            name,
            task_throughput,
            sub_throughput,
            s2s.p50.as_secs_f64() * 1000.0,
            s2s.p99.as_secs_f64() * 1000.0
        );
    }

    println!("\nGenerating HTML reports...");

    let report_config = ReportConfig {
        output_dir: "target/benchmark-reports".to_string(),
        title: "Submission Throughput Benchmark".to_string(),
        include_raw_data: false,
    };

    for (name, m) in [
        ("target_1000sub_100steps", &target),
        ("target_1000sub_100steps_exec", &target_exec),
        ("parallel_5000sub_20steps", &high_parallel),
    ] {
        let report = BenchmarkReport::new(report_config.clone());
        match report.generate(m) {
            Ok(path) => println!("   {name}: {path}"),
            Err(e) => println!("   {name}: {e}"),
        }
    }
}
