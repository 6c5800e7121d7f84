//! Concurrent workers load test
//!
//! Drives the `Store::claim_tasks` pull protocol under realistic load with
//! multiple workers. Generates HTML reports similar to Gatling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

use gowe::bench::{ActivityDuration, BenchmarkMetrics, BenchmarkReport, ReportConfig};
use gowe::store::InMemoryStore;
use gowe::value::{ExecutorType, Task, TaskState};
use gowe::Store;
use uuid::Uuid;

/// Shared test scenario state.
struct TestScenario {
    store: Arc<InMemoryStore>,
    submission_id: Uuid,
    task_count: u64,
    queued_at: Arc<parking_lot::Mutex<std::collections::HashMap<Uuid, Instant>>>,
    completed: Arc<AtomicU64>,
    /// Whether to simulate realistic tool execution durations.
    simulate_execution: bool,
    worker_count: usize,
}

impl TestScenario {
    fn new(task_count: u64, worker_count: usize, simulate_execution: bool) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            submission_id: Uuid::now_v7(),
            task_count,
            queued_at: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
            completed: Arc::new(AtomicU64::new(0)),
            simulate_execution,
            worker_count,
        }
    }

    async fn enqueue_all_tasks(&self) {
        for i in 0..self.task_count {
            let mut task = Task::new(self.submission_id, format!("step-{i}"));
            task.executor_type = Some(ExecutorType::Worker);
            task.state = TaskState::Queued;
            let queued_at = Instant::now();
            self.queued_at.lock().insert(task.task_id, queued_at);
            self.store.put_task(task).await.unwrap();
        }
    }

    async fn run_workers(&self, metrics: &BenchmarkMetrics, pb: &ProgressBar) {
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::new();

        for worker_id in 0..self.worker_count {
            let store = self.store.clone();
            let queued_at = self.queued_at.clone();
            let completed = self.completed.clone();
            let task_count = self.task_count;
            let simulate_execution = self.simulate_execution;
            let schedule_to_start = metrics.schedule_to_start.clone();
            let execution = metrics.execution.clone();
            let end_to_end = metrics.end_to_end.clone();
            let tasks_completed = metrics.tasks_completed.clone();
            let semaphore = semaphore.clone();
            let pb = pb.clone();

            handles.push(tokio::spawn(async move {
                let worker_name = format!("worker-{worker_id}");

                loop {
                    if completed.load(Ordering::Relaxed) >= task_count {
                        break;
                    }
                    let _permit = semaphore.acquire().await.unwrap();

                    let claimed = store.claim_tasks(&worker_name, 1).await.unwrap();
                    if claimed.is_empty() {
                        if completed.load(Ordering::Relaxed) >= task_count {
                            break;
                        }
                        tokio::time::sleep(Duration::from_micros(100)).await;
                        continue;
                    }

                    let claim_time = Instant::now();
                    for mut task in claimed {
                        if let Some(enqueue_time) = queued_at.lock().get(&task.task_id).copied() {
                            schedule_to_start.record(claim_time.duration_since(enqueue_time));
                        }

                        let exec_start = Instant::now();
                        if simulate_execution {
                            let duration = ActivityDuration::sample().min(Duration::from_millis(100));
                            tokio::time::sleep(duration).await;
                        }
                        execution.record(exec_start.elapsed());

                        task.state = TaskState::Success;
                        store.update_task(task.clone()).await.unwrap();

                        if let Some(enqueue_time) = queued_at.lock().get(&task.task_id).copied() {
                            end_to_end.record(Instant::now().duration_since(enqueue_time));
                        }

                        tasks_completed.increment();
                        let current = completed.fetch_add(1, Ordering::Relaxed) + 1;
                        pb.set_position(current);
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}

/// Run a single load test scenario.
async fn run_scenario(name: &str, task_count: u64, worker_count: usize, simulate_execution: bool) -> Arc<BenchmarkMetrics> {
    let metrics = Arc::new(BenchmarkMetrics::new(name));
    let scenario = TestScenario::new(task_count, worker_count, simulate_execution);

    println!("\nRunning: {name}");
    println!("   Tasks: {task_count}, Workers: {worker_count}, Simulate execution: {simulate_execution}");

    let enqueue_start = Instant::now();
    scenario.enqueue_all_tasks().await;
    let enqueue_time = enqueue_start.elapsed();
    println!(
        "   Queued {} tasks in {:.2}ms ({:.0} tasks/sec)",
        task_count,
        enqueue_time.as_secs_f64() * 1000.0,
        task_count as f64 / enqueue_time.as_secs_f64()
    );

    let pb = ProgressBar::new(task_count);
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

    let run_start = Instant::now();
    scenario.run_workers(&metrics, &pb).await;
    let run_time = run_start.elapsed();

    sampling_handle.abort();
    metrics.sample();
    pb.finish_and_clear();

    let e2e = metrics.end_to_end.summary();
    let s2s = metrics.schedule_to_start.summary();

    println!("Completed in {:.2}s", run_time.as_secs_f64());
    println!("   Throughput:        {:.1} tasks/sec", task_count as f64 / run_time.as_secs_f64());
    println!(
        "   Schedule-to-Start: P50={:.2}ms P99={:.2}ms",
        s2s.p50.as_secs_f64() * 1000.0,
        s2s.p99.as_secs_f64() * 1000.0
    );
    println!(
        "   End-to-End:        P50={:.2}ms P99={:.2}ms",
        e2e.p50.as_secs_f64() * 1000.0,
        e2e.p99.as_secs_f64() * 1000.0
    );

    metrics
}

fn main() {
    let rt = Runtime::new().unwrap();

    println!("================================================================");
    println!("           gowe worker claim protocol load test");
    println!("================================================================");

    let baseline = rt.block_on(run_scenario("baseline_1_worker", 10_000, 1, false));
    let scale_10 = rt.block_on(run_scenario("scale_10_workers", 10_000, 10, false));
    let scale_50 = rt.block_on(run_scenario("scale_50_workers", 10_000, 50, false));
    let realistic_10 = rt.block_on(run_scenario("realistic_10_workers", 1_000, 10, true));
    let burst = rt.block_on(run_scenario("burst_50k_tasks", 50_000, 100, false));

    println!("\n================================================================");
    println!("                    Summary");
    println!("================================================================");
    println!("\n{:<30} {:>12} {:>12} {:>12}", "Scenario", "Throughput", "P50 S2S", "P99 S2S");
    println!("{:-<30} {:->12} {:->12} {:->12}", "", "", "", "");

    for (name, m) in [
        ("baseline_1_worker", &baseline),
        ("scale_10_workers", &scale_10),
        ("scale_50_workers", &scale_50),
        ("realistic_10_workers", &realistic_10),
        ("burst_50k_tasks", &burst),
    ] {
        let throughput = m.tasks_completed.throughput();
        let s2s = m.schedule_to_start.summary();
        println!(
            "{:<30} {:>10.1}/s {:>10.2}ms {:>10.2}ms",
            name,
            throughput,
            s2s.p50.as_secs_f64() * 1000.0,
            s2s.p99.as_secs_f64() * 1000.0
        );
    }

    println!("\nGenerating HTML reports...");
    let report_config = ReportConfig {
        output_dir: "target/benchmark-reports".to_string(),
        title: "gowe worker claim benchmark".to_string(),
        include_raw_data: false,
    };

    for (name, m) in [("baseline_1_worker", &baseline), ("scale_50_workers", &scale_50), ("burst_50k_tasks", &burst)] {
        let report = BenchmarkReport::new(report_config.clone());
        match report.generate(m) {
            Ok(path) => println!("   {name}: {path}"),
            Err(e) => println!("   {name}: {e}"),
        }
    }
}
