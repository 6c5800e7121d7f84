//! Runtime configuration (spec.md §1.1 "Configuration", §6.5).
//!
//! Mirrors the teacher's `ExecutorConfig`/`WorkerPoolConfig`/
//! `BackpressureConfig`/`RetryPolicy` shape: plain structs with a
//! `Default` impl, overridable from environment variables at the binary
//! entrypoint rather than through a config-file crate.

use std::time::Duration;

use crate::reliability::RetryPolicy;
use crate::worker::BackpressureConfig;

/// Top-level configuration for a scheduler + worker-pool process.
#[derive(Debug, Clone)]
pub struct GoweConfig {
    /// How often the scheduler runs its five-phase tick.
    pub tick_interval: Duration,

    /// How long a worker's lease is valid without a heartbeat before the
    /// scheduler's reap phase reclaims its tasks (spec.md §4.6).
    pub worker_lease_timeout: Duration,

    /// How often a worker is expected to heartbeat; informs clients, not
    /// enforced server-side beyond `worker_lease_timeout`.
    pub heartbeat_interval: Duration,

    /// Maximum number of tasks dispatched to `worker`-type executors per
    /// tick, independent of `max_concurrency` on any individual worker.
    pub max_inflight_worker_tasks: usize,

    pub retry: RetryPolicy,
    pub backpressure: BackpressureConfig,

    /// `GOWE_SERVER`: base URL workers poll against (§6.5).
    pub server_url: Option<String>,

    /// `GOWE_PATH_MAP`: container-to-host path prefixes for input
    /// remapping, parsed from `src1=dst1:src2=dst2` (§6.5).
    pub path_map: Vec<(String, String)>,

    /// `GOWE_OUTPUT_PATH_MAP`: analogous map applied to output paths (§6.5).
    pub output_path_map: Vec<(String, String)>,
}

impl Default for GoweConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            worker_lease_timeout: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            max_inflight_worker_tasks: 256,
            retry: RetryPolicy::default(),
            backpressure: BackpressureConfig::default(),
            server_url: None,
            path_map: Vec::new(),
            output_path_map: Vec::new(),
        }
    }
}

impl GoweConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_worker_lease_timeout(mut self, timeout: Duration) -> Self {
        self.worker_lease_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overlay values read from the process environment: `GOWE_SERVER`,
    /// `GOWE_PATH_MAP`, `GOWE_OUTPUT_PATH_MAP`. Absent variables leave the
    /// existing field untouched, so this can be applied on top of
    /// programmatic defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(server) = std::env::var("GOWE_SERVER") {
            self.server_url = Some(server);
        }
        if let Ok(map) = std::env::var("GOWE_PATH_MAP") {
            self.path_map = parse_path_map(&map);
        }
        if let Ok(map) = std::env::var("GOWE_OUTPUT_PATH_MAP") {
            self.output_path_map = parse_path_map(&map);
        }
        self
    }

    /// Translate a container-side path to its host equivalent using
    /// `path_map`, falling back to the original path when no prefix
    /// matches (spec.md §6.5).
    pub fn map_input_path(&self, path: &str) -> String {
        remap(path, &self.path_map)
    }

    pub fn map_output_path(&self, path: &str) -> String {
        remap(path, &self.output_path_map)
    }
}

fn parse_path_map(raw: &str) -> Vec<(String, String)> {
    raw.split(':')
        .filter_map(|pair| {
            let (src, dst) = pair.split_once('=')?;
            Some((src.to_string(), dst.to_string()))
        })
        .collect()
}

fn remap(path: &str, map: &[(String, String)]) -> String {
    for (src, dst) in map {
        if let Some(rest) = path.strip_prefix(src.as_str()) {
            return format!("{dst}{rest}");
        }
    }
    path.to_string()
}
