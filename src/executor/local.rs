//! Local and containerized tool executor (C6, spec.md §4.5): stages
//! inputs, launches the process directly or through a container CLI,
//! captures stdout/stderr, and collects outputs by glob or
//! `cwl.output.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha1::{Digest, Sha1};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::command::{bindings_from_tool, build_command, join_for_shell};
use crate::error::ErrorSummary;
use crate::expr::EvalContext;
use crate::parser::{NormalizedTool, SecondaryFilePattern, ToolOutput};
use crate::value::{CwlValue, DirectoryValue, FileValue, Task, TaskState};

use super::{ExecutionContext, Executor, ExecutorError, TaskOutcome};

/// `loadContents` reads are capped at this size (spec.md §4.5 "File metadata").
const LOAD_CONTENTS_LIMIT: u64 = 64 * 1024;

/// How the executor launches the tool's process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContainerRuntime {
    #[default]
    None,
    Docker,
    Apptainer,
}

#[derive(Debug, Clone, Default)]
pub struct LocalExecutorConfig {
    pub container_runtime: ContainerRuntime,
    /// Host-side mount root for container runs; defaults to each task's
    /// own work/tmp dirs when unset.
    pub dockerized_work_dir: Option<String>,
}

/// Runs `CommandLineTool`/`ExpressionTool`-shaped tasks either as a direct
/// child process or wrapped in a container CLI invocation, depending on
/// the tool's `DockerRequirement` and this executor's configuration.
pub struct LocalExecutor {
    config: LocalExecutorConfig,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            config: LocalExecutorConfig::default(),
        }
    }

    pub fn with_config(config: LocalExecutorConfig) -> Self {
        Self { config }
    }

    async fn run(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskOutcome, ExecutorError> {
        let tool = &ctx.tool;

        tokio::fs::create_dir_all(&ctx.work_dir)
            .await
            .map_err(|e| ExecutorError::Io(e.to_string()))?;
        tokio::fs::create_dir_all(&ctx.tmp_dir)
            .await
            .map_err(|e| ExecutorError::Io(e.to_string()))?;

        stage_inputs(&task.inputs, &ctx.work_dir)
            .await
            .map_err(|e| ExecutorError::Io(e.to_string()))?;
        materialize_initial_work_dir(tool, &task.inputs, &ctx.work_dir, &ctx.evaluator)
            .await
            .map_err(|e| ExecutorError::Io(e.to_string()))?;

        let runtime_json = serde_json::json!({
            "outdir": ctx.work_dir.to_string_lossy(),
            "tmpdir": ctx.tmp_dir.to_string_lossy(),
            "cores": task.runtime_hints.cores.unwrap_or(1),
            "ram": task.runtime_hints.ram_mb.unwrap_or(1024),
        });

        let bindings = bindings_from_tool(tool);
        let build = build_command(tool, &task.inputs, &bindings, &runtime_json, &ctx.evaluator)?;

        let (argv, shell_quote) = if tool.requirements.shell_command {
            (
                vec!["/bin/sh".to_string(), "-c".to_string(), join_for_shell(&build.command, &build.shell_quote)],
                vec![true, true, true],
            )
        } else {
            (build.command.clone(), build.shell_quote.clone())
        };
        let _ = shell_quote;

        let use_docker = matches!(self.config.container_runtime, ContainerRuntime::Docker | ContainerRuntime::Apptainer)
            && tool.requirements.docker.is_some();

        let mut command = if use_docker {
            self.docker_command(tool, &ctx.work_dir, &ctx.tmp_dir, &argv)
        } else {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        };

        command.current_dir(&ctx.work_dir);
        for (name, value) in &tool.requirements.env_vars {
            command.env(name, value);
        }

        if let Some(stdin_path) = &build.stdin {
            let file = std::fs::File::open(ctx.work_dir.join(stdin_path)).map_err(|e| ExecutorError::Io(e.to_string()))?;
            command.stdin(Stdio::from(file));
        } else {
            command.stdin(Stdio::null());
        }

        let stdout_capture = ctx.tmp_dir.join(format!(".stdout-{}.tmp", Uuid::now_v7()));
        let stderr_capture = ctx.tmp_dir.join(format!(".stderr-{}.tmp", Uuid::now_v7()));
        command.stdout(Stdio::from(
            std::fs::File::create(&stdout_capture).map_err(|e| ExecutorError::Io(e.to_string()))?,
        ));
        command.stderr(Stdio::from(
            std::fs::File::create(&stderr_capture).map_err(|e| ExecutorError::Io(e.to_string()))?,
        ));

        debug!(command = ?argv, work_dir = %ctx.work_dir.display(), "launching tool");

        let mut child = command.spawn().map_err(|e| ExecutorError::Io(e.to_string()))?;
        let peak_rss = track_peak_memory(child.id());

        let wait = child.wait();
        let status = match tool.requirements.tool_time_limit {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait)
                .await
                .map_err(|_| ExecutorError::TimedOut(Duration::from_secs(secs)))?
                .map_err(|e| ExecutorError::Io(e.to_string()))?,
            None => wait.await.map_err(|e| ExecutorError::Io(e.to_string()))?,
        };
        let peak_rss_mb = peak_rss.load(Ordering::Relaxed);

        let exit_code = status.code().unwrap_or(-1);

        let stdout_dest = ctx.work_dir.join(
            build.stdout.clone().unwrap_or_else(|| "cwl.stdout.txt".to_string()),
        );
        let stderr_dest = ctx.work_dir.join(
            build.stderr.clone().unwrap_or_else(|| "cwl.stderr.txt".to_string()),
        );
        tokio::fs::rename(&stdout_capture, &stdout_dest)
            .await
            .map_err(|e| ExecutorError::Io(e.to_string()))?;
        tokio::fs::rename(&stderr_capture, &stderr_dest)
            .await
            .map_err(|e| ExecutorError::Io(e.to_string()))?;

        debug!(%exit_code, peak_rss_mb, "tool process exited");

        if !tool.success_codes.contains(&exit_code) {
            if tool.temporary_fail_codes.contains(&exit_code) {
                return Ok(TaskOutcome::Failure(
                    ErrorSummary::new(crate::error::ErrorKind::ToolFailure, format!("exit code {exit_code} is temporary"))
                        .retryable(true),
                ));
            }
            return Ok(TaskOutcome::Failure(
                ErrorSummary::new(crate::error::ErrorKind::ToolFailure, format!("exit code {exit_code} not in successCodes"))
                    .retryable(false),
            ));
        }

        let outputs = collect_outputs(tool, &ctx.work_dir, &stdout_dest, &stderr_dest, exit_code, &ctx.evaluator)
            .await
            .map_err(ExecutorError::OutputCollection)?;

        Ok(TaskOutcome::Success {
            outputs,
            exit_code: Some(exit_code),
        })
    }

    fn docker_command(&self, tool: &NormalizedTool, work_dir: &Path, tmp_dir: &Path, argv: &[String]) -> Command {
        let binary = match self.config.container_runtime {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Apptainer => "apptainer",
            ContainerRuntime::None => "docker",
        };
        let image = tool
            .requirements
            .docker
            .as_ref()
            .map(|d| d.image.clone())
            .unwrap_or_default();

        let mut cmd = Command::new(binary);
        match self.config.container_runtime {
            ContainerRuntime::Apptainer => {
                cmd.arg("exec");
                cmd.arg("--bind").arg(format!("{}:/var/spool/cwl", work_dir.display()));
                cmd.arg("--bind").arg(format!("{}:/tmp", tmp_dir.display()));
                cmd.arg(format!("docker://{image}"));
            }
            _ => {
                cmd.arg("run").arg("--rm").arg("-i");
                cmd.arg("--mount").arg(format!(
                    "type=bind,source={},target=/var/spool/cwl",
                    work_dir.display()
                ));
                cmd.arg("--mount").arg(format!("type=bind,source={},target=/tmp", tmp_dir.display()));
                cmd.arg("-w").arg("/var/spool/cwl");
                cmd.arg(&image);
            }
        }
        cmd.args(argv);
        cmd
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    #[instrument(skip(self, task, ctx), fields(task_id = %task.task_id))]
    async fn submit(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskOutcome, ExecutorError> {
        self.run(task, ctx).await
    }

    async fn cancel(&self, task: &Task) -> Result<(), ExecutorError> {
        if task.state != TaskState::Running {
            return Ok(());
        }
        warn!(task_id = %task.task_id, "cancel requested; local executor relies on process group teardown on drop");
        Ok(())
    }
}

/// Symlink every staged File/Directory input into the work dir by
/// basename, so relative glob patterns resolve without the tool needing
/// absolute paths (spec.md §4.5 "Pre-execution").
async fn stage_inputs(inputs: &HashMap<String, CwlValue>, work_dir: &Path) -> std::io::Result<()> {
    for value in inputs.values() {
        stage_value(value, work_dir).await?;
    }
    Ok(())
}

fn stage_value<'a>(value: &'a CwlValue, work_dir: &'a Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        match value {
            CwlValue::File(f) => {
                if let (Some(path), Some(basename)) = (&f.path, &f.basename) {
                    symlink_into(Path::new(path), work_dir, basename).await?;
                }
                for sec in &f.secondary_files {
                    stage_value(sec, work_dir).await?;
                }
            }
            CwlValue::Directory(d) => {
                if let (Some(path), Some(basename)) = (&d.path, &d.basename) {
                    symlink_into(Path::new(path), work_dir, basename).await?;
                }
            }
            CwlValue::Array(items) => {
                for item in items {
                    stage_value(item, work_dir).await?;
                }
            }
            _ => {}
        }
        Ok(())
    })
}

async fn symlink_into(source: &Path, work_dir: &Path, basename: &str) -> std::io::Result<()> {
    let dest = work_dir.join(basename);
    if dest == source || tokio::fs::symlink_metadata(&dest).await.is_ok() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        tokio::fs::symlink(source, &dest).await
    }
    #[cfg(not(unix))]
    {
        tokio::fs::copy(source, &dest).await.map(|_| ())
    }
}

/// Materialize `InitialWorkDirRequirement` entries: writable dirents are
/// copied so the tool can mutate them; non-writable ones are symlinked
/// (spec.md §4.5 "Pre-execution").
async fn materialize_initial_work_dir(
    tool: &NormalizedTool,
    inputs: &HashMap<String, CwlValue>,
    work_dir: &Path,
    evaluator: &crate::expr::Evaluator,
) -> std::io::Result<()> {
    let inputs_json = serde_json::Value::Object(
        inputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
    );
    for dirent in &tool.requirements.initial_work_dir {
        let ctx = EvalContext::new(inputs_json.clone(), Value::Null, Value::Null);
        let entry_text = if crate::expr::Evaluator::has_expression(&dirent.entry) {
            evaluator
                .interpolate(&dirent.entry, &ctx)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        } else {
            dirent.entry.clone()
        };
        let name = dirent
            .entryname
            .clone()
            .unwrap_or_else(|| format!("entry-{}", Uuid::now_v7()));
        let dest = work_dir.join(&name);
        tokio::fs::write(&dest, entry_text).await?;
    }
    Ok(())
}

/// Read and track the peak RSS of a child process in the background until
/// it exits (spec.md §4.5 "Compute peak memory from OS-level usage").
fn track_peak_memory(pid: Option<u32>) -> Arc<AtomicU64> {
    let peak = Arc::new(AtomicU64::new(0));
    let Some(pid) = pid else {
        return peak;
    };
    let peak_writer = Arc::clone(&peak);
    tokio::task::spawn_blocking(move || {
        let pid = Pid::from_u32(pid);
        let mut system = System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::everything()));
        loop {
            system.refresh_processes_specifics(sysinfo::ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::everything());
            let Some(process) = system.process(pid) else {
                break;
            };
            let rss_mb = process.memory() / (1024 * 1024);
            let mut current = peak_writer.load(Ordering::Relaxed);
            while rss_mb > current {
                match peak_writer.compare_exchange_weak(current, rss_mb, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    });
    peak
}

/// Output collection (spec.md §4.5 "Post-execution"). If `cwl.output.json`
/// is present it is the complete output object; otherwise each declared
/// output is collected independently by stdout/stderr capture, glob, or
/// `outputEval`.
async fn collect_outputs(
    tool: &NormalizedTool,
    work_dir: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
    exit_code: i32,
    evaluator: &crate::expr::Evaluator,
) -> Result<HashMap<String, CwlValue>, String> {
    let cwl_output_json = work_dir.join("cwl.output.json");
    if tokio::fs::try_exists(&cwl_output_json).await.unwrap_or(false) {
        let text = tokio::fs::read_to_string(&cwl_output_json).await.map_err(|e| e.to_string())?;
        let parsed: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        let Value::Object(map) = parsed else {
            return Err("cwl.output.json did not contain an object".to_string());
        };
        let mut outputs = HashMap::new();
        for (id, value) in map {
            outputs.insert(id, enrich_value(CwlValue::from_json(value), work_dir).await?);
        }
        return Ok(outputs);
    }

    let mut outputs = HashMap::new();
    for output in &tool.outputs {
        let value = collect_single_output(output, work_dir, stdout_path, stderr_path, exit_code, evaluator).await?;
        outputs.insert(output.id.clone(), value);
    }
    Ok(outputs)
}

async fn collect_single_output(
    output: &ToolOutput,
    work_dir: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
    exit_code: i32,
    evaluator: &crate::expr::Evaluator,
) -> Result<CwlValue, String> {
    if output.type_str.trim_end_matches('?') == "stdout" {
        return Ok(CwlValue::File(build_file_value(stdout_path).await?));
    }
    if output.type_str.trim_end_matches('?') == "stderr" {
        return Ok(CwlValue::File(build_file_value(stderr_path).await?));
    }

    let mut collected = if let Some(glob) = &output.glob {
        collect_glob(glob, work_dir).await?
    } else {
        CwlValue::Null
    };

    if let Some(output_eval) = &output.output_eval {
        let ctx = EvalContext::new(
            Value::Null,
            collected.to_json(),
            serde_json::json!({ "outdir": work_dir.to_string_lossy(), "exitCode": exit_code }),
        );
        let result = evaluator.interpolate(output_eval, &ctx).map_err(|e| e.to_string())?;
        collected = CwlValue::from_json(result);
    }

    if !output.secondary_files.is_empty() {
        attach_secondary_files(&mut collected, &output.secondary_files, work_dir, evaluator).await?;
    }

    Ok(collected)
}

async fn collect_glob(glob_value: &Value, work_dir: &Path) -> Result<CwlValue, String> {
    let patterns: Vec<String> = match glob_value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    };

    let mut matches = Vec::new();
    for pattern in &patterns {
        let full_pattern = work_dir.join(pattern);
        let pattern_str = full_pattern.to_string_lossy().to_string();
        let paths = glob::glob(&pattern_str).map_err(|e| e.to_string())?;
        for entry in paths {
            let path = entry.map_err(|e| e.to_string())?;
            if path.is_dir() {
                matches.push(CwlValue::Directory(build_directory_value(&path).await?));
            } else {
                matches.push(CwlValue::File(build_file_value(&path).await?));
            }
        }
    }

    match matches.len() {
        0 => Ok(CwlValue::Null),
        1 => Ok(matches.into_iter().next().unwrap()),
        _ => Ok(CwlValue::Array(matches)),
    }
}

/// Companion-file resolution (spec.md §4.5 "secondaryFiles"): a leading
/// `^` strips one extension from the primary's basename before appending
/// the rest of the pattern literally.
async fn attach_secondary_files(
    value: &mut CwlValue,
    patterns: &[SecondaryFilePattern],
    work_dir: &Path,
    evaluator: &crate::expr::Evaluator,
) -> Result<(), String> {
    let CwlValue::File(file) = value else {
        return Ok(());
    };
    let Some(basename) = file.basename.clone() else {
        return Ok(());
    };

    for pattern in patterns {
        let resolved = resolve_secondary_pattern(&pattern.pattern, &basename, file, evaluator);
        let candidate = work_dir.join(&resolved);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            file.secondary_files.push(CwlValue::File(build_file_value(&candidate).await?));
        } else if pattern.required {
            return Err(format!("required secondary file {resolved} not found alongside {basename}"));
        }
    }
    Ok(())
}

fn resolve_secondary_pattern(pattern: &str, basename: &str, file: &FileValue, evaluator: &crate::expr::Evaluator) -> String {
    if crate::expr::Evaluator::has_expression(pattern) {
        let ctx = EvalContext::new(Value::Null, serde_json::to_value(file).unwrap_or(Value::Null), Value::Null);
        if let Ok(result) = evaluator.interpolate(pattern, &ctx) {
            if let Some(s) = result.as_str() {
                return s.to_string();
            }
        }
    }

    let mut stem = basename.to_string();
    let mut suffix = pattern;
    while let Some(rest) = suffix.strip_prefix('^') {
        if let Some(idx) = stem.rfind('.') {
            stem.truncate(idx);
        }
        suffix = rest;
    }
    format!("{stem}{suffix}")
}

async fn enrich_value(value: CwlValue, work_dir: &Path) -> Result<CwlValue, String> {
    match value {
        CwlValue::File(mut f) => {
            let path = resolve_against(&f.path, work_dir);
            if let Some(path) = &path {
                let built = build_file_value(path).await?;
                if f.basename.is_none() {
                    f.basename = built.basename;
                }
                f.path = Some(path.to_string_lossy().to_string());
                f.size = f.size.or(built.size);
                f.checksum = f.checksum.or(built.checksum);
                f.nameroot = f.nameroot.or(built.nameroot);
                f.nameext = f.nameext.or(built.nameext);
                f.dirname = f.dirname.or(built.dirname);
            }
            let mut secondary = Vec::with_capacity(f.secondary_files.len());
            for sec in f.secondary_files {
                secondary.push(Box::pin(enrich_value(sec, work_dir)).await?);
            }
            f.secondary_files = secondary;
            Ok(CwlValue::File(f))
        }
        CwlValue::Directory(mut d) => {
            if let Some(path) = resolve_against(&d.path, work_dir) {
                d.path = Some(path.to_string_lossy().to_string());
            }
            Ok(CwlValue::Directory(d))
        }
        CwlValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(enrich_value(item, work_dir)).await?);
            }
            Ok(CwlValue::Array(out))
        }
        other => Ok(other),
    }
}

fn resolve_against(path: &Option<String>, work_dir: &Path) -> Option<PathBuf> {
    let path = path.as_ref()?;
    let p = Path::new(path);
    Some(if p.is_absolute() { p.to_path_buf() } else { work_dir.join(p) })
}

async fn build_file_value(path: &Path) -> Result<FileValue, String> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| e.to_string())?;
    let mut file = FileValue::from_path(path.to_string_lossy().to_string());
    file.size = Some(metadata.len());
    file.checksum = Some(sha1_checksum(path).await?);
    Ok(file)
}

async fn build_directory_value(path: &Path) -> Result<DirectoryValue, String> {
    let mut dir = DirectoryValue::from_path(path.to_string_lossy().to_string());
    let mut entries = tokio::fs::read_dir(path).await.map_err(|e| e.to_string())?;
    let mut listing = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            listing.push(CwlValue::Directory(Box::pin(build_directory_value(&entry_path)).await?));
        } else {
            listing.push(CwlValue::File(build_file_value(&entry_path).await?));
        }
    }
    dir.listing = listing;
    Ok(dir)
}

async fn sha1_checksum(path: &Path) -> Result<String, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    Ok(format!("sha1${}", hex::encode(hasher.finalize())))
}

/// Read a file's contents for `loadContents`, failing if it exceeds the
/// 64 KiB cap (spec.md §4.5 "File metadata").
pub async fn load_contents(path: &Path) -> Result<String, String> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| e.to_string())?;
    if metadata.len() > LOAD_CONTENTS_LIMIT {
        return Err(format!("{} exceeds loadContents limit of {LOAD_CONTENTS_LIMIT} bytes", path.display()));
    }
    tokio::fs::read_to_string(path).await.map_err(|e| e.to_string())
}
