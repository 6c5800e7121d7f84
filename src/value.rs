//! The CWL value model: Files, Directories, dynamically-typed tool values,
//! and the Workflow / Step / Submission / Task / Worker entities tracked by
//! the [`crate::store::Store`].
//!
//! The CWL type system is dynamic — a field's static "type" is a string
//! (`"File"`, `"string?"`, `"File[]"`, ...), and values flow through the
//! engine as a tagged union. [`CwlValue`] is that union; it is projected
//! into Rust's static types only at the command-builder boundary (§4.4).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A dynamically-typed CWL value: the thing that flows between step inputs,
/// outputs, expression contexts, and command-line bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CwlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    File(FileValue),
    Directory(DirectoryValue),
    Array(Vec<CwlValue>),
    Record(HashMap<String, CwlValue>),
}

impl CwlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CwlValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CwlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CwlValue]> {
        match self {
            CwlValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileValue> {
        match self {
            CwlValue::File(f) => Some(f),
            _ => None,
        }
    }

    /// Stringification per spec.md §4.3: null renders as the literal string
    /// `"null"`, numbers in fixed-point, Files/Directories to their `path`,
    /// everything else to compact JSON.
    pub fn to_expr_string(&self) -> String {
        match self {
            CwlValue::Null => "null".to_string(),
            CwlValue::Bool(b) => b.to_string(),
            CwlValue::Int(i) => i.to_string(),
            CwlValue::Float(f) => format_fixed_point(*f),
            CwlValue::String(s) => s.clone(),
            CwlValue::File(file) => file.path.clone().unwrap_or_default(),
            CwlValue::Directory(dir) => dir.path.clone().unwrap_or_default(),
            CwlValue::Array(_) | CwlValue::Record(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// Convert to a `serde_json::Value` for handing to the expression
    /// engine or the JSON output surface (§6.4).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or(CwlValue::Null)
    }
}

/// Render a float without scientific notation, trimming trailing zeros but
/// keeping at least one fractional digit for non-integral values.
fn format_fixed_point(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        let s = format!("{f:.12}");
        let trimmed = s.trim_end_matches('0');
        let trimmed = trimmed.trim_end_matches('.');
        trimmed.to_string()
    }
}

/// A File value per spec.md §3.1 / §6.4.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileValue {
    #[serde(default = "file_class")]
    pub class: String,
    pub location: Option<String>,
    pub path: Option<String>,
    pub basename: Option<String>,
    pub dirname: Option<String>,
    pub nameroot: Option<String>,
    pub nameext: Option<String>,
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub format: Option<String>,
    #[serde(default)]
    pub secondary_files: Vec<CwlValue>,
}

fn file_class() -> String {
    "File".to_string()
}

impl FileValue {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let mut file = Self {
            class: "File".to_string(),
            path: Some(path),
            ..Default::default()
        };
        file.derive_metadata();
        file
    }

    /// Derive `basename`/`nameroot`/`nameext` from `path`, enforcing the
    /// invariant in spec.md §3.2: `nameroot + nameext == basename`, and
    /// `nameext` is empty or starts with `.`.
    pub fn derive_metadata(&mut self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let p = std::path::Path::new(&path);
        let basename = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let dirname = p
            .parent()
            .map(|d| d.to_string_lossy().to_string())
            .unwrap_or_default();
        let (nameroot, nameext) = split_ext(&basename);
        self.basename.get_or_insert(basename);
        self.dirname.get_or_insert(dirname);
        self.nameroot.get_or_insert(nameroot);
        self.nameext.get_or_insert(nameext);
    }
}

fn split_ext(basename: &str) -> (String, String) {
    match basename.rfind('.') {
        Some(idx) if idx > 0 => (
            basename[..idx].to_string(),
            basename[idx..].to_string(),
        ),
        _ => (basename.to_string(), String::new()),
    }
}

/// A Directory value per spec.md §3.1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryValue {
    #[serde(default = "directory_class")]
    pub class: String,
    pub location: Option<String>,
    pub path: Option<String>,
    pub basename: Option<String>,
    #[serde(default)]
    pub listing: Vec<CwlValue>,
}

fn directory_class() -> String {
    "Directory".to_string()
}

impl DirectoryValue {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let basename = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        Self {
            class: "Directory".to_string(),
            path: Some(path),
            basename,
            listing: Vec::new(),
        }
    }
}

/// A typed parameter (workflow input/output, or a tool input/output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    pub id: String,
    /// Normalized type string, e.g. `"File"`, `"string?"`, `"File[]"`.
    pub type_str: String,
    pub required: bool,
    pub default: Option<CwlValue>,
    pub secondary_files: Vec<String>,
    pub format: Option<String>,
    pub load_contents: bool,
    /// The raw `inputBinding`, if this param came from a `CommandLineTool`
    /// input. `None` for workflow-level params and outputs, which have no
    /// command-line placement.
    pub binding: Option<ParamBinding>,
}

/// A tool input's `inputBinding` (spec.md §4.4), carried through from the
/// parser so the executor can build argv without re-reading raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamBinding {
    pub position: i64,
    pub prefix: Option<String>,
    pub separate: bool,
    pub shell_quote: bool,
    pub item_separator: Option<String>,
    pub value_from: Option<String>,
}

/// How a step output is sourced, and how multiple sources merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSource {
    pub sources: Vec<String>,
    pub link_merge: LinkMerge,
    pub pick_value: Option<PickValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMerge {
    MergeNested,
    MergeFlattened,
}

impl Default for LinkMerge {
    fn default() -> Self {
        Self::MergeNested
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickValue {
    FirstNonNull,
    TheOnlyNonNull,
    AllNonNull,
}

/// Scatter method per spec.md §4.7.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterMethod {
    Dotproduct,
    NestedCrossproduct,
    FlatCrossproduct,
}

/// A workflow-step input binding: where its value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub id: String,
    pub sources: Vec<String>,
    pub link_merge: LinkMerge,
    pub pick_value: Option<PickValue>,
    pub default: Option<CwlValue>,
    pub value_from: Option<String>,
}

/// A step's declared output name (the full id is `<step_id>/<output_id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub id: String,
}

/// A node in a workflow's DAG (spec.md §3.1 Step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    /// `$graph` fragment id of the tool/sub-workflow this step runs.
    pub run: String,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<StepOutput>,
    pub scatter: Vec<String>,
    pub scatter_method: Option<ScatterMethod>,
    pub when: Option<String>,
    pub depends_on: Vec<String>,
}

/// The class of a packed `$graph` process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ProcessClass {
    Workflow,
    CommandLineTool,
    ExpressionTool,
}

/// An immutable parsed workflow definition (spec.md §3.1 Workflow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    /// SHA-256 of the canonicalized packed document, used for dedup.
    pub content_hash: String,
    pub cwl_version: String,
    pub class: ProcessClass,
    pub inputs: Vec<ParamDef>,
    pub outputs: HashMap<String, OutputSource>,
    pub steps: Vec<Step>,
}

/// Submission lifecycle state (spec.md §3.1 / §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// An execution instance of a workflow (spec.md §3.1 Submission).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: Uuid,
    pub workflow_id: Uuid,
    pub inputs: HashMap<String, CwlValue>,
    pub outputs: HashMap<String, CwlValue>,
    pub state: SubmissionState,
    pub cancel_requested: bool,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<crate::error::ErrorSummary>,
}

/// Task lifecycle state (spec.md §3.1 / §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
    Queued,
    Running,
    Success,
    Failed,
    Retrying,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Which implementation the executor registry (§4.9) routes a task to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    Local,
    Container,
    Worker,
    External,
}

/// Resolved runtime hints attached to a task at schedule time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeHints {
    pub docker_image: Option<String>,
    pub cores: Option<u32>,
    pub ram_mb: Option<u64>,
    pub namespaces: HashMap<String, String>,
    pub expression_lib: Vec<String>,
    pub temporary_fail_codes: Vec<i32>,
    pub success_codes: Vec<i32>,
}

/// A concrete schedulable unit: one per non-scattered step, or one per
/// scatter element (spec.md §3.1 Task).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub submission_id: Uuid,
    pub step_id: String,
    pub state: TaskState,
    pub executor_type: Option<ExecutorType>,
    pub inputs: HashMap<String, CwlValue>,
    pub runtime_hints: RuntimeHints,
    pub outputs: HashMap<String, CwlValue>,
    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,
    pub exit_code: Option<i32>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub depends_on: Vec<Uuid>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<crate::error::ErrorSummary>,
}

impl Task {
    pub fn new(submission_id: Uuid, step_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::now_v7(),
            submission_id,
            step_id: step_id.into(),
            state: TaskState::Pending,
            executor_type: None,
            inputs: HashMap::new(),
            runtime_hints: RuntimeHints::default(),
            outputs: HashMap::new(),
            stdout_ref: None,
            stderr_ref: None,
            exit_code: None,
            retry_count: 0,
            max_retries: 0,
            depends_on: Vec::new(),
            worker_id: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// Worker connectivity state (spec.md §3.1 Worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Online,
    Draining,
    Offline,
}

/// A remote compute instance registered via the worker protocol (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub name: String,
    pub hostname: String,
    pub state: WorkerState,
    pub container_runtime: Option<String>,
    pub labels: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
    pub current_task: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_metadata_derivation() {
        let file = FileValue::from_path("/work/out/alignment.bam");
        assert_eq!(file.basename.as_deref(), Some("alignment.bam"));
        assert_eq!(file.nameroot.as_deref(), Some("alignment"));
        assert_eq!(file.nameext.as_deref(), Some(".bam"));
        assert_eq!(file.dirname.as_deref(), Some("/work/out"));
    }

    #[test]
    fn file_metadata_no_extension() {
        let file = FileValue::from_path("/work/README");
        assert_eq!(file.basename.as_deref(), Some("README"));
        assert_eq!(file.nameroot.as_deref(), Some("README"));
        assert_eq!(file.nameext.as_deref(), Some(""));
    }

    #[test]
    fn expr_string_null_is_literal() {
        assert_eq!(CwlValue::Null.to_expr_string(), "null");
    }

    #[test]
    fn expr_string_fixed_point() {
        assert_eq!(CwlValue::Float(1.5).to_expr_string(), "1.5");
        assert_eq!(CwlValue::Float(3.0).to_expr_string(), "3");
        assert_eq!(CwlValue::Int(12).to_expr_string(), "12");
    }

    #[test]
    fn expr_string_file_renders_path() {
        let file = CwlValue::File(FileValue::from_path("/a/b.txt"));
        assert_eq!(file.to_expr_string(), "/a/b.txt");
    }

    #[test]
    fn task_state_terminal() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
    }
}
