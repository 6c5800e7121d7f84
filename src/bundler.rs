//! Bundler (C2): resolves `$import` and external `run:` references into a
//! single packed `$graph` document with stable fragment ids.
//!
//! Operates on `serde_json::Value` as its document representation — callers
//! hand the bundler a parsed YAML-or-JSON tree plus the directory it was
//! loaded from, so relative `$import`/`run:` targets resolve against the
//! right base. [`FsLoader`] reads CWL documents and job files from disk,
//! accepting either YAML or JSON per spec.md §4.1/§6.2.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{ClassifiedError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("invalid workflow document: {0}")]
    InvalidWorkflow(String),

    #[error("missing referenced tool: {0}")]
    MissingReference(String),

    #[error("unknown root class: {0}")]
    UnknownClass(String),

    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed yaml/json: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("malformed yaml: {0}")]
    MalformedYaml(#[from] serde_yaml::Error),
}

impl ClassifiedError for BundleError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidWorkflow
    }

    fn retryable(&self) -> bool {
        false
    }
}

/// A packed document: `cwlVersion` plus a `$graph` array of processes keyed
/// by their stable fragment id, and the selector extracted from a trailing
/// `#fragment` on the input path, if any.
#[derive(Debug, Clone)]
pub struct PackedDocument {
    pub cwl_version: String,
    /// Ordered by first-insertion so bundling is deterministic.
    pub graph: BTreeMap<String, Value>,
    pub selector: Option<String>,
}

impl PackedDocument {
    /// Re-serialize to the `{cwlVersion, $graph}` JSON shape described in
    /// spec.md §6.1.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("cwlVersion".into(), Value::String(self.cwl_version.clone()));
        let graph: Vec<Value> = self.graph.values().cloned().collect();
        obj.insert("$graph".into(), Value::Array(graph));
        Value::Object(obj)
    }
}

/// A loader abstraction so the bundler can be tested without touching the
/// filesystem: production code reads from disk, tests hand in an in-memory
/// map of path -> document text.
pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Value, BundleError>;
}

pub struct FsLoader;

impl DocumentLoader for FsLoader {
    fn load(&self, path: &Path) -> Result<Value, BundleError> {
        let text = std::fs::read_to_string(path).map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        parse_yaml_or_json(&text)
    }
}

/// Parse on-disk CWL documents and job files, which spec.md §4.1/§6.2
/// allow as either YAML or JSON. JSON is tried first since it's the
/// common case for packed documents this engine re-emits, and is
/// strictly faster than going through the YAML parser; anything that
/// doesn't parse as JSON falls back to YAML (a superset that also
/// accepts plain JSON, but with worse error messages on this path).
fn parse_yaml_or_json(text: &str) -> Result<Value, BundleError> {
    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(text)?;
    Ok(serde_json::to_value(yaml_value).map_err(BundleError::from)?)
}

/// Bundle a document already loaded into a `serde_json::Value`, given the
/// base directory other relative references resolve against.
pub fn bundle_value(doc: Value, base_dir: &Path, loader: &dyn DocumentLoader) -> Result<PackedDocument, BundleError> {
    let obj = doc
        .as_object()
        .ok_or_else(|| BundleError::InvalidWorkflow("document root is not an object".into()))?;

    let cwl_version = obj
        .get("cwlVersion")
        .and_then(Value::as_str)
        .unwrap_or("v1.2")
        .to_string();

    let mut graph = BTreeMap::new();

    if let Some(Value::Array(processes)) = obj.get("$graph") {
        for process in processes {
            let resolved = resolve_imports(process.clone(), base_dir, loader)?;
            let id = process_id(&resolved)?;
            let resolved = resolve_locations(resolved, base_dir);
            graph.insert(id, resolved);
        }
        return Ok(PackedDocument {
            cwl_version,
            graph,
            selector: None,
        });
    }

    let class = obj
        .get("class")
        .and_then(Value::as_str)
        .ok_or_else(|| BundleError::UnknownClass("<missing class>".into()))?
        .to_string();

    match class.as_str() {
        "CommandLineTool" | "ExpressionTool" => {
            let tool_id = "main".to_string();
            let mut tool = doc.clone();
            set_id(&mut tool, &tool_id);
            let tool = resolve_locations(resolve_imports(tool, base_dir, loader)?, base_dir);

            let wf_id = "wrapper".to_string();
            let workflow = synthesize_wrapper_workflow(&wf_id, &tool_id, &tool);

            graph.insert(tool_id, tool);
            graph.insert(wf_id, workflow);
            Ok(PackedDocument {
                cwl_version,
                graph,
                selector: None,
            })
        }
        "Workflow" => {
            let wf_id = "main".to_string();
            let mut workflow = doc.clone();
            set_id(&mut workflow, &wf_id);
            let mut workflow = resolve_imports(workflow, base_dir, loader)?;
            inline_step_runs(&mut workflow, base_dir, loader, &mut graph)?;
            let workflow = resolve_locations(workflow, base_dir);
            graph.insert(wf_id, workflow);
            Ok(PackedDocument {
                cwl_version,
                graph,
                selector: None,
            })
        }
        other => Err(BundleError::UnknownClass(other.to_string())),
    }
}

pub fn bundle_path(path: &Path, loader: &dyn DocumentLoader) -> Result<PackedDocument, BundleError> {
    let (file_path, selector) = split_selector(path);
    let base_dir = file_path.parent().unwrap_or_else(|| Path::new("."));
    let doc = loader.load(&file_path)?;
    let mut packed = bundle_value(doc, base_dir, loader)?;
    packed.selector = selector;
    Ok(packed)
}

fn split_selector(path: &Path) -> (PathBuf, Option<String>) {
    let s = path.to_string_lossy();
    match s.split_once('#') {
        Some((file, frag)) => (PathBuf::from(file), Some(frag.to_string())),
        None => (path.to_path_buf(), None),
    }
}

fn process_id(process: &Value) -> Result<String, BundleError> {
    let id = process
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| BundleError::InvalidWorkflow("process missing id".into()))?;
    Ok(local_fragment(id))
}

/// Strip a leading `#` and any prefix up to the last `/`, matching the
/// parser's id-normalization rule (spec.md §4.2).
pub fn local_fragment(id: &str) -> String {
    let id = id.strip_prefix('#').unwrap_or(id);
    match id.rsplit_once('/') {
        Some((_, last)) => last.to_string(),
        None => id.to_string(),
    }
}

fn set_id(doc: &mut Value, id: &str) {
    if let Value::Object(obj) = doc {
        obj.insert("id".into(), Value::String(id.to_string()));
    }
}

/// Recursively resolve `$import` keys anywhere in the document.
fn resolve_imports(doc: Value, base_dir: &Path, loader: &dyn DocumentLoader) -> Result<Value, BundleError> {
    match doc {
        Value::Object(obj) => {
            if let Some(Value::String(import_path)) = obj.get("$import") {
                let resolved_path = base_dir.join(import_path);
                let imported = loader.load(&resolved_path)?;
                let next_base = resolved_path.parent().unwrap_or(base_dir);
                return resolve_imports(imported, next_base, loader);
            }
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k, resolve_imports(v, base_dir, loader)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_imports(item, base_dir, loader)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other),
    }
}

/// Walk every step's `run:`; inline non-fragment references into `$graph`
/// and rewrite `run:` to the fragment id, per spec.md §4.1.
fn inline_step_runs(
    workflow: &mut Value,
    base_dir: &Path,
    loader: &dyn DocumentLoader,
    graph: &mut BTreeMap<String, Value>,
) -> Result<(), BundleError> {
    let Some(obj) = workflow.as_object_mut() else {
        return Ok(());
    };
    let Some(Value::Array(steps)) = obj.get_mut("steps") else {
        return Ok(());
    };

    for step in steps.iter_mut() {
        let Some(step_obj) = step.as_object_mut() else {
            continue;
        };
        let Some(run) = step_obj.get("run").cloned() else {
            continue;
        };

        match run {
            Value::String(run_ref) if run_ref.starts_with('#') => {
                // Already a fragment reference; nothing to inline.
            }
            Value::String(run_path) => {
                let resolved_path = base_dir.join(&run_path);
                let frag_id = resolved_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .ok_or_else(|| BundleError::MissingReference(run_path.clone()))?;

                if !graph.contains_key(&frag_id) {
                    let mut tool_doc = loader.load(&resolved_path)?;
                    strip_cwl_version(&mut tool_doc);
                    set_id(&mut tool_doc, &frag_id);
                    let next_base = resolved_path.parent().unwrap_or(base_dir);
                    let tool_doc = resolve_imports(tool_doc, next_base, loader)?;
                    let tool_doc = resolve_locations(tool_doc, next_base);
                    graph.insert(frag_id.clone(), tool_doc);
                }
                step_obj.insert("run".into(), Value::String(format!("#{frag_id}")));
            }
            Value::Object(_) => {
                // Inline tool definition: assign it a fragment id derived
                // from the step id and hoist it into $graph.
                let step_id = step_obj
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("step")
                    .to_string();
                let frag_id = format!("{step_id}_tool");
                let mut tool_doc = run;
                set_id(&mut tool_doc, &frag_id);
                let tool_doc = resolve_imports(tool_doc, base_dir, loader)?;
                let tool_doc = resolve_locations(tool_doc, base_dir);
                graph.insert(frag_id.clone(), tool_doc);
                step_obj.insert("run".into(), Value::String(format!("#{frag_id}")));
            }
            _ => {}
        }
    }
    Ok(())
}

fn strip_cwl_version(doc: &mut Value) {
    if let Value::Object(obj) = doc {
        obj.remove("cwlVersion");
    }
}

/// Build the single-step wrapper workflow for a bare tool document
/// (spec.md §4.1 "bare CommandLineTool or ExpressionTool").
fn synthesize_wrapper_workflow(wf_id: &str, tool_id: &str, tool: &Value) -> Value {
    let inputs = tool.get("inputs").cloned().unwrap_or(Value::Array(vec![]));
    let outputs = tool.get("outputs").cloned().unwrap_or(Value::Array(vec![]));

    let step_inputs: Vec<Value> = as_id_list(&inputs)
        .into_iter()
        .map(|id| {
            let mut m = Map::new();
            m.insert("id".into(), Value::String(id.clone()));
            m.insert("source".into(), Value::String(id));
            Value::Object(m)
        })
        .collect();

    let step_outputs: Vec<Value> = as_id_list(&outputs)
        .into_iter()
        .map(Value::String)
        .collect();

    let wf_outputs: Vec<Value> = as_id_list(&outputs)
        .into_iter()
        .map(|id| {
            let mut m = Map::new();
            m.insert("id".into(), Value::String(id.clone()));
            m.insert(
                "outputSource".into(),
                Value::String(format!("wrap/{id}")),
            );
            Value::Object(m)
        })
        .collect();

    let mut step = Map::new();
    step.insert("id".into(), Value::String("wrap".into()));
    step.insert("run".into(), Value::String(format!("#{tool_id}")));
    step.insert("in".into(), Value::Array(step_inputs));
    step.insert("out".into(), Value::Array(step_outputs));

    let mut wf = Map::new();
    wf.insert("id".into(), Value::String(wf_id.to_string()));
    wf.insert("class".into(), Value::String("Workflow".into()));
    wf.insert("inputs".into(), inputs);
    wf.insert("outputs".into(), Value::Array(wf_outputs));
    wf.insert("steps".into(), Value::Array(vec![Value::Object(step)]));
    Value::Object(wf)
}

fn as_id_list(params: &Value) -> Vec<String> {
    match params {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("id").and_then(Value::as_str))
            .map(local_fragment_str)
            .collect(),
        Value::Object(map) => map.keys().map(|k| local_fragment(k)).collect(),
        _ => Vec::new(),
    }
}

fn local_fragment_str(s: &str) -> String {
    local_fragment(s)
}

/// Resolve every File/Directory `location`/`path` relative to `base_dir`
/// and derive basename/nameroot/nameext when absent, recursing through
/// `secondaryFiles` and `listing`.
fn resolve_locations(doc: Value, base_dir: &Path) -> Value {
    match doc {
        Value::Object(mut obj) => {
            let class = obj.get("class").and_then(Value::as_str).map(str::to_string);
            if class.as_deref() == Some("File") {
                resolve_file_object(&mut obj, base_dir);
            } else if class.as_deref() == Some("Directory") {
                resolve_directory_object(&mut obj, base_dir);
            }
            let resolved: Map<String, Value> = obj
                .into_iter()
                .map(|(k, v)| (k, resolve_locations(v, base_dir)))
                .collect();
            Value::Object(resolved)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| resolve_locations(v, base_dir)).collect())
        }
        other => other,
    }
}

fn resolve_file_object(obj: &mut Map<String, Value>, base_dir: &Path) {
    let raw = obj
        .get("path")
        .and_then(Value::as_str)
        .or_else(|| obj.get("location").and_then(Value::as_str))
        .map(str::to_string);
    let Some(raw) = raw else { return };
    if has_scheme(&raw) {
        return;
    }
    let abs = base_dir.join(&raw);
    let abs_str = abs.to_string_lossy().to_string();
    obj.entry("path").or_insert_with(|| Value::String(abs_str.clone()));
    obj.entry("location")
        .or_insert_with(|| Value::String(format!("file://{abs_str}")));

    let basename = std::path::Path::new(&abs_str)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (nameroot, nameext) = match basename.rfind('.') {
        Some(idx) if idx > 0 => (basename[..idx].to_string(), basename[idx..].to_string()),
        _ => (basename.clone(), String::new()),
    };
    obj.entry("basename").or_insert_with(|| Value::String(basename));
    obj.entry("nameroot").or_insert_with(|| Value::String(nameroot));
    obj.entry("nameext").or_insert_with(|| Value::String(nameext));
}

fn resolve_directory_object(obj: &mut Map<String, Value>, base_dir: &Path) {
    let raw = obj
        .get("path")
        .and_then(Value::as_str)
        .or_else(|| obj.get("location").and_then(Value::as_str))
        .map(str::to_string);
    let Some(raw) = raw else { return };
    if has_scheme(&raw) {
        return;
    }
    let abs = base_dir.join(&raw);
    let abs_str = abs.to_string_lossy().to_string();
    obj.entry("path").or_insert_with(|| Value::String(abs_str.clone()));
    let basename = std::path::Path::new(&abs_str)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    obj.entry("basename").or_insert_with(|| Value::String(basename));
}

fn has_scheme(s: &str) -> bool {
    ["file://", "http://", "https://", "ws://", "shock://"]
        .iter()
        .any(|scheme| s.starts_with(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    struct MapLoader(RefCell<StdHashMap<PathBuf, String>>);

    impl DocumentLoader for MapLoader {
        fn load(&self, path: &Path) -> Result<Value, BundleError> {
            let map = self.0.borrow();
            let text = map
                .get(path)
                .or_else(|| map.get(&PathBuf::from(path.to_string_lossy().trim_start_matches("./"))))
                .unwrap_or_else(|| panic!("no fixture for {path:?}"));
            serde_json::from_str(text).map_err(BundleError::from)
        }
    }

    fn loader(files: &[(&str, &str)]) -> MapLoader {
        let mut map = StdHashMap::new();
        for (path, text) in files {
            map.insert(PathBuf::from(path), text.to_string());
        }
        MapLoader(RefCell::new(map))
    }

    #[test]
    fn bundle_bare_tool_synthesizes_wrapper_workflow() {
        let doc: Value = serde_json::from_str(
            r#"{"class":"CommandLineTool","cwlVersion":"v1.2","baseCommand":["echo"],
                "inputs":[{"id":"message","type":"string"}],
                "outputs":[{"id":"out","type":"stdout"}]}"#,
        )
        .unwrap();
        let l = loader(&[]);
        let packed = bundle_value(doc, Path::new("/wf"), &l).unwrap();
        assert!(packed.graph.contains_key("main"));
        assert!(packed.graph.contains_key("wrapper"));
        let wf = &packed.graph["wrapper"];
        assert_eq!(wf["class"], "Workflow");
        assert_eq!(wf["steps"][0]["run"], "#main");
    }

    #[test]
    fn bundle_workflow_inlines_external_tool_reference() {
        let tool_text = r#"{"class":"CommandLineTool","cwlVersion":"v1.2","baseCommand":["echo"],
            "inputs":[],"outputs":[]}"#;
        let wf_text = r#"{"class":"Workflow","cwlVersion":"v1.2",
            "inputs":[],"outputs":[],
            "steps":[{"id":"s1","run":"tool.cwl","in":[],"out":[]}]}"#;
        let doc: Value = serde_json::from_str(wf_text).unwrap();
        let l = loader(&[("/wf/tool.cwl", tool_text)]);
        let packed = bundle_value(doc, Path::new("/wf"), &l).unwrap();
        assert!(packed.graph.contains_key("tool"));
        let wf = &packed.graph["main"];
        assert_eq!(wf["steps"][0]["run"], "#tool");
    }

    #[test]
    fn bundle_deduplicates_identical_tool_references() {
        let tool_text = r#"{"class":"CommandLineTool","cwlVersion":"v1.2","baseCommand":["echo"],
            "inputs":[],"outputs":[]}"#;
        let wf_text = r#"{"class":"Workflow","cwlVersion":"v1.2",
            "inputs":[],"outputs":[],
            "steps":[
                {"id":"s1","run":"tool.cwl","in":[],"out":[]},
                {"id":"s2","run":"tool.cwl","in":[],"out":[]}
            ]}"#;
        let doc: Value = serde_json::from_str(wf_text).unwrap();
        let l = loader(&[("/wf/tool.cwl", tool_text)]);
        let packed = bundle_value(doc, Path::new("/wf"), &l).unwrap();
        assert_eq!(packed.graph.len(), 2);
    }

    #[test]
    fn bundle_round_trip_of_already_packed_document() {
        let text = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"main","class":"Workflow","inputs":[],"outputs":[],"steps":[]}
        ]}"#;
        let doc: Value = serde_json::from_str(text).unwrap();
        let l = loader(&[]);
        let packed = bundle_value(doc.clone(), Path::new("/wf"), &l).unwrap();
        let packed2 = bundle_value(packed.to_json(), Path::new("/wf"), &l).unwrap();
        assert_eq!(packed.graph.keys().collect::<Vec<_>>(), packed2.graph.keys().collect::<Vec<_>>());
    }

    #[test]
    fn local_fragment_strips_hash_and_prefix() {
        assert_eq!(local_fragment("#main"), "main");
        assert_eq!(local_fragment("main/output"), "output");
        assert_eq!(local_fragment("#wf/steps/s1/output"), "output");
    }

    #[test]
    fn parse_yaml_or_json_accepts_yaml_documents() {
        let yaml = "class: CommandLineTool\ncwlVersion: v1.2\nbaseCommand: [echo]\ninputs:\n  - id: message\n    type: string\noutputs:\n  - id: out\n    type: stdout\n";
        let value = parse_yaml_or_json(yaml).unwrap();
        assert_eq!(value.get("class").and_then(Value::as_str), Some("CommandLineTool"));
        assert_eq!(value.get("baseCommand").and_then(Value::as_array).map(Vec::len), Some(1));
    }

    #[test]
    fn parse_yaml_or_json_still_accepts_json() {
        let value = parse_yaml_or_json(r#"{"class":"Workflow","cwlVersion":"v1.2"}"#).unwrap();
        assert_eq!(value.get("class").and_then(Value::as_str), Some("Workflow"));
    }

    #[test]
    fn parse_yaml_or_json_rejects_garbage() {
        assert!(parse_yaml_or_json("not: [valid: yaml: here").is_err());
    }
}
