//! Parser / normalizer (C3): converts a packed `$graph` document (C2's
//! output) into typed [`crate::value`] structures, normalizing the several
//! array-vs-map and shorthand-vs-expanded forms CWL allows.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::bundler::{local_fragment, PackedDocument};
use crate::error::{ClassifiedError, ErrorKind};
use crate::value::{
    LinkMerge, OutputSource, ParamBinding, ParamDef, PickValue, ProcessClass, ScatterMethod, Step,
    StepInput, StepOutput, Workflow,
};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("field {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("unknown process class: {0}")]
    UnknownClass(String),

    #[error("fragment not found: {0}")]
    FragmentNotFound(String),
}

impl ClassifiedError for ParseError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidWorkflow
    }

    fn retryable(&self) -> bool {
        false
    }
}

/// A fully normalized representation of one packed document. Processes are
/// kept in a map owned by this struct, keyed by fragment id, so that
/// cyclic/self-referential `run:` fields never need back-pointers
/// (spec.md §9 "Cyclic data").
#[derive(Debug, Clone)]
pub struct GraphDocument {
    pub cwl_version: String,
    pub namespaces: HashMap<String, String>,
    pub workflow_fragment: String,
    pub tools: HashMap<String, NormalizedTool>,
    pub sub_workflows: HashMap<String, NormalizedWorkflow>,
}

impl GraphDocument {
    pub fn main_workflow(&self) -> Option<&NormalizedWorkflow> {
        self.sub_workflows.get(&self.workflow_fragment)
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedWorkflow {
    pub id: String,
    pub inputs: Vec<ParamDef>,
    pub outputs: HashMap<String, OutputSource>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct NormalizedTool {
    pub id: String,
    pub class: ProcessClass,
    pub base_command: Vec<String>,
    pub arguments: Vec<Value>,
    pub inputs: Vec<ParamDef>,
    pub outputs: Vec<ToolOutput>,
    pub requirements: RequirementsBag,
    pub hints: RequirementsBag,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub success_codes: Vec<i32>,
    pub temporary_fail_codes: Vec<i32>,
    pub expression: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub id: String,
    pub type_str: String,
    pub glob: Option<Value>,
    pub output_eval: Option<String>,
    pub secondary_files: Vec<SecondaryFilePattern>,
    pub format: Option<String>,
}

/// One `secondaryFiles` entry on a tool output (spec.md §4.5). A bare
/// string pattern ending in `?` is optional; everything else (a bare
/// string, or a `{pattern, required}` mapping with `required` omitted)
/// defaults to required, matching CWL's own default.
#[derive(Debug, Clone)]
pub struct SecondaryFilePattern {
    pub pattern: String,
    pub required: bool,
}

/// The typed bag of requirements/hints a tool can declare (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct RequirementsBag {
    pub shell_command: bool,
    pub docker: Option<DockerRequirement>,
    pub resource: Option<ResourceRequirement>,
    pub initial_work_dir: Vec<Dirent>,
    pub env_vars: HashMap<String, String>,
    pub inline_javascript: bool,
    pub expression_lib: Vec<String>,
    pub scatter_feature: bool,
    pub subworkflow_feature: bool,
    pub step_input_expression: bool,
    pub multiple_input_feature: bool,
    pub inplace_update: bool,
    pub load_listing: Option<String>,
    pub schema_defs: Vec<Value>,
    pub tool_time_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DockerRequirement {
    pub image: String,
    pub output_directory: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceRequirement {
    pub cores_min: Option<u32>,
    pub ram_min: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Dirent {
    pub entryname: Option<String>,
    pub entry: String,
    pub writable: bool,
}

/// Parse a packed document into a [`GraphDocument`].
pub fn parse(packed: &PackedDocument) -> Result<GraphDocument, ParseError> {
    let mut tools = HashMap::new();
    let mut sub_workflows = HashMap::new();

    for (id, process) in &packed.graph {
        let class = process
            .get("class")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Invalid {
                field: format!("{id}.class"),
                message: "missing class".into(),
            })?;
        match class {
            "Workflow" => {
                sub_workflows.insert(id.clone(), parse_workflow(id, process)?);
            }
            "CommandLineTool" | "ExpressionTool" => {
                tools.insert(id.clone(), parse_tool(id, process, class)?);
            }
            other => return Err(ParseError::UnknownClass(other.to_string())),
        }
    }

    let workflow_fragment = packed
        .selector
        .clone()
        .or_else(|| sub_workflows.keys().next().cloned())
        .ok_or_else(|| ParseError::Invalid {
            field: "$graph".into(),
            message: "no workflow process found".into(),
        })?;

    Ok(GraphDocument {
        cwl_version: packed.cwl_version.clone(),
        namespaces: HashMap::new(),
        workflow_fragment,
        tools,
        sub_workflows,
    })
}

/// Normalize a `Workflow` process: inputs/outputs array-vs-map, steps, and
/// `depends_on` derivation from source references (spec.md §4.2, §4.7.3).
fn parse_workflow(id: &str, process: &Value) -> Result<NormalizedWorkflow, ParseError> {
    let inputs = normalize_params(process.get("inputs"))?;
    let outputs = parse_workflow_outputs(process.get("outputs"))?;
    let steps = parse_steps(process.get("steps"))?;
    Ok(NormalizedWorkflow {
        id: id.to_string(),
        inputs,
        outputs,
        steps,
    })
}

fn parse_workflow_outputs(value: Option<&Value>) -> Result<HashMap<String, OutputSource>, ParseError> {
    let mut out = HashMap::new();
    for entry in as_entry_list(value) {
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(local_fragment)
            .ok_or_else(|| ParseError::Invalid {
                field: "outputs[].id".into(),
                message: "missing id".into(),
            })?;
        let sources = match entry.get("outputSource") {
            Some(Value::String(s)) => vec![local_fragment(s)],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(local_fragment)
                .collect(),
            _ => Vec::new(),
        };
        let link_merge = match entry.get("linkMerge").and_then(Value::as_str) {
            Some("merge_flattened") => LinkMerge::MergeFlattened,
            _ => LinkMerge::MergeNested,
        };
        let pick_value = match entry.get("pickValue").and_then(Value::as_str) {
            Some("first_non_null") => Some(PickValue::FirstNonNull),
            Some("the_only_non_null") => Some(PickValue::TheOnlyNonNull),
            Some("all_non_null") => Some(PickValue::AllNonNull),
            _ => None,
        };
        out.insert(
            id,
            OutputSource {
                sources,
                link_merge,
                pick_value,
            },
        );
    }
    Ok(out)
}

fn parse_steps(value: Option<&Value>) -> Result<Vec<Step>, ParseError> {
    let mut steps = Vec::new();
    for entry in as_entry_list(value) {
        let step_id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(local_fragment)
            .ok_or_else(|| ParseError::Invalid {
                field: "steps[].id".into(),
                message: "missing id".into(),
            })?;
        let run = entry
            .get("run")
            .and_then(Value::as_str)
            .map(|s| s.trim_start_matches('#').to_string())
            .ok_or_else(|| ParseError::Invalid {
                field: format!("{step_id}.run"),
                message: "missing run reference".into(),
            })?;

        let inputs = parse_step_inputs(entry.get("in"))?;
        let outputs = as_entry_list(entry.get("out"))
            .into_iter()
            .map(|o| match o {
                Value::String(s) => StepOutput { id: local_fragment(&s) },
                other => StepOutput {
                    id: other
                        .get("id")
                        .and_then(Value::as_str)
                        .map(local_fragment)
                        .unwrap_or_default(),
                },
            })
            .collect();

        let scatter = match entry.get("scatter") {
            Some(Value::String(s)) => vec![local_fragment(s)],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(local_fragment)
                .collect(),
            _ => Vec::new(),
        };
        let scatter_method = match entry.get("scatterMethod").and_then(Value::as_str) {
            Some("dotproduct") => Some(ScatterMethod::Dotproduct),
            Some("nested_crossproduct") => Some(ScatterMethod::NestedCrossproduct),
            Some("flat_crossproduct") => Some(ScatterMethod::FlatCrossproduct),
            _ if !scatter.is_empty() => Some(ScatterMethod::Dotproduct),
            _ => None,
        };
        let when = entry.get("when").and_then(Value::as_str).map(str::to_string);

        let depends_on = derive_depends_on(&inputs);

        steps.push(Step {
            step_id,
            run,
            inputs,
            outputs,
            scatter,
            scatter_method,
            when,
            depends_on,
        });
    }
    Ok(steps)
}

fn parse_step_inputs(value: Option<&Value>) -> Result<Vec<StepInput>, ParseError> {
    let mut out = Vec::new();
    for entry in as_entry_list(value) {
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(local_fragment)
            .ok_or_else(|| ParseError::Invalid {
                field: "in[].id".into(),
                message: "missing id".into(),
            })?;
        let sources = match entry.get("source") {
            Some(Value::String(s)) => vec![local_fragment(s)],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(local_fragment)
                .collect(),
            _ => Vec::new(),
        };
        let link_merge = match entry.get("linkMerge").and_then(Value::as_str) {
            Some("merge_flattened") => LinkMerge::MergeFlattened,
            _ => LinkMerge::MergeNested,
        };
        let pick_value = match entry.get("pickValue").and_then(Value::as_str) {
            Some("first_non_null") => Some(PickValue::FirstNonNull),
            Some("the_only_non_null") => Some(PickValue::TheOnlyNonNull),
            Some("all_non_null") => Some(PickValue::AllNonNull),
            _ => None,
        };
        let default = entry.get("default").cloned().map(crate::value::CwlValue::from_json);
        let value_from = entry.get("valueFrom").and_then(Value::as_str).map(str::to_string);

        out.push(StepInput {
            id,
            sources,
            link_merge,
            pick_value,
            default,
            value_from,
        });
    }
    Ok(out)
}

/// A step depends on another step if any of its input sources name a step
/// (`step_id/output_id` form); plain workflow-input sources don't create a
/// dependency. (spec.md §4.7.3)
fn derive_depends_on(inputs: &[StepInput]) -> Vec<String> {
    let mut deps: Vec<String> = inputs
        .iter()
        .flat_map(|input| input.sources.iter())
        .filter_map(|source| source.split_once('/').map(|(step, _)| step.to_string()))
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

fn parse_tool(id: &str, process: &Value, class: &str) -> Result<NormalizedTool, ParseError> {
    let class = if class == "ExpressionTool" {
        ProcessClass::ExpressionTool
    } else {
        ProcessClass::CommandLineTool
    };

    let base_command = match process.get("baseCommand") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let arguments = process
        .get("arguments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let inputs = normalize_params(process.get("inputs"))?;
    let outputs = parse_tool_outputs(process.get("outputs"))?;
    let (requirements, hints) = parse_requirements(process);

    let stdin = process.get("stdin").and_then(Value::as_str).map(str::to_string);
    let stdout = process.get("stdout").and_then(Value::as_str).map(str::to_string);
    let stderr = process.get("stderr").and_then(Value::as_str).map(str::to_string);

    let success_codes = process
        .get("successCodes")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_i64).map(|i| i as i32).collect())
        .unwrap_or_else(|| vec![0]);
    let temporary_fail_codes = process
        .get("temporaryFailCodes")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_i64).map(|i| i as i32).collect())
        .unwrap_or_default();

    let expression = process.get("expression").and_then(Value::as_str).map(str::to_string);

    Ok(NormalizedTool {
        id: id.to_string(),
        class,
        base_command,
        arguments,
        inputs,
        outputs,
        requirements,
        hints,
        stdin,
        stdout,
        stderr,
        success_codes,
        temporary_fail_codes,
        expression,
    })
}

fn parse_tool_outputs(value: Option<&Value>) -> Result<Vec<ToolOutput>, ParseError> {
    let mut out = Vec::new();
    for entry in as_entry_list(value) {
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(local_fragment)
            .ok_or_else(|| ParseError::Invalid {
                field: "outputs[].id".into(),
                message: "missing id".into(),
            })?;
        let (type_str, _secondary_files, format, _load_contents) = normalize_type_field(&entry);
        let secondary_files = parse_secondary_file_patterns(&entry);
        let binding = entry.get("outputBinding");
        let glob = binding.and_then(|b| b.get("glob")).cloned();
        let output_eval = binding
            .and_then(|b| b.get("outputEval"))
            .and_then(Value::as_str)
            .map(str::to_string);
        out.push(ToolOutput {
            id,
            type_str,
            glob,
            output_eval,
            secondary_files,
            format,
        });
    }
    Ok(out)
}

/// Normalize the inputs/outputs array-vs-map and shorthand-vs-expanded
/// type forms (spec.md §4.2).
fn normalize_params(value: Option<&Value>) -> Result<Vec<ParamDef>, ParseError> {
    let mut out = Vec::new();
    for entry in as_entry_list(value) {
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(local_fragment)
            .ok_or_else(|| ParseError::Invalid {
                field: "params[].id".into(),
                message: "missing id".into(),
            })?;
        let (type_str, secondary_files, format, load_contents) = normalize_type_field(&entry);
        let required = !type_str.ends_with('?');
        let default = entry.get("default").cloned().map(crate::value::CwlValue::from_json);
        let binding = parse_input_binding(entry.get("inputBinding"));
        out.push(ParamDef {
            id,
            type_str,
            required,
            default,
            secondary_files,
            format,
            load_contents,
            binding,
        });
    }
    Ok(out)
}

/// Parse a tool input's `inputBinding` object (spec.md §4.4). Absent for
/// workflow-level inputs, which have no command-line placement.
fn parse_input_binding(value: Option<&Value>) -> Option<ParamBinding> {
    let binding = value?;
    Some(ParamBinding {
        position: binding.get("position").and_then(Value::as_i64).unwrap_or(0),
        prefix: binding.get("prefix").and_then(Value::as_str).map(str::to_string),
        separate: binding.get("separate").and_then(Value::as_bool).unwrap_or(true),
        shell_quote: binding.get("shellQuote").and_then(Value::as_bool).unwrap_or(true),
        item_separator: binding
            .get("itemSeparator")
            .and_then(Value::as_str)
            .map(str::to_string),
        value_from: binding.get("valueFrom").and_then(Value::as_str).map(str::to_string),
    })
}

/// Resolve the shorthand (`"File"`, `"string?"`) vs expanded
/// (`{type: File, secondaryFiles: [...]}`) type forms into a single type
/// string plus the separately-tracked `secondaryFiles`/`format`/
/// `loadContents` fields.
fn normalize_type_field(entry: &Value) -> (String, Vec<String>, Option<String>, bool) {
    let type_field = entry.get("type");
    let type_str = match type_field {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Any")
            .to_string(),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect();
            if parts.iter().any(|p| p == "null") {
                let rest: Vec<&String> = parts.iter().filter(|p| p.as_str() != "null").collect();
                if rest.len() == 1 {
                    format!("{}?", rest[0])
                } else {
                    parts.join("|")
                }
            } else {
                parts.join("|")
            }
        }
        _ => "Any".to_string(),
    };

    let secondary_files = entry
        .get("secondaryFiles")
        .into_iter()
        .chain(type_field.and_then(|t| t.get("secondaryFiles")))
        .flat_map(|v| match v {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            _ => Vec::new(),
        })
        .collect();

    let format = entry
        .get("format")
        .and_then(Value::as_str)
        .map(str::to_string);
    let load_contents = entry
        .get("loadContents")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    (type_str, secondary_files, format, load_contents)
}

/// Parse a tool output's `secondaryFiles` entries into patterns with their
/// required/optional flag (spec.md §4.5), preserved through to output
/// collection so a missing required companion file fails the task.
fn parse_secondary_file_patterns(entry: &Value) -> Vec<SecondaryFilePattern> {
    let type_field = entry.get("type");
    entry
        .get("secondaryFiles")
        .into_iter()
        .chain(type_field.and_then(|t| t.get("secondaryFiles")))
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().map(secondary_file_pattern_from).collect(),
            other => vec![secondary_file_pattern_from(other)],
        })
        .collect()
}

fn secondary_file_pattern_from(value: &Value) -> SecondaryFilePattern {
    match value {
        Value::String(s) => match s.strip_suffix('?') {
            Some(stripped) => SecondaryFilePattern {
                pattern: stripped.to_string(),
                required: false,
            },
            None => SecondaryFilePattern {
                pattern: s.clone(),
                required: true,
            },
        },
        Value::Object(obj) => SecondaryFilePattern {
            pattern: obj.get("pattern").and_then(Value::as_str).unwrap_or_default().to_string(),
            required: obj.get("required").and_then(Value::as_bool).unwrap_or(true),
        },
        _ => SecondaryFilePattern {
            pattern: String::new(),
            required: true,
        },
    }
}

/// Both the map form `{id: def}` and the list form `[{id, ...}, ...]`
/// collapse to an iterator of entry objects keyed-in-place by `id`
/// (spec.md §4.2).
fn as_entry_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let mut entry = v.clone();
                if let Value::Object(ref mut obj) = entry {
                    obj.entry("id").or_insert_with(|| Value::String(k.clone()));
                } else {
                    let mut obj = serde_json::Map::new();
                    obj.insert("id".into(), Value::String(k.clone()));
                    obj.insert("type".into(), entry);
                    entry = Value::Object(obj);
                }
                entry
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_requirements(process: &Value) -> (RequirementsBag, RequirementsBag) {
    let requirements = parse_requirements_list(process.get("requirements"));
    let hints = parse_requirements_list(process.get("hints"));
    (requirements, hints)
}

fn parse_requirements_list(value: Option<&Value>) -> RequirementsBag {
    let mut bag = RequirementsBag::default();
    for entry in as_class_keyed_list(value) {
        let Some(class) = entry.get("class").and_then(Value::as_str) else {
            continue;
        };
        match class {
            "ShellCommandRequirement" => bag.shell_command = true,
            "DockerRequirement" => {
                bag.docker = Some(DockerRequirement {
                    image: entry
                        .get("dockerPull")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    output_directory: entry
                        .get("dockerOutputDirectory")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            "ResourceRequirement" => {
                bag.resource = Some(ResourceRequirement {
                    cores_min: entry.get("coresMin").and_then(Value::as_u64).map(|v| v as u32),
                    ram_min: entry.get("ramMin").and_then(Value::as_u64),
                })
            }
            "InitialWorkDirRequirement" => {
                bag.initial_work_dir = entry
                    .get("listing")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                Some(Dirent {
                                    entryname: item.get("entryname").and_then(Value::as_str).map(str::to_string),
                                    entry: item.get("entry").and_then(Value::as_str)?.to_string(),
                                    writable: item.get("writable").and_then(Value::as_bool).unwrap_or(false),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
            }
            "EnvVarRequirement" => {
                if let Some(Value::Array(items)) = entry.get("envDef") {
                    for item in items {
                        if let (Some(name), Some(value)) = (
                            item.get("envName").and_then(Value::as_str),
                            item.get("envValue").and_then(Value::as_str),
                        ) {
                            bag.env_vars.insert(name.to_string(), value.to_string());
                        }
                    }
                }
            }
            "InlineJavascriptRequirement" => {
                bag.inline_javascript = true;
                if let Some(Value::Array(items)) = entry.get("expressionLib") {
                    bag.expression_lib = items.iter().filter_map(Value::as_str).map(str::to_string).collect();
                }
            }
            "ScatterFeatureRequirement" => bag.scatter_feature = true,
            "SubworkflowFeatureRequirement" => bag.subworkflow_feature = true,
            "StepInputExpressionRequirement" => bag.step_input_expression = true,
            "MultipleInputFeatureRequirement" => bag.multiple_input_feature = true,
            "InplaceUpdateRequirement" => bag.inplace_update = true,
            "LoadListingRequirement" => {
                bag.load_listing = entry.get("loadListing").and_then(Value::as_str).map(str::to_string);
            }
            "SchemaDefRequirement" => {
                if let Some(Value::Array(items)) = entry.get("types") {
                    bag.schema_defs = items.clone();
                }
            }
            "ToolTimeLimit" => {
                bag.tool_time_limit = entry.get("timelimit").and_then(Value::as_u64);
            }
            _ => {}
        }
    }
    bag
}

fn as_class_keyed_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let mut entry = v.clone();
                if let Value::Object(ref mut obj) = entry {
                    obj.entry("class").or_insert_with(|| Value::String(k.clone()));
                }
                entry
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Project a [`NormalizedWorkflow`] into the immutable [`Workflow`] record
/// stored once per content hash (spec.md §3.1/§3.3).
pub fn to_workflow_record(doc: &GraphDocument, content_hash: String) -> Result<Workflow, ParseError> {
    let wf = doc
        .main_workflow()
        .ok_or_else(|| ParseError::FragmentNotFound(doc.workflow_fragment.clone()))?;
    Ok(Workflow {
        workflow_id: Uuid::now_v7(),
        content_hash,
        cwl_version: doc.cwl_version.clone(),
        class: ProcessClass::Workflow,
        inputs: wf.inputs.clone(),
        outputs: wf.outputs.clone(),
        steps: wf.steps.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::{bundle_value, FsLoader};
    use std::path::Path;

    fn parse_text(text: &str) -> GraphDocument {
        let doc: Value = serde_json::from_str(text).unwrap();
        let packed = bundle_value(doc, Path::new("/wf"), &FsLoader).unwrap();
        parse(&packed).unwrap()
    }

    #[test]
    fn map_and_array_inputs_normalize_identically() {
        let array_form = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"t","class":"CommandLineTool","inputs":[{"id":"x","type":"string"}],"outputs":[]}
        ]}"#;
        let map_form = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"t","class":"CommandLineTool","inputs":{"x":{"type":"string"}},"outputs":[]}
        ]}"#;
        let a = parse_text(array_form);
        let b = parse_text(map_form);
        assert_eq!(a.tools["t"].inputs[0].id, b.tools["t"].inputs[0].id);
        assert_eq!(a.tools["t"].inputs[0].type_str, b.tools["t"].inputs[0].type_str);
    }

    #[test]
    fn shorthand_and_expanded_types_normalize_identically() {
        let shorthand = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"t","class":"CommandLineTool","inputs":[{"id":"x","type":"string?"}],"outputs":[]}
        ]}"#;
        let expanded = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"t","class":"CommandLineTool","inputs":[{"id":"x","type":["null","string"]}],"outputs":[]}
        ]}"#;
        let a = parse_text(shorthand);
        let b = parse_text(expanded);
        assert_eq!(a.tools["t"].inputs[0].type_str, "string?");
        assert_eq!(b.tools["t"].inputs[0].type_str, "string?");
        assert!(!a.tools["t"].inputs[0].required);
    }

    #[test]
    fn base_command_string_normalizes_to_single_element_list() {
        let text = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"t","class":"CommandLineTool","baseCommand":"echo","inputs":[],"outputs":[]}
        ]}"#;
        let doc = parse_text(text);
        assert_eq!(doc.tools["t"].base_command, vec!["echo".to_string()]);
    }

    #[test]
    fn step_depends_on_derived_from_sources() {
        let text = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"a","class":"CommandLineTool","inputs":[],"outputs":[{"id":"out","type":"File"}]},
            {"id":"b","class":"CommandLineTool","inputs":[{"id":"in","type":"File"}],"outputs":[]},
            {"id":"main","class":"Workflow","inputs":[],"outputs":[],
             "steps":[
                {"id":"s1","run":"#a","in":[],"out":["out"]},
                {"id":"s2","run":"#b","in":[{"id":"in","source":"s1/out"}],"out":[]}
             ]}
        ]}"#;
        let doc = parse_text(text);
        let wf = doc.main_workflow().unwrap();
        let s2 = wf.steps.iter().find(|s| s.step_id == "s2").unwrap();
        assert_eq!(s2.depends_on, vec!["s1".to_string()]);
    }

    #[test]
    fn requirements_bag_distinguishes_types() {
        let text = r#"{"cwlVersion":"v1.2","$graph":[
            {"id":"t","class":"CommandLineTool","inputs":[],"outputs":[],
             "requirements":[
                {"class":"ShellCommandRequirement"},
                {"class":"DockerRequirement","dockerPull":"ubuntu:22.04"}
             ]}
        ]}"#;
        let doc = parse_text(text);
        let tool = &doc.tools["t"];
        assert!(tool.requirements.shell_command);
        assert_eq!(tool.requirements.docker.as_ref().unwrap().image, "ubuntu:22.04");
    }
}
