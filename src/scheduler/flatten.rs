//! Sub-workflow flattening (`SubworkflowFeatureRequirement`, spec.md §4.2):
//! inlines a step whose `run` fragment is itself a `Workflow` into the
//! parent's step list, so the DAG and dispatch phases only ever see
//! tool-leaf steps.
//!
//! Two distinct substitutions happen here. Inward: a source bare-named
//! after one of the sub-workflow's own inputs is replaced by the calling
//! step's resolved source for that input (scoped to this one nesting
//! instance, via `alias`). Outward: a source naming `<step_id>/<output_id>`
//! where `step_id` names an inlined step no longer exists after flattening
//! — it's replaced by the sub-workflow's own output source for
//! `output_id`. Outward substitutions are collected globally in
//! `output_alias` and resolved in one fixed-point pass after the whole
//! document is flattened, since they can be referenced from any ancestor
//! level, including the top-level workflow's own `outputs`.

use std::collections::HashMap;

use crate::parser::{GraphDocument, NormalizedWorkflow};
use crate::value::{Step, StepInput};

const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FlattenError {
    #[error("step {0} references unknown run target {1}")]
    UnknownRun(String, String),
    #[error("sub-workflow nesting under {0} exceeded the depth limit")]
    TooDeep(String),
}

pub struct FlattenResult {
    pub steps: Vec<Step>,
    pub output_alias: HashMap<String, Vec<String>>,
}

/// Flatten every step in `workflow`, inlining nested sub-workflows.
pub fn flatten(document: &GraphDocument, workflow: &NormalizedWorkflow) -> Result<FlattenResult, FlattenError> {
    let mut output_alias = HashMap::new();
    let mut steps = flatten_steps(document, &workflow.steps, "", None, &mut output_alias, 0)?;
    for step in &mut steps {
        for input in &mut step.inputs {
            input.sources = apply_output_alias(&input.sources, &output_alias);
        }
    }
    Ok(FlattenResult { steps, output_alias })
}

/// Apply the global output-alias substitution to an arbitrary source list
/// (used for the top-level workflow's own declared outputs too).
pub fn apply_output_alias(sources: &[String], alias: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut current = sources.to_vec();
    for _ in 0..MAX_DEPTH {
        let mut changed = false;
        let mut next = Vec::with_capacity(current.len());
        for source in &current {
            if let Some(replacement) = alias.get(source) {
                next.extend(replacement.iter().cloned());
                changed = true;
            } else {
                next.push(source.clone());
            }
        }
        current = next;
        if !changed {
            break;
        }
    }
    current
}

fn flatten_steps(
    document: &GraphDocument,
    steps: &[Step],
    prefix: &str,
    alias: Option<&HashMap<String, Vec<String>>>,
    output_alias: &mut HashMap<String, Vec<String>>,
    depth: usize,
) -> Result<Vec<Step>, FlattenError> {
    if depth > MAX_DEPTH {
        return Err(FlattenError::TooDeep(prefix.to_string()));
    }

    let mut out = Vec::new();
    for step in steps {
        let qualified_id = qualify(prefix, &step.step_id);
        let rewritten_inputs: Vec<StepInput> = step.inputs.iter().map(|input| rewrite_input(input, prefix, alias)).collect();

        if let Some(sub) = document.sub_workflows.get(&step.run) {
            let inner_alias: HashMap<String, Vec<String>> =
                rewritten_inputs.iter().map(|input| (input.id.clone(), input.sources.clone())).collect();

            let inner_steps =
                flatten_steps(document, &sub.steps, &qualified_id, Some(&inner_alias), output_alias, depth + 1)?;

            for step_output in &step.outputs {
                if let Some(source) = sub.outputs.get(&step_output.id) {
                    let rewritten = rewrite_input(
                        &StepInput {
                            id: step_output.id.clone(),
                            sources: source.sources.clone(),
                            link_merge: source.link_merge,
                            pick_value: source.pick_value,
                            default: None,
                            value_from: None,
                        },
                        &qualified_id,
                        None,
                    );
                    output_alias.insert(format!("{qualified_id}/{}", step_output.id), rewritten.sources);
                }
            }

            out.extend(inner_steps);
        } else if document.tools.contains_key(&step.run) {
            let depends_on = derive_depends_on(&rewritten_inputs);
            out.push(Step {
                step_id: qualified_id,
                run: step.run.clone(),
                inputs: rewritten_inputs,
                outputs: step.outputs.clone(),
                scatter: step.scatter.clone(),
                scatter_method: step.scatter_method,
                when: step.when.clone(),
                depends_on,
            });
        } else {
            return Err(FlattenError::UnknownRun(step.step_id.clone(), step.run.clone()));
        }
    }
    Ok(out)
}

fn rewrite_input(input: &StepInput, prefix: &str, alias: Option<&HashMap<String, Vec<String>>>) -> StepInput {
    let mut sources = Vec::with_capacity(input.sources.len());
    for source in &input.sources {
        if let Some((step_id, output_id)) = source.split_once('/') {
            sources.push(format!("{}/{}", qualify(prefix, step_id), output_id));
        } else if let Some(replacement) = alias.and_then(|a| a.get(source)) {
            sources.extend(replacement.iter().cloned());
        } else {
            sources.push(source.clone());
        }
    }
    StepInput {
        id: input.id.clone(),
        sources,
        link_merge: input.link_merge,
        pick_value: input.pick_value,
        default: input.default.clone(),
        value_from: input.value_from.clone(),
    }
}

fn qualify(prefix: &str, id: &str) -> String {
    if prefix.is_empty() {
        id.to_string()
    } else {
        format!("{prefix}/{id}")
    }
}

/// Mirrors `parser::derive_depends_on`: a step depends on another step iff
/// one of its sources names `step/output`.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{GraphDocument, NormalizedTool, NormalizedWorkflow};
    use crate::value::{LinkMerge, OutputSource, ProcessClass, StepOutput};

    fn leaf_tool(id: &str) -> NormalizedTool {
        NormalizedTool {
            id: id.to_string(),
            class: ProcessClass::CommandLineTool,
            base_command: vec!["true".to_string()],
            arguments: vec![],
            inputs: vec![],
            outputs: vec![],
            requirements: crate::parser::RequirementsBag::default(),
            hints: crate::parser::RequirementsBag::default(),
            stdin: None,
            stdout: None,
            stderr: None,
            success_codes: vec![0],
            temporary_fail_codes: vec![],
            expression: None,
        }
    }

    fn step_input(id: &str, sources: &[&str]) -> StepInput {
        StepInput {
            id: id.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            link_merge: LinkMerge::MergeNested,
            pick_value: None,
            default: None,
            value_from: None,
        }
    }

    fn flat_step(id: &str, run: &str, inputs: Vec<StepInput>, outputs: &[&str]) -> Step {
        Step {
            step_id: id.to_string(),
            run: run.to_string(),
            inputs,
            outputs: outputs.iter().map(|o| StepOutput { id: o.to_string() }).collect(),
            scatter: vec![],
            scatter_method: None,
            when: None,
            depends_on: vec![],
        }
    }

    #[test]
    fn no_nesting_passes_through_unchanged() {
        let mut tools = HashMap::new();
        tools.insert("tool_a".to_string(), leaf_tool("tool_a"));
        let document = GraphDocument {
            cwl_version: "v1.2".to_string(),
            namespaces: HashMap::new(),
            workflow_fragment: "main".to_string(),
            tools,
            sub_workflows: HashMap::new(),
        };
        let workflow = NormalizedWorkflow {
            id: "main".to_string(),
            inputs: vec![],
            outputs: HashMap::new(),
            steps: vec![flat_step("s1", "tool_a", vec![step_input("x", &["wf_in"])], &["out"])],
        };

        let result = flatten(&document, &workflow).unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].step_id, "s1");
        assert_eq!(result.steps[0].inputs[0].sources, vec!["wf_in".to_string()]);
    }

    #[test]
    fn inlines_one_level_of_subworkflow() {
        let mut tools = HashMap::new();
        tools.insert("inner_tool".to_string(), leaf_tool("inner_tool"));

        let mut sub_workflows = HashMap::new();
        sub_workflows.insert(
            "subwf".to_string(),
            NormalizedWorkflow {
                id: "subwf".to_string(),
                inputs: vec![],
                outputs: {
                    let mut m = HashMap::new();
                    m.insert(
                        "result".to_string(),
                        OutputSource {
                            sources: vec!["inner/out".to_string()],
                            link_merge: LinkMerge::MergeNested,
                            pick_value: None,
                        },
                    );
                    m
                },
                steps: vec![flat_step("inner", "inner_tool", vec![step_input("y", &["sub_in"])], &["out"])],
            },
        );

        let document = GraphDocument {
            cwl_version: "v1.2".to_string(),
            namespaces: HashMap::new(),
            workflow_fragment: "main".to_string(),
            tools,
            sub_workflows,
        };

        let workflow = NormalizedWorkflow {
            id: "main".to_string(),
            inputs: vec![],
            outputs: {
                let mut m = HashMap::new();
                m.insert(
                    "final".to_string(),
                    OutputSource {
                        sources: vec!["callsub/result".to_string()],
                        link_merge: LinkMerge::MergeNested,
                        pick_value: None,
                    },
                );
                m
            },
            steps: vec![flat_step("callsub", "subwf", vec![step_input("sub_in", &["wf_in"])], &["result"])],
        };

        let result = flatten(&document, &workflow).unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].step_id, "callsub/inner");
        assert_eq!(result.steps[0].inputs[0].sources, vec!["wf_in".to_string()]);

        let top_output_sources = apply_output_alias(&["callsub/result".to_string()], &result.output_alias);
        assert_eq!(top_output_sources, vec!["callsub/inner/out".to_string()]);
    }

    #[test]
    fn unknown_run_target_errors() {
        let document = GraphDocument {
            cwl_version: "v1.2".to_string(),
            namespaces: HashMap::new(),
            workflow_fragment: "main".to_string(),
            tools: HashMap::new(),
            sub_workflows: HashMap::new(),
        };
        let workflow = NormalizedWorkflow {
            id: "main".to_string(),
            inputs: vec![],
            outputs: HashMap::new(),
            steps: vec![flat_step("s1", "missing", vec![], &[])],
        };
        assert!(matches!(flatten(&document, &workflow), Err(FlattenError::UnknownRun(_, _))));
    }
}
