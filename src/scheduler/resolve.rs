//! Step input resolution (spec.md §4.7.1): turns a step's declared sources
//! into concrete values by looking them up in submission inputs or upstream
//! task outputs, then applying `linkMerge`/`pickValue`.

use crate::value::{CwlValue, LinkMerge, PickValue};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("pickValue first_non_null: all sources were null")]
    AllNull,
    #[error("pickValue the_only_non_null: no non-null source")]
    NoNonNull,
    #[error("pickValue the_only_non_null: more than one non-null source")]
    MultipleNonNull,
}

/// Resolve one step input's `sources` list to a single [`CwlValue`],
/// applying `pickValue` first (it operates on the list of per-source
/// values) and otherwise falling back to `linkMerge` when there is more
/// than one source. A single source with no `pickValue` passes through
/// unmodified — this is the overwhelmingly common case.
pub fn resolve_merge(
    sources: &[String],
    link_merge: LinkMerge,
    pick_value: Option<PickValue>,
    lookup: impl Fn(&str) -> Option<CwlValue>,
) -> Result<CwlValue, ResolveError> {
    let values: Vec<CwlValue> = sources.iter().map(|s| lookup(s).unwrap_or(CwlValue::Null)).collect();

    if let Some(pick) = pick_value {
        return apply_pick_value(pick, values);
    }

    if values.len() <= 1 {
        return Ok(values.into_iter().next().unwrap_or(CwlValue::Null));
    }

    Ok(match link_merge {
        LinkMerge::MergeNested => CwlValue::Array(values),
        LinkMerge::MergeFlattened => {
            let mut flat = Vec::new();
            for value in values {
                match value {
                    CwlValue::Array(items) => flat.extend(items),
                    other => flat.push(other),
                }
            }
            CwlValue::Array(flat)
        }
    })
}

fn apply_pick_value(pick: PickValue, values: Vec<CwlValue>) -> Result<CwlValue, ResolveError> {
    match pick {
        PickValue::FirstNonNull => values.into_iter().find(|v| !v.is_null()).ok_or(ResolveError::AllNull),
        PickValue::TheOnlyNonNull => {
            let mut non_null = values.into_iter().filter(|v| !v.is_null());
            let first = non_null.next().ok_or(ResolveError::NoNonNull)?;
            if non_null.next().is_some() {
                return Err(ResolveError::MultipleNonNull);
            }
            Ok(first)
        }
        PickValue::AllNonNull => Ok(CwlValue::Array(values.into_iter().filter(|v| !v.is_null()).collect())),
    }
}

/// Look up one source string (`"step_id/output_id"` or a bare submission
/// input id) against a step's upstream outputs and the submission's own
/// inputs.
pub fn lookup_source<'a>(
    source: &str,
    submission_inputs: &'a std::collections::HashMap<String, CwlValue>,
    step_outputs: &'a std::collections::HashMap<String, std::collections::HashMap<String, CwlValue>>,
) -> Option<CwlValue> {
    if let Some((step_id, output_id)) = source.split_once('/') {
        step_outputs.get(step_id).and_then(|outputs| outputs.get(output_id)).cloned()
    } else {
        submission_inputs.get(source).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn single_source_passes_through() {
        let result = resolve_merge(
            &["a".to_string()],
            LinkMerge::MergeNested,
            None,
            |id| if id == "a" { Some(CwlValue::Int(5)) } else { None },
        )
        .unwrap();
        assert_eq!(result, CwlValue::Int(5));
    }

    #[test]
    fn merge_nested_wraps_each_source() {
        let result = resolve_merge(
            &["a".to_string(), "b".to_string()],
            LinkMerge::MergeNested,
            None,
            |id| Some(CwlValue::String(id.to_string())),
        )
        .unwrap();
        assert_eq!(
            result,
            CwlValue::Array(vec![CwlValue::String("a".to_string()), CwlValue::String("b".to_string())])
        );
    }

    #[test]
    fn merge_flattened_splices_array_sources() {
        let result = resolve_merge(
            &["a".to_string(), "b".to_string()],
            LinkMerge::MergeFlattened,
            None,
            |id| match id {
                "a" => Some(CwlValue::Array(vec![CwlValue::Int(1), CwlValue::Int(2)])),
                "b" => Some(CwlValue::Int(3)),
                _ => None,
            },
        )
        .unwrap();
        assert_eq!(result, CwlValue::Array(vec![CwlValue::Int(1), CwlValue::Int(2), CwlValue::Int(3)]));
    }

    #[test]
    fn pick_value_first_non_null_skips_nulls() {
        let result = resolve_merge(
            &["a".to_string(), "b".to_string()],
            LinkMerge::MergeNested,
            Some(PickValue::FirstNonNull),
            |id| if id == "a" { Some(CwlValue::Null) } else { Some(CwlValue::Int(7)) },
        )
        .unwrap();
        assert_eq!(result, CwlValue::Int(7));
    }

    #[test]
    fn pick_value_the_only_non_null_errors_on_multiple() {
        let err = resolve_merge(
            &["a".to_string(), "b".to_string()],
            LinkMerge::MergeNested,
            Some(PickValue::TheOnlyNonNull),
            |_| Some(CwlValue::Int(1)),
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::MultipleNonNull));
    }

    #[test]
    fn lookup_source_distinguishes_step_and_workflow_inputs() {
        let mut submission_inputs = HashMap::new();
        submission_inputs.insert("wf_in".to_string(), CwlValue::Int(1));
        let mut step_outputs = HashMap::new();
        let mut s1 = HashMap::new();
        s1.insert("out".to_string(), CwlValue::Int(2));
        step_outputs.insert("s1".to_string(), s1);

        assert_eq!(lookup_source("wf_in", &submission_inputs, &step_outputs), Some(CwlValue::Int(1)));
        assert_eq!(lookup_source("s1/out", &submission_inputs, &step_outputs), Some(CwlValue::Int(2)));
        assert_eq!(lookup_source("s1/missing", &submission_inputs, &step_outputs), None);
    }
}
