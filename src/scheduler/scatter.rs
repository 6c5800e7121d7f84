//! Scatter expansion (spec.md §4.7.2): dotproduct / nested_crossproduct /
//! flat_crossproduct over a step's scattered inputs, and output reassembly
//! back into the shape each method implies.

use std::collections::HashMap;

use crate::value::{CwlValue, ScatterMethod};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScatterError {
    #[error("scatter input {0} was not resolved")]
    Unresolved(String),
    #[error("scatter input {0} is not an array")]
    NotAnArray(String),
    #[error("dotproduct scatter requires equal-length arrays; {id} has {actual}, expected {expected}")]
    LengthMismatch {
        id: String,
        actual: usize,
        expected: usize,
    },
}

/// One scatter combination: the resolved value for each scattered input id
/// in this combo, plus its position in the cross-product's per-dimension
/// index space (used to reassemble nested output arrays).
#[derive(Debug, Clone)]
pub struct ScatterCombo {
    pub values: HashMap<String, CwlValue>,
    pub indices: Vec<usize>,
}

/// Expand a step's scattered inputs into the concrete per-task combinations
/// `method` describes. `resolved` must already contain an array value for
/// every id in `scatter_ids`.
pub fn expand(
    scatter_ids: &[String],
    method: ScatterMethod,
    resolved: &HashMap<String, CwlValue>,
) -> Result<Vec<ScatterCombo>, ScatterError> {
    let arrays: Vec<(&str, &[CwlValue])> = scatter_ids
        .iter()
        .map(|id| {
            let value = resolved
                .get(id)
                .ok_or_else(|| ScatterError::Unresolved(id.clone()))?;
            let items = value
                .as_array()
                .ok_or_else(|| ScatterError::NotAnArray(id.clone()))?;
            Ok((id.as_str(), items))
        })
        .collect::<Result<_, ScatterError>>()?;

    match method {
        ScatterMethod::Dotproduct => {
            let expected = arrays.first().map(|(_, a)| a.len()).unwrap_or(0);
            for (id, items) in &arrays {
                if items.len() != expected {
                    return Err(ScatterError::LengthMismatch {
                        id: id.to_string(),
                        actual: items.len(),
                        expected,
                    });
                }
            }
            Ok((0..expected)
                .map(|i| ScatterCombo {
                    values: arrays.iter().map(|(id, items)| (id.to_string(), items[i].clone())).collect(),
                    indices: vec![i],
                })
                .collect())
        }
        ScatterMethod::NestedCrossproduct | ScatterMethod::FlatCrossproduct => Ok(cross_product(&arrays)),
    }
}

fn cross_product(arrays: &[(&str, &[CwlValue])]) -> Vec<ScatterCombo> {
    let mut combos = vec![ScatterCombo {
        values: HashMap::new(),
        indices: Vec::new(),
    }];
    for (id, items) in arrays {
        let mut next = Vec::with_capacity(combos.len() * items.len().max(1));
        for combo in &combos {
            for (idx, item) in items.iter().enumerate() {
                let mut values = combo.values.clone();
                values.insert(id.to_string(), item.clone());
                let mut indices = combo.indices.clone();
                indices.push(idx);
                next.push(ScatterCombo { values, indices });
            }
        }
        combos = next;
    }
    combos
}

/// The dimension sizes (one per scattered input, in order) a
/// `nested_crossproduct` scatter needs to reassemble its output shape.
pub fn dimensions(scatter_ids: &[String], resolved: &HashMap<String, CwlValue>) -> Vec<usize> {
    scatter_ids
        .iter()
        .map(|id| resolved.get(id).and_then(CwlValue::as_array).map(<[CwlValue]>::len).unwrap_or(0))
        .collect()
}

/// Reassemble per-combo output values into the shape `method` implies:
/// dotproduct and flat_crossproduct both yield one flat array in combo
/// order; nested_crossproduct yields an array nested one level per
/// scattered input.
pub fn reassemble(method: ScatterMethod, dims: &[usize], outputs: Vec<CwlValue>) -> CwlValue {
    match method {
        ScatterMethod::Dotproduct | ScatterMethod::FlatCrossproduct => CwlValue::Array(outputs),
        ScatterMethod::NestedCrossproduct => nest(dims, &outputs),
    }
}

fn nest(dims: &[usize], flat: &[CwlValue]) -> CwlValue {
    let Some((head, rest)) = dims.split_first() else {
        return flat.first().cloned().unwrap_or(CwlValue::Null);
    };
    let chunk_size = rest.iter().product::<usize>().max(1);
    let chunks: Vec<CwlValue> = (0..*head)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(flat.len());
            nest(rest, &flat[start..end])
        })
        .collect();
    CwlValue::Array(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(items: &[i64]) -> CwlValue {
        CwlValue::Array(items.iter().map(|i| CwlValue::Int(*i)).collect())
    }

    #[test]
    fn dotproduct_pairs_by_index() {
        let mut resolved = HashMap::new();
        resolved.insert("a".to_string(), arr(&[1, 2, 3]));
        resolved.insert("b".to_string(), arr(&[10, 20, 30]));

        let combos = expand(&["a".to_string(), "b".to_string()], ScatterMethod::Dotproduct, &resolved).unwrap();
        assert_eq!(combos.len(), 3);
        assert_eq!(combos[1].values["a"], CwlValue::Int(2));
        assert_eq!(combos[1].values["b"], CwlValue::Int(20));
    }

    #[test]
    fn dotproduct_rejects_unequal_lengths() {
        let mut resolved = HashMap::new();
        resolved.insert("a".to_string(), arr(&[1, 2]));
        resolved.insert("b".to_string(), arr(&[10, 20, 30]));

        let err = expand(&["a".to_string(), "b".to_string()], ScatterMethod::Dotproduct, &resolved).unwrap_err();
        assert!(matches!(err, ScatterError::LengthMismatch { .. }));
    }

    #[test]
    fn flat_crossproduct_produces_all_combinations() {
        let mut resolved = HashMap::new();
        resolved.insert("a".to_string(), arr(&[1, 2]));
        resolved.insert("b".to_string(), arr(&[10, 20]));

        let combos = expand(&["a".to_string(), "b".to_string()], ScatterMethod::FlatCrossproduct, &resolved).unwrap();
        assert_eq!(combos.len(), 4);
    }

    #[test]
    fn nested_crossproduct_reassembles_as_nested_array() {
        let dims = vec![2, 3];
        let outputs: Vec<CwlValue> = (0..6).map(CwlValue::Int).collect();
        let nested = reassemble(ScatterMethod::NestedCrossproduct, &dims, outputs);
        let CwlValue::Array(outer) = nested else { panic!("expected array") };
        assert_eq!(outer.len(), 2);
        for row in &outer {
            assert!(matches!(row, CwlValue::Array(inner) if inner.len() == 3));
        }
    }

    #[test]
    fn flat_crossproduct_reassembles_as_flat_array() {
        let outputs: Vec<CwlValue> = (0..6).map(CwlValue::Int).collect();
        let flat = reassemble(ScatterMethod::FlatCrossproduct, &[2, 3], outputs);
        let CwlValue::Array(items) = flat else { panic!("expected array") };
        assert_eq!(items.len(), 6);
    }
}
