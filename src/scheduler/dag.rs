//! DAG construction and cycle detection over a workflow's flattened steps
//! (spec.md §4.7.3).

use std::collections::{HashMap, HashSet};

use crate::value::Step;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DagError {
    #[error("cycle detected involving step {0}")]
    Cycle(String),
    #[error("step {0} depends on unknown step {1}")]
    UnknownDependency(String, String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

/// Validate that `steps` forms an acyclic graph over `depends_on`, and that
/// every dependency refers to a step that actually exists.
pub fn validate(steps: &[Step]) -> Result<(), DagError> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(DagError::UnknownDependency(step.step_id.clone(), dep.clone()));
            }
        }
    }

    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
    let mut state: HashMap<&str, VisitState> = HashMap::new();
    for step in steps {
        visit(step.step_id.as_str(), &by_id, &mut state)?;
    }
    Ok(())
}

fn visit<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a Step>,
    state: &mut HashMap<&'a str, VisitState>,
) -> Result<(), DagError> {
    match state.get(id) {
        Some(VisitState::Done) => return Ok(()),
        Some(VisitState::Visiting) => return Err(DagError::Cycle(id.to_string())),
        None => {}
    }
    state.insert(id, VisitState::Visiting);
    if let Some(step) = by_id.get(id) {
        for dep in &step.depends_on {
            visit(dep.as_str(), by_id, state)?;
        }
    }
    state.insert(id, VisitState::Done);
    Ok(())
}

/// Steps whose dependencies are all satisfied (in `completed`) and which
/// haven't been started yet (spec.md §4.7 phase 3 "Resolve & schedule").
pub fn ready_steps<'a>(
    steps: &'a [Step],
    completed: &HashSet<String>,
    started: &HashSet<String>,
) -> Vec<&'a Step> {
    steps
        .iter()
        .filter(|s| !started.contains(&s.step_id) && s.depends_on.iter().all(|d| completed.contains(d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StepInput;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            step_id: id.to_string(),
            run: "tool".to_string(),
            inputs: Vec::<StepInput>::new(),
            outputs: Vec::new(),
            scatter: Vec::new(),
            scatter_method: None,
            when: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn linear_chain_validates() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        assert!(validate(&steps).is_ok());
    }

    #[test]
    fn direct_cycle_detected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(matches!(validate(&steps), Err(DagError::Cycle(_))));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let steps = vec![step("a", &["missing"])];
        assert!(matches!(validate(&steps), Err(DagError::UnknownDependency(_, _))));
    }

    #[test]
    fn ready_steps_respects_completion_and_started() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])];
        let completed: HashSet<String> = HashSet::new();
        let started: HashSet<String> = HashSet::new();
        let ready = ready_steps(&steps, &completed, &started);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].step_id, "a");

        let completed: HashSet<String> = ["a".to_string()].into_iter().collect();
        let started: HashSet<String> = ["a".to_string()].into_iter().collect();
        let mut ready = ready_steps(&steps, &completed, &started);
        ready.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        assert_eq!(ready.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
