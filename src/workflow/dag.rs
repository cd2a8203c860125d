// SPDX-License-Identifier: MIT
//! Workflow DAG planning.
//!
//! Computes a topological layering of the step list: level 0 holds every
//! step with no dependencies, level k+1 every step whose dependencies all
//! sit in levels ≤ k. Duplicate ids, dangling references and cycles are
//! planning errors — step identity and dependency integrity are checked
//! here and nowhere else.

use std::collections::HashSet;

use crate::skills::WorkflowStep;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("workflow has no steps")]
    Empty,
    #[error("duplicate step id '{0}'")]
    DuplicateId(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency { step: String, dependency: String },
    #[error("dependency cycle involving steps: {0}")]
    Cycle(String),
}

/// Deterministic: the same step list always yields the same levels, and
/// steps keep their declared order within a level.
pub fn plan_levels(steps: &[WorkflowStep]) -> Result<Vec<Vec<usize>>, PlanError> {
    if steps.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut ids = HashSet::with_capacity(steps.len());
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(PlanError::DuplicateId(step.id.clone()));
        }
    }
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(PlanError::MissingDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut levels: Vec<Vec<usize>> = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<usize> = (0..steps.len()).collect();

    while !remaining.is_empty() {
        // Declared order within the level falls out of the scan order.
        let ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                steps[i]
                    .depends_on
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
            })
            .collect();

        if ready.is_empty() {
            let stuck: Vec<&str> = remaining.iter().map(|&i| steps[i].id.as_str()).collect();
            return Err(PlanError::Cycle(stuck.join(", ")));
        }

        for &i in &ready {
            placed.insert(steps[i].id.as_str());
        }
        remaining.retain(|i| !ready.contains(i));
        levels.push(ready);
    }

    Ok(levels)
}
