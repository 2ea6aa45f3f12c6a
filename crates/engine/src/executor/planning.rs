//! Workflow dependency planning.
//!
//! The plan is built once per run: a topological order (Kahn), the direct and
//! transitive dependency sets of every step, and a static check that each
//! template only names steps the referencing step transitively depends on.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use cadence_types::{StepDefinition, ValidationError, Violation, WorkflowDefinition};
use indexmap::IndexMap;

use crate::error::EngineError;
use crate::templates::collect_templates_from_value;

/// One step together with its position in the dependency graph.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub definition: StepDefinition,
    /// Declared dependencies, de-duplicated, in declaration order.
    pub dependencies: Vec<String>,
    /// Every step reachable through `depends_on`.
    pub ancestors: BTreeSet<String>,
    /// Steps that declare this one in `depends_on`.
    pub dependents: Vec<String>,
}

/// Validated, acyclic execution plan for a workflow.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<String>,
    steps: IndexMap<String, PlannedStep>,
}

impl ExecutionPlan {
    /// Plan `workflow`.
    ///
    /// Fails with [`EngineError::CyclicWorkflow`] when the graph has a cycle and
    /// with [`EngineError::Validation`] for structural or template problems.
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self, EngineError> {
        let mut violations = Vec::new();
        let mut lookup: IndexMap<String, (usize, &StepDefinition)> = IndexMap::new();
        for (index, step) in workflow.steps.iter().enumerate() {
            if lookup.contains_key(&step.step_id) {
                violations.push(Violation::new(
                    format!("workflow.steps[{index}].step_id"),
                    format!("duplicate step id '{}'", step.step_id),
                ));
                continue;
            }
            lookup.insert(step.step_id.clone(), (index, step));
        }

        let mut in_degrees: HashMap<&str, usize> = lookup.keys().map(|step_id| (step_id.as_str(), 0)).collect();
        let mut dependencies: HashMap<&str, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<String>> = HashMap::new();

        for (step_id, (index, step)) in &lookup {
            let mut seen_dependencies = HashSet::new();
            for (position, dependency) in step.depends_on.iter().enumerate() {
                let path = format!("workflow.steps[{index}].depends_on[{position}]");
                if dependency == step_id {
                    violations.push(Violation::new(path, format!("step '{step_id}' cannot depend on itself")));
                    continue;
                }
                let Some((dependency_id, _)) = lookup.get_key_value(dependency) else {
                    violations.push(Violation::new(path, format!("depends on unknown step '{dependency}'")));
                    continue;
                };
                if !seen_dependencies.insert(dependency_id.as_str()) {
                    continue;
                }
                if let Some(degree) = in_degrees.get_mut(step_id.as_str()) {
                    *degree += 1;
                }
                dependencies.entry(step_id.as_str()).or_default().push(dependency_id.clone());
                dependents.entry(dependency_id.as_str()).or_default().push(step_id.clone());
            }
        }

        if !violations.is_empty() {
            return Err(ValidationError { violations }.into());
        }

        let mut queue: VecDeque<&str> = lookup
            .keys()
            .map(String::as_str)
            .filter(|step_id| in_degrees.get(step_id).copied().unwrap_or(0) == 0)
            .collect();

        let mut order = Vec::with_capacity(lookup.len());
        while let Some(step_id) = queue.pop_front() {
            order.push(step_id.to_string());
            for child in dependents.get(step_id).into_iter().flatten() {
                if let Some(degree) = in_degrees.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        if order.len() != lookup.len() {
            let mut remaining: Vec<String> = in_degrees
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(step_id, _)| step_id.to_string())
                .collect();
            remaining.sort();
            return Err(EngineError::CyclicWorkflow { steps: remaining });
        }

        let mut ancestors: HashMap<&str, BTreeSet<String>> = HashMap::new();
        for step_id in &order {
            let mut reachable = BTreeSet::new();
            for dependency in dependencies.get(step_id.as_str()).into_iter().flatten() {
                reachable.insert(dependency.clone());
                if let Some(inherited) = ancestors.get(dependency.as_str()) {
                    reachable.extend(inherited.iter().cloned());
                }
            }
            ancestors.insert(step_id.as_str(), reachable);
        }

        for step_id in &order {
            let (index, step) = lookup[step_id];
            check_templates(index, step, &ancestors[step_id.as_str()], &mut violations);
        }
        if !violations.is_empty() {
            return Err(ValidationError { violations }.into());
        }

        let steps = order
            .iter()
            .map(|step_id| {
                let (_, definition) = lookup[step_id];
                let planned = PlannedStep {
                    definition: definition.clone(),
                    dependencies: dependencies.get(step_id.as_str()).cloned().unwrap_or_default(),
                    ancestors: ancestors.remove(step_id.as_str()).unwrap_or_default(),
                    dependents: dependents.get(step_id.as_str()).cloned().unwrap_or_default(),
                };
                (step_id.clone(), planned)
            })
            .collect();

        Ok(Self { order, steps })
    }

    /// Step ids in a dependency-respecting order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn step(&self, step_id: &str) -> Option<&PlannedStep> {
        self.steps.get(step_id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &PlannedStep> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every step that transitively depends on `step_id`.
    pub fn descendants(&self, step_id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut stack: Vec<&str> = vec![step_id];
        while let Some(current) = stack.pop() {
            for child in self.steps.get(current).map(|step| step.dependents.as_slice()).unwrap_or_default() {
                if found.insert(child.clone()) {
                    stack.push(child);
                }
            }
        }
        found
    }
}

fn check_templates(index: usize, step: &StepDefinition, ancestors: &BTreeSet<String>, violations: &mut Vec<Violation>) {
    let mut occurrences = Vec::new();
    for (key, value) in &step.params {
        collect_templates_from_value(value, key, &mut occurrences);
    }
    for occurrence in occurrences {
        let path = format!("workflow.steps[{index}].params.{}", occurrence.source_path);
        match occurrence.outcome {
            Err(error) => violations.push(Violation::new(path, format!("{} in '{}'", error.reason, error.template))),
            Ok(reference) if !ancestors.contains(&reference.step_id) => violations.push(Violation::new(
                path,
                format!(
                    "template '{{{{{}}}}}' references step '{}', which step '{}' does not depend on",
                    reference.expression, reference.step_id, step.step_id
                ),
            )),
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            steps,
            ..Default::default()
        }
    }

    #[test]
    fn plan_respects_dependencies_even_when_declared_out_of_order() {
        let plan = ExecutionPlan::build(&workflow(vec![
            StepDefinition::new("second", "echo").depends_on(["first"]),
            StepDefinition::new("first", "echo"),
        ]))
        .expect("plan");
        assert_eq!(plan.order(), ["first", "second"]);
    }

    #[test]
    fn forward_edges_are_accepted_and_one_back_edge_is_rejected() {
        let forward = vec![
            StepDefinition::new("a", "echo"),
            StepDefinition::new("b", "echo").depends_on(["a"]),
            StepDefinition::new("c", "echo").depends_on(["a", "b"]),
            StepDefinition::new("d", "echo").depends_on(["c"]),
        ];
        let plan = ExecutionPlan::build(&workflow(forward.clone())).expect("acyclic");
        assert_eq!(plan.len(), 4);

        let mut with_back_edge = forward;
        with_back_edge[1].depends_on.push("d".into());
        let error = ExecutionPlan::build(&workflow(with_back_edge)).expect_err("cycle");
        match error {
            EngineError::CyclicWorkflow { steps } => assert_eq!(steps, vec!["b", "c", "d"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_dependency_is_a_validation_error() {
        let error = ExecutionPlan::build(&workflow(vec![StepDefinition::new("only", "echo").depends_on(["missing"])]))
            .expect_err("unknown dependency");
        assert!(error.to_string().contains("unknown step 'missing'"), "unexpected error: {error}");
    }

    #[test]
    fn ancestors_and_descendants_are_transitive() {
        let plan = ExecutionPlan::build(&workflow(vec![
            StepDefinition::new("a", "echo"),
            StepDefinition::new("b", "echo").depends_on(["a", "a"]),
            StepDefinition::new("c", "echo").depends_on(["b"]),
            StepDefinition::new("side", "echo"),
        ]))
        .expect("plan");

        let c = plan.step("c").expect("c planned");
        assert_eq!(c.dependencies, vec!["b"]);
        assert_eq!(c.ancestors.iter().map(String::as_str).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(plan.step("b").expect("b planned").dependencies, vec!["a"]);
        assert_eq!(plan.descendants("a").into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(plan.descendants("side").is_empty());
    }

    #[test]
    fn templates_must_reference_transitive_dependencies() {
        let steps = vec![
            StepDefinition::new("a", "echo"),
            StepDefinition::new("b", "echo").depends_on(["a"]),
            StepDefinition::new("c", "echo")
                .depends_on(["b"])
                .with_params(json!({ "from_a": "{{a.value}}", "from_side": "{{side.value}}", "broken": "{{a.value" })),
            StepDefinition::new("side", "echo"),
        ];
        let error = ExecutionPlan::build(&workflow(steps)).expect_err("template violations");
        let EngineError::Validation(validation) = error else {
            panic!("expected validation error");
        };
        let mut paths: Vec<&str> = validation.violations.iter().map(|violation| violation.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["workflow.steps[2].params.broken", "workflow.steps[2].params.from_side"]);
    }
}
