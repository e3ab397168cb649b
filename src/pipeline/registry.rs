//! Step registry: name → definition, validated acyclic at registration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::pipeline::step::StepDefinition;

/// Registry of pipeline steps.
///
/// Built once at startup, then shared read-only behind an `Arc`.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<StepDefinition>>,
    /// Registration order, used as the stable traversal order for "all steps".
    order: Vec<String>,
}

impl StepRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step.
    ///
    /// Fails with `InvalidStepDefinition` for empty or duplicate names and
    /// malformed dependency lists, and with `CyclicDependency` if the step's
    /// dependency chain loops back through already-registered steps. The
    /// registry is unchanged on failure.
    pub fn register(&mut self, step: StepDefinition) -> Result<(), PipelineError> {
        let name = step.name().to_string();
        let invalid = |reason: &str| PipelineError::InvalidStepDefinition {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.steps.contains_key(&name) {
            return Err(invalid("a step with this name is already registered"));
        }
        let mut seen = HashSet::new();
        for dep in step.dependencies() {
            if dep.trim().is_empty() {
                return Err(invalid("dependency names must not be empty"));
            }
            if !seen.insert(dep.as_str()) {
                return Err(invalid(&format!("dependency {dep:?} listed twice")));
            }
        }

        self.check_cycles(&step)?;

        tracing::debug!(step = %name, deps = ?step.dependencies(), "Registered step");
        self.order.push(name.clone());
        self.steps.insert(name, Arc::new(step));
        Ok(())
    }

    /// Depth-first walk from the candidate through its dependencies.
    ///
    /// `visiting` holds the current path; meeting a node already on it is a
    /// cycle. `visited` holds nodes whose subtrees are fully explored.
    /// Dependencies that are not registered yet are leaves.
    fn check_cycles(&self, candidate: &StepDefinition) -> Result<(), PipelineError> {
        fn walk<'a>(
            name: &'a str,
            lookup: &dyn Fn(&str) -> Option<&'a [String]>,
            visiting: &mut Vec<&'a str>,
            visited: &mut HashSet<&'a str>,
        ) -> Result<(), PipelineError> {
            if let Some(pos) = visiting.iter().position(|n| *n == name) {
                let mut path: Vec<String> =
                    visiting[pos..].iter().map(|s| s.to_string()).collect();
                path.push(name.to_string());
                return Err(PipelineError::CyclicDependency { path });
            }
            if visited.contains(name) {
                return Ok(());
            }
            let Some(deps) = lookup(name) else {
                visited.insert(name);
                return Ok(());
            };

            visiting.push(name);
            for dep in deps {
                walk(dep, lookup, visiting, visited)?;
            }
            visiting.pop();
            visited.insert(name);
            Ok(())
        }

        let lookup = |name: &str| -> Option<&[String]> {
            if name == candidate.name() {
                Some(candidate.dependencies())
            } else {
                self.steps.get(name).map(|s| s.dependencies())
            }
        };

        walk(
            candidate.name(),
            &lookup,
            &mut Vec::new(),
            &mut HashSet::new(),
        )
    }

    /// Get a step definition by name.
    pub fn get(&self, name: &str) -> Result<Arc<StepDefinition>, PipelineError> {
        self.steps
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStep(name.to_string()))
    }

    /// Check if a step exists.
    pub fn has(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// All registered step definitions, in registration order.
    ///
    /// Callers that present steps should sort by priority.
    pub fn list_steps(&self) -> Vec<Arc<StepDefinition>> {
        self.order
            .iter()
            .filter_map(|name| self.steps.get(name).cloned())
            .collect()
    }

    /// All registered step names, in registration order.
    pub fn step_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn count(&self) -> usize {
        self.steps.len()
    }
}
