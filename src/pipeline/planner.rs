//! Execution planning: resolve requested steps, order them, group into levels.

use std::collections::{HashMap, HashSet};

use crate::error::PipelineError;
use crate::pipeline::registry::StepRegistry;

/// Ordered steps for one run, grouped into dependency levels.
///
/// Every step in level `k` has all of its in-plan dependencies in levels
/// below `k`. Steps within a level are independent and may run together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub ordered_steps: Vec<String>,
    pub levels: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.ordered_steps.is_empty()
    }

    pub fn step_count(&self) -> usize {
        self.ordered_steps.len()
    }

    /// First step the run will dispatch.
    pub fn first_step(&self) -> Option<&str> {
        self.ordered_steps.first().map(String::as_str)
    }
}

/// Build a plan for `requested`.
///
/// With `include_dependencies`, the transitive dependencies of every
/// requested step are pulled in and must all be registered. Without it,
/// exactly the requested steps run and edges to steps outside that set are
/// ignored. Requested names must always be registered.
pub fn plan(
    registry: &StepRegistry,
    requested: &[String],
    include_dependencies: bool,
) -> Result<ExecutionPlan, PipelineError> {
    let selected = resolve(registry, requested, include_dependencies)?;
    let ordered_steps = topological_order(registry, &selected)?;
    let levels = group_levels(registry, &ordered_steps)?;

    tracing::debug!(
        requested = ?requested,
        include_dependencies,
        steps = ordered_steps.len(),
        levels = levels.len(),
        "Built execution plan"
    );

    Ok(ExecutionPlan {
        ordered_steps,
        levels,
    })
}

/// The set of steps the run will contain, in first-seen order.
fn resolve(
    registry: &StepRegistry,
    requested: &[String],
    include_dependencies: bool,
) -> Result<Vec<String>, PipelineError> {
    let mut selected = Vec::new();
    let mut seen = HashSet::new();

    if !include_dependencies {
        for name in requested {
            registry.get(name)?;
            if seen.insert(name.clone()) {
                selected.push(name.clone());
            }
        }
        return Ok(selected);
    }

    fn expand(
        registry: &StepRegistry,
        name: &str,
        seen: &mut HashSet<String>,
        selected: &mut Vec<String>,
    ) -> Result<(), PipelineError> {
        if seen.contains(name) {
            return Ok(());
        }
        let step = registry.get(name)?;
        seen.insert(name.to_string());
        for dep in step.dependencies() {
            expand(registry, dep, seen, selected)?;
        }
        selected.push(name.to_string());
        Ok(())
    }

    for name in requested {
        expand(registry, name, &mut seen, &mut selected)?;
    }
    Ok(selected)
}

/// Depth-first post-order over the selected steps, following only edges
/// whose target is also selected. Ties keep first-seen order.
fn topological_order(
    registry: &StepRegistry,
    selected: &[String],
) -> Result<Vec<String>, PipelineError> {
    let in_plan: HashSet<&str> = selected.iter().map(String::as_str).collect();
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(selected.len());

    fn visit<'a>(
        registry: &StepRegistry,
        name: &'a str,
        in_plan: &HashSet<&'a str>,
        visited: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), PipelineError> {
        if !visited.insert(name.to_string()) {
            return Ok(());
        }
        let step = registry.get(name)?;
        for dep in step.dependencies() {
            if let Some(&dep) = in_plan.get(dep.as_str()) {
                visit(registry, dep, in_plan, visited, order)?;
            }
        }
        order.push(name.to_string());
        Ok(())
    }

    for name in selected {
        visit(registry, name, &in_plan, &mut visited, &mut order)?;
    }
    Ok(order)
}

/// Level of a step = 1 + max level of its in-plan dependencies, or 0.
fn group_levels(
    registry: &StepRegistry,
    ordered: &[String],
) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut level_of: HashMap<&str, usize> = HashMap::with_capacity(ordered.len());
    let mut levels: Vec<Vec<String>> = Vec::new();

    for name in ordered {
        let step = registry.get(name)?;
        let level = step
            .dependencies()
            .iter()
            .filter_map(|dep| level_of.get(dep.as_str()))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        level_of.insert(name.as_str(), level);

        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(name.clone());
    }

    Ok(levels)
}
