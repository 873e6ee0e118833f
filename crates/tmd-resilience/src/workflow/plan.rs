//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Validated step DAGs."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

use super::step::StepDefinition;

/// Reasons a plan is rejected at construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Two steps share an id.
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
    /// A dependency names a step that is not in the plan.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// Declaring step.
        step: String,
        /// Missing dependency.
        dependency: String,
    },
    /// The dependency graph is not acyclic.
    #[error("dependency cycle detected at step '{0}'")]
    Cycle(String),
}

/// Immutable, acyclic set of step definitions.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    name: String,
    steps: Vec<StepDefinition>,
    order: Vec<usize>,
}

impl WorkflowPlan {
    /// Validate `steps` and build a plan.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<StepDefinition>,
    ) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::<usize, ()>::with_capacity(steps.len(), steps.len());
        let mut nodes = HashMap::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let node = graph.add_node(index);
            if nodes.insert(step.id.as_str(), node).is_some() {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &steps {
            let to = nodes[step.id.as_str()];
            for dependency in &step.dependencies {
                let from = nodes.get(dependency.as_str()).copied().ok_or_else(|| {
                    WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.add_edge(from, to, ());
            }
        }
        let order = toposort(&graph, None)
            .map_err(|cycle| WorkflowError::Cycle(steps[graph[cycle.node_id()]].id.clone()))?
            .into_iter()
            .map(|node| graph[node])
            .collect();

        Ok(Self {
            name: name.into(),
            steps,
            order,
        })
    }

    /// A plan without steps; always approved.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Plan name used in logs and execution records.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Definitions in declaration order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Look up a definition.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Step ids in a valid dependency order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&index| self.steps[index].id.as_str())
            .collect()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
