// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! DAG representation of a workflow's dependency graph.
//!
//! Steps are arena-allocated petgraph nodes addressed by integer indices;
//! edges point from a dependency to its dependent. Cycle detection happens
//! at construction time so the executor can assume acyclicity.

use crate::error::{EngineError, Result};
use crate::workflow::Workflow;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Dependency graph over the top-level steps of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    /// Builds the DAG from a workflow's top-level steps.
    ///
    /// Fails with a validation error if the dependency graph contains a
    /// cycle (direct or transitive).
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for step in &workflow.steps {
            let idx = graph.add_node(step.id.clone());
            indices.insert(step.id.clone(), idx);
        }

        for step in &workflow.steps {
            let to = indices[&step.id];
            for dep in &step.depends_on {
                // Dependencies on nested step ids are resolved at run time;
                // only edges between top-level steps shape the schedule.
                if let Some(&from) = indices.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let dag = Self { graph, indices };
        dag.execution_order()?;
        Ok(dag)
    }

    /// Topological execution order of step ids.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()].clone();
            EngineError::Validation(format!("dependency cycle involving step '{}'", id))
        })?;
        Ok(sorted.into_iter().map(|i| self.graph[i].clone()).collect())
    }

    /// Ids of steps that directly depend on `step_id`.
    pub fn dependents(&self, step_id: &str) -> Vec<String> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    /// Ids of steps that `step_id` directly depends on.
    pub fn dependencies(&self, step_id: &str) -> Vec<String> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Number of steps in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, step_id: &str, dir: Direction) -> Vec<String> {
        match self.indices.get(step_id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, dir)
                .map(|i| self.graph[i].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}
