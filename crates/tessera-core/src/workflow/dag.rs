//! Task graphs, cycle detection and dependency closure.
//!
//! Direct workflows form a transition graph (`on_success` / `on_error` /
//! `on_complete` edges, which may contain loops). Reverse workflows form a
//! `requires` graph that must be acyclic. Both are modelled with `petgraph`.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tessera_types::spec::WorkflowSpec;

use super::definition::SpecError;

// ---------------------------------------------------------------------------
// Transition graph (direct workflows)
// ---------------------------------------------------------------------------

/// Edges between tasks of a direct workflow. Engine commands are not nodes.
#[derive(Debug)]
pub struct TransitionGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> TransitionGraph<'a> {
    /// Build the graph from tasks with workflow defaults applied. Edges to
    /// unknown names are ignored (validation reports them).
    pub fn build(spec: &'a WorkflowSpec) -> Self {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index = HashMap::new();
        for task in &spec.tasks {
            index.insert(task.name.as_str(), graph.add_node(task.name.as_str()));
        }
        for task in &spec.tasks {
            let from = index[task.name.as_str()];
            let effective = task.merged_with(&spec.task_defaults);
            for transition in effective.all_transitions() {
                if let Some(&to) = index.get(transition.task.as_str()) {
                    graph.update_edge(from, to, ());
                }
            }
        }
        Self { graph, index }
    }

    /// Distinct tasks with an edge into `task`, in definition order.
    pub fn inbound(&self, task: &str) -> Vec<&'a str> {
        let Some(&node) = self.index.get(task) else {
            return vec![];
        };
        let mut sources: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        sources.sort();
        sources.into_iter().map(|n| self.graph[n]).collect()
    }

    /// Tasks without inbound edges, in definition order.
    pub fn start_tasks(&self) -> Vec<&'a str> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n])
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Requires graph (reverse workflows)
// ---------------------------------------------------------------------------

/// Check that `requires` references exist and form no cycle.
pub fn validate_requires(spec: &WorkflowSpec) -> Result<(), SpecError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, NodeIndex> = spec
        .tasks
        .iter()
        .map(|t| (t.name.as_str(), graph.add_node(t.name.as_str())))
        .collect();

    for task in &spec.tasks {
        for dep in &task.requires {
            let from = index.get(dep.as_str()).ok_or_else(|| SpecError::UnknownTask {
                workflow: spec.name.clone(),
                task: task.name.clone(),
                target: dep.clone(),
            })?;
            graph.add_edge(*from, index[task.name.as_str()], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| SpecError::Cycle {
        workflow: spec.name.clone(),
        task: graph[cycle.node_id()].to_string(),
    })?;
    Ok(())
}

/// `target` plus every task it transitively requires, in definition order.
///
/// Returns an empty vec if `target` is not a task of `spec`.
pub fn requires_closure<'a>(spec: &'a WorkflowSpec, target: &str) -> Vec<&'a str> {
    if spec.task(target).is_none() {
        return vec![];
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![target];
    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(task) = spec.task(current) {
            stack.extend(task.requires.iter().map(String::as_str));
        }
    }

    spec.tasks
        .iter()
        .map(|t| t.name.as_str())
        .filter(|name| visited.contains(name))
        .collect()
}
