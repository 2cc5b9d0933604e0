//! DAG builder for constructing dependency graphs from generation nodes.
//!
//! The builder takes the planned nodes of a job and constructs a directed
//! acyclic graph that the scheduler uses to decide eligibility.

use std::collections::HashMap;

use crate::dag::node::GenerationNode;
use crate::errors::OrchestratorError;

/// Index into the node list.
pub type NodeIndex = usize;

/// Topology of a job's task graph. Node state lives in the scheduler.
#[derive(Debug)]
pub struct TaskGraph {
    /// Task ids indexed by position
    task_ids: Vec<String>,
    /// Map from task id to index
    index_map: HashMap<String, NodeIndex>,
    /// Forward edges: index -> nodes that depend on it
    forward_edges: Vec<Vec<NodeIndex>>,
    /// Reverse edges: index -> nodes it depends on
    reverse_edges: Vec<Vec<NodeIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    pub fn task_id(&self, index: NodeIndex) -> Option<&str> {
        self.task_ids.get(index).map(String::as_str)
    }

    pub fn get_index(&self, task_id: &str) -> Option<NodeIndex> {
        self.index_map.get(task_id).copied()
    }

    /// Nodes that depend on the given node.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Nodes the given node depends on.
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Nodes with no dependencies.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Group nodes into waves: every node's dependencies live in earlier waves.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut depth: Vec<Option<usize>> = vec![None; self.len()];
        let mut waves: Vec<Vec<String>> = Vec::new();

        // Acyclicity is checked in build(), so each pass places at least one node.
        while depth.iter().any(Option::is_none) {
            let placed: Vec<(NodeIndex, usize)> = (0..self.len())
                .filter(|&i| depth[i].is_none())
                .filter_map(|i| {
                    let deps = self.dependencies(i);
                    let mut max = None::<usize>;
                    for &d in deps {
                        let dd = depth[d]?;
                        max = Some(max.map_or(dd, |m| m.max(dd)));
                    }
                    Some((i, max.map_or(0, |m| m + 1)))
                })
                .collect();
            if placed.is_empty() {
                break;
            }
            for (i, level) in placed {
                depth[i] = Some(level);
                if waves.len() <= level {
                    waves.resize_with(level + 1, Vec::new);
                }
                waves[level].push(self.task_ids[i].clone());
            }
        }
        waves
    }
}

/// Builder for constructing task graphs.
pub struct DagBuilder<'a> {
    nodes: &'a [GenerationNode],
}

impl<'a> DagBuilder<'a> {
    pub fn new(nodes: &'a [GenerationNode]) -> Self {
        Self { nodes }
    }

    /// Build the graph.
    ///
    /// This validates the graph structure:
    /// - Task ids must be unique
    /// - All dependencies must reference existing tasks
    /// - No cycles are allowed
    pub fn build(self) -> Result<TaskGraph, OrchestratorError> {
        let mut index_map = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index_map.insert(node.task_id.clone(), i).is_some() {
                return Err(OrchestratorError::DuplicateTask {
                    task_id: node.task_id.clone(),
                });
            }
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); self.nodes.len()];

        for (to_idx, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| OrchestratorError::UnknownDependency {
                            task_id: node.task_id.clone(),
                            dependency: dep.clone(),
                        })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = TaskGraph {
            task_ids: self.nodes.iter().map(|n| n.task_id.clone()).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &TaskGraph) -> Result<(), OrchestratorError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(Vec::len).collect();

        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let involved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.task_id(i).map(String::from))
                .collect();

            return Err(OrchestratorError::Cycle { involved });
        }

        Ok(())
    }
}
