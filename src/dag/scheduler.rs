//! Node state tracking and eligibility for a single job's task graph.
//!
//! The scheduler is the only place node state changes. Every change goes
//! through [`DagScheduler::transition`], which enforces the node state
//! machine and therefore the at-most-once guarantee: a node can enter
//! `Running` only from `Pending`, and nothing leaves a terminal state.

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::dag::builder::{DagBuilder, NodeIndex, TaskGraph};
use crate::dag::node::{GenerationNode, NodeState};
use crate::errors::{OrchestratorError, TaskError};
use reelsmith_common::ErrorCode;

/// Configuration for executing a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// Maximum tasks to run in parallel
    pub max_parallel: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self { max_parallel: 4 }
    }
}

impl DagConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }
}

#[derive(Debug)]
pub struct DagScheduler {
    graph: TaskGraph,
    nodes: Vec<GenerationNode>,
}

impl DagScheduler {
    /// Validate the graph and reset every node to `Pending`.
    pub fn from_nodes(mut nodes: Vec<GenerationNode>) -> Result<Self, OrchestratorError> {
        let graph = DagBuilder::new(&nodes).build()?;
        for node in &mut nodes {
            node.state = NodeState::Pending;
            node.result = None;
            node.error = None;
        }
        Ok(Self { graph, nodes })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn nodes(&self) -> &[GenerationNode] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> &GenerationNode {
        &self.nodes[index]
    }

    pub fn get(&self, task_id: &str) -> Option<&GenerationNode> {
        self.graph.get_index(task_id).map(|i| &self.nodes[i])
    }

    /// Pending nodes whose every dependency unblocks dependents.
    pub fn ready_nodes(&self) -> Vec<NodeIndex> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].state == NodeState::Pending)
            .filter(|&i| {
                self.graph
                    .dependencies(i)
                    .iter()
                    .all(|&d| self.nodes[d].unblocks_dependents())
            })
            .collect()
    }

    /// Move a node to `to`, returning its previous state.
    pub fn transition(
        &mut self,
        index: NodeIndex,
        to: NodeState,
    ) -> Result<NodeState, OrchestratorError> {
        let node = &mut self.nodes[index];
        let from = node.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::IllegalTransition {
                task_id: node.task_id.clone(),
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        node.state = to;
        Ok(from)
    }

    pub fn mark_succeeded(
        &mut self,
        index: NodeIndex,
        artifact: Artifact,
    ) -> Result<NodeState, OrchestratorError> {
        let from = self.transition(index, NodeState::Succeeded)?;
        self.nodes[index].result = Some(artifact);
        Ok(from)
    }

    /// A recovered node keeps its direct result slot empty; the fallback
    /// lives in the recovery channel only.
    pub fn mark_recovered(
        &mut self,
        index: NodeIndex,
        error: TaskError,
    ) -> Result<NodeState, OrchestratorError> {
        let from = self.transition(index, NodeState::Recovered)?;
        self.nodes[index].error = Some(error);
        Ok(from)
    }

    pub fn mark_failed(
        &mut self,
        index: NodeIndex,
        error: TaskError,
    ) -> Result<NodeState, OrchestratorError> {
        let from = self.transition(index, NodeState::Failed)?;
        self.nodes[index].error = Some(error);
        Ok(from)
    }

    /// Fail every pending node that can never become eligible because a
    /// required dependency failed. Returns the newly failed nodes in the
    /// order they were failed.
    pub fn cascade_failures(&mut self) -> Vec<NodeIndex> {
        let mut failed = Vec::new();
        loop {
            let blocked: Option<(NodeIndex, String)> = (0..self.nodes.len())
                .filter(|&i| self.nodes[i].state == NodeState::Pending)
                .find_map(|i| {
                    self.graph
                        .dependencies(i)
                        .iter()
                        .map(|&d| &self.nodes[d])
                        .find(|d| d.state == NodeState::Failed && !d.optional)
                        .map(|d| (i, d.task_id.clone()))
                });
            let Some((index, dependency)) = blocked else {
                break;
            };
            let error = TaskError::new(
                ErrorCode::DependencyFailed,
                format!(
                    "Task {} did not run: dependency {} failed",
                    self.nodes[index].task_id, dependency
                ),
            );
            if self.mark_failed(index, error).is_ok() {
                failed.push(index);
            }
        }
        failed
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_terminal())
    }

    /// First required node that ended in `Failed`, if any.
    pub fn first_required_failure(&self) -> Option<&GenerationNode> {
        self.nodes
            .iter()
            .find(|n| n.state == NodeState::Failed && !n.optional)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::node::TaskType;

    fn node(id: &str, deps: Vec<&str>) -> GenerationNode {
        GenerationNode::new(id, TaskType::Visuals).depends_on(deps)
    }

    fn video() -> Artifact {
        Artifact::Video {
            path: "/tmp/v.mp4".into(),
        }
    }

    fn err() -> TaskError {
        TaskError::new(ErrorCode::Internal, "boom")
    }

    #[test]
    fn test_ready_nodes_follow_dependencies() {
        let mut sched = DagScheduler::from_nodes(vec![
            node("a", vec![]),
            node("b", vec!["a"]),
            node("c", vec!["a"]),
        ])
        .unwrap();

        assert_eq!(sched.ready_nodes(), vec![0]);

        sched.transition(0, NodeState::Running).unwrap();
        assert!(sched.ready_nodes().is_empty());

        sched.mark_succeeded(0, video()).unwrap();
        assert_eq!(sched.ready_nodes(), vec![1, 2]);
    }

    #[test]
    fn test_recovered_dependency_unblocks() {
        let mut sched =
            DagScheduler::from_nodes(vec![node("a", vec![]), node("b", vec!["a"])]).unwrap();
        sched.transition(0, NodeState::Running).unwrap();
        sched.mark_recovered(0, err()).unwrap();

        assert_eq!(sched.ready_nodes(), vec![1]);
        assert!(sched.node(0).result.is_none());
    }

    #[test]
    fn test_running_twice_is_rejected() {
        let mut sched = DagScheduler::from_nodes(vec![node("a", vec![])]).unwrap();
        sched.transition(0, NodeState::Running).unwrap();
        assert!(sched.transition(0, NodeState::Running).is_err());

        sched.mark_succeeded(0, video()).unwrap();
        assert!(sched.transition(0, NodeState::Running).is_err());
        assert!(sched.mark_failed(0, err()).is_err());
    }

    #[test]
    fn test_required_failure_cascades() {
        let mut sched = DagScheduler::from_nodes(vec![
            node("a", vec![]),
            node("b", vec!["a"]),
            node("c", vec!["b"]),
        ])
        .unwrap();
        sched.transition(0, NodeState::Running).unwrap();
        sched.mark_failed(0, err()).unwrap();

        let cascaded = sched.cascade_failures();
        assert_eq!(cascaded, vec![1, 2]);
        assert!(sched.all_terminal());
        assert_eq!(
            sched.node(2).error.as_ref().map(|e| e.code),
            Some(ErrorCode::DependencyFailed)
        );
    }

    #[test]
    fn test_optional_failure_does_not_cascade() {
        let mut sched = DagScheduler::from_nodes(vec![
            node("a", vec![]).optional(true),
            node("b", vec!["a"]),
        ])
        .unwrap();
        sched.transition(0, NodeState::Running).unwrap();
        sched.mark_failed(0, err()).unwrap();

        assert!(sched.cascade_failures().is_empty());
        assert_eq!(sched.ready_nodes(), vec![1]);
        assert!(sched.first_required_failure().is_none());
    }

    #[test]
    fn test_state_counts() {
        let mut sched =
            DagScheduler::from_nodes(vec![node("a", vec![]), node("b", vec!["a"])]).unwrap();

        assert!(!sched.all_terminal());
        sched.transition(0, NodeState::Running).unwrap();
        sched.mark_succeeded(0, video()).unwrap();
        assert_eq!(sched.count(NodeState::Succeeded), 1);
        assert_eq!(sched.count(NodeState::Pending), 1);
    }
}
