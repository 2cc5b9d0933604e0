//! The generation node model: one task in a job's task graph.

use std::collections::BTreeSet;
use std::time::Duration;

use reelsmith_common::Stage;
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::errors::TaskError;

/// Canonical recovery key for narration audio, whichever task produced it.
pub const AUDIO_KEY: &str = "audio";
/// Canonical recovery key for visual assets.
pub const VISUALS_KEY: &str = "visuals";

/// Default wall-clock budget for a task when none is configured.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Script,
    Narration,
    Visuals,
    Compose,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Narration => "narration",
            Self::Visuals => "visuals",
            Self::Compose => "compose",
        }
    }

    /// Pipeline stage whose percent band this task reports into.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Script => Stage::Script,
            Self::Narration => Stage::Narration,
            Self::Visuals => Stage::Visuals,
            Self::Compose => Stage::Composition,
        }
    }

    pub fn canonical_key(&self) -> Option<&'static str> {
        match self {
            Self::Narration => Some(AUDIO_KEY),
            Self::Visuals => Some(VISUALS_KEY),
            Self::Script | Self::Compose => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Recovered,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Recovered => "recovered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Recovered)
    }

    /// Edges of the per-node state machine. `Pending -> Failed` covers
    /// nodes failed by cascade or cancellation without ever running.
    pub fn can_transition_to(&self, to: NodeState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Recovered)
        )
    }
}

/// One task of a job. Mutated only by the executor; frozen once terminal.
#[derive(Debug, Clone)]
pub struct GenerationNode {
    pub task_id: String,
    pub task_type: TaskType,
    pub dependencies: BTreeSet<String>,
    pub state: NodeState,
    pub result: Option<Artifact>,
    pub error: Option<TaskError>,
    /// A failed optional node does not fail the job, and its dependents
    /// still become eligible.
    pub optional: bool,
    pub canonical_key: Option<String>,
    pub timeout: Duration,
}

impl GenerationNode {
    pub fn new(task_id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            dependencies: BTreeSet::new(),
            state: NodeState::Pending,
            result: None,
            error: None,
            optional: false,
            canonical_key: task_type.canonical_key().map(String::from),
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether dependents of this node may start.
    pub fn unblocks_dependents(&self) -> bool {
        match self.state {
            NodeState::Succeeded | NodeState::Recovered => true,
            NodeState::Failed => self.optional,
            NodeState::Pending | NodeState::Running => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_transition_out_of_terminal_states() {
        for from in [NodeState::Succeeded, NodeState::Failed, NodeState::Recovered] {
            for to in [
                NodeState::Pending,
                NodeState::Running,
                NodeState::Succeeded,
                NodeState::Failed,
                NodeState::Recovered,
            ] {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_recovered_only_from_running() {
        assert!(NodeState::Running.can_transition_to(NodeState::Recovered));
        assert!(!NodeState::Pending.can_transition_to(NodeState::Recovered));
    }

    #[test]
    fn test_narration_defaults_to_audio_key() {
        let node = GenerationNode::new("narration", TaskType::Narration);
        assert_eq!(node.canonical_key.as_deref(), Some(AUDIO_KEY));
        assert_eq!(node.task_type.stage(), Stage::Narration);
    }

    #[test]
    fn test_failed_node_unblocks_only_when_optional() {
        let mut required = GenerationNode::new("a", TaskType::Visuals);
        required.state = NodeState::Failed;
        assert!(!required.unblocks_dependents());

        let mut optional = GenerationNode::new("b", TaskType::Visuals).optional(true);
        optional.state = NodeState::Failed;
        assert!(optional.unblocks_dependents());
    }
}
