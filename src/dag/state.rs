//! Execution state tracking for the dependency executor.
//!
//! This module provides the types the executor reports with: one
//! progress event per node transition and the final orchestration result.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::dag::node::{GenerationNode, NodeState, TaskType};
use crate::errors::TaskError;
use reelsmith_common::JobFailure;

/// Emitted once per node state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationProgress {
    pub task_id: String,
    pub task_type: TaskType,
    pub from: NodeState,
    pub to: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Final per-node record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub task_id: String,
    pub task_type: TaskType,
    pub state: NodeState,
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&GenerationNode> for NodeOutcome {
    fn from(node: &GenerationNode) -> Self {
        Self {
            task_id: node.task_id.clone(),
            task_type: node.task_type,
            state: node.state,
            optional: node.optional,
            result: node.result.clone(),
            error: node.error.as_ref().map(TaskError::to_string),
        }
    }
}

/// Result of executing a task graph.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    /// Every node terminal and no required node failed.
    pub success: bool,
    /// Execution stopped because the job was canceled.
    pub cancelled: bool,
    /// First unrecoverable failure, if any.
    pub failure: Option<JobFailure>,
    pub outcomes: HashMap<String, NodeOutcome>,
    pub duration: Duration,
}

impl OrchestrationResult {
    pub fn outcome(&self, task_id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(task_id)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.outcomes.values().filter(|o| o.state == state).count()
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
