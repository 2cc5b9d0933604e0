use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::artifact::Artifact;
use crate::dag::node::NodeState;
use crate::dag::recovery::RecoveryChannel;
use crate::job::{JobContext, ProgressReporter, StageRanges};

/// Snapshot of one dependency at the moment the dependent was dispatched.
#[derive(Debug, Clone)]
pub struct UpstreamResult {
    pub state: NodeState,
    pub result: Option<Artifact>,
}

/// Everything a task body may touch: its dependencies' results and the
/// job-wide context. Built by the executor per dispatch.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    upstream: HashMap<String, UpstreamResult>,
    job: JobContext,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        upstream: HashMap<String, UpstreamResult>,
        job: JobContext,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            upstream,
            job,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn upstream(&self, task_id: &str) -> Option<&UpstreamResult> {
        self.upstream.get(task_id)
    }

    /// Result of a dependency that succeeded normally.
    pub fn direct_result(&self, task_id: &str) -> Option<&Artifact> {
        self.upstream
            .get(task_id)
            .filter(|u| u.state == NodeState::Succeeded)
            .and_then(|u| u.result.as_ref())
    }

    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn recovery(&self) -> &RecoveryChannel {
        &self.job.recovery
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.job.cancel
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.job.progress
    }

    pub fn ranges(&self) -> &StageRanges {
        &self.job.ranges
    }
}
