//! Dependency executor: runs a job's task graph with bounded parallelism.
//!
//! Each eligible node is spawned as its own tokio task. When a task fails
//! the handler's recovery hook is consulted; a recovered node publishes its
//! fallback into the job's [`RecoveryChannel`] *before* it is marked
//! `Recovered`, so any dependent dispatched afterwards can see it.
//!
//! A required node that fails without recovery aborts the run: in-flight
//! tasks are cancelled through a child token and pending nodes are failed
//! without executing.
//!
//! [`RecoveryChannel`]: crate::dag::recovery::RecoveryChannel

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reelsmith_common::{ErrorCode, JobFailure};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::artifact::Artifact;
use crate::dag::builder::NodeIndex;
use crate::dag::context::{TaskContext, UpstreamResult};
use crate::dag::node::{GenerationNode, NodeState};
use crate::dag::recovery::Published;
use crate::dag::scheduler::{DagConfig, DagScheduler};
use crate::dag::state::{ExecutionTimer, NodeOutcome, OrchestrationProgress, OrchestrationResult};
use crate::errors::{OrchestratorError, TaskError};
use crate::job::JobContext;

/// The task function and optional recovery function of a job.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, node: &GenerationNode, ctx: &TaskContext) -> Result<Artifact, TaskError>;

    /// Produce a fallback artifact for a failed node. The default has none.
    async fn recover(
        &self,
        _node: &GenerationNode,
        _error: &TaskError,
        _ctx: &TaskContext,
    ) -> Option<Artifact> {
        None
    }
}

/// What a spawned task reports back to the executor loop.
#[derive(Debug)]
enum TaskOutcome {
    Succeeded(Artifact),
    Recovered { error: TaskError, fallback: Artifact },
    Failed(TaskError),
}

pub struct DagExecutor {
    config: DagConfig,
    event_tx: Option<mpsc::Sender<OrchestrationProgress>>,
}

impl DagExecutor {
    pub fn new(config: DagConfig) -> Self {
        Self {
            config,
            event_tx: None,
        }
    }

    /// Set the channel that receives one event per node transition.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<OrchestrationProgress>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Execute every node of the graph.
    ///
    /// Returns `Err` only when the graph itself is invalid; task failures
    /// are reported through [`OrchestrationResult`].
    pub async fn execute<H>(
        &self,
        nodes: Vec<GenerationNode>,
        handler: Arc<H>,
        job: &JobContext,
    ) -> Result<OrchestrationResult, OrchestratorError>
    where
        H: TaskHandler + 'static,
    {
        let timer = ExecutionTimer::start();
        let mut sched = DagScheduler::from_nodes(nodes)?;

        debug!(
            job_id = %job.job_id,
            nodes = sched.node_count(),
            waves = ?sched.graph().compute_waves(),
            "Task graph validated"
        );

        // Aborting on a required failure must not look like a user cancel,
        // so tasks observe a child of the job token.
        let run_job = job.with_cancel(job.cancel.child_token());
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut in_flight: JoinSet<(NodeIndex, TaskOutcome)> = JoinSet::new();
        let mut spawned_ids: HashMap<tokio::task::Id, NodeIndex> = HashMap::new();
        let mut first_failure: Option<JobFailure> = None;

        loop {
            if !run_job.cancel.is_cancelled() {
                for index in sched.ready_nodes() {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    self.transition(&mut sched, index, NodeState::Running, None)
                        .await?;

                    let node = sched.node(index).clone();
                    let ctx = TaskContext::new(
                        node.task_id.clone(),
                        upstream_snapshot(&sched, index),
                        run_job.clone(),
                    );
                    let handler = handler.clone();
                    let span = info_span!("task", task_id = %node.task_id);

                    let handle = in_flight.spawn(
                        async move {
                            let _permit = permit;
                            let outcome = run_node(handler.as_ref(), &node, &ctx).await;
                            (index, outcome)
                        }
                        .instrument(span),
                    );
                    spawned_ids.insert(handle.id(), index);
                }
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };

            let (index, outcome) = match joined {
                Ok((_, pair)) => pair,
                Err(join_err) => {
                    let Some(&index) = spawned_ids.get(&join_err.id()) else {
                        warn!(error = %join_err, "Lost track of a failed task");
                        continue;
                    };
                    let msg = if join_err.is_panic() {
                        "task panicked"
                    } else {
                        "task aborted"
                    };
                    (
                        index,
                        TaskOutcome::Failed(TaskError::new(ErrorCode::Internal, msg)),
                    )
                }
            };

            match outcome {
                TaskOutcome::Succeeded(artifact) => {
                    sched.mark_succeeded(index, artifact)?;
                    self.emit(&sched, index, NodeState::Running, None).await;
                }
                TaskOutcome::Recovered { error, fallback } => {
                    let node = sched.node(index);
                    if run_job.recovery.publish(
                        &node.task_id,
                        node.canonical_key.as_deref(),
                        fallback,
                    ) == Published::TaskSlotTaken
                    {
                        warn!(task_id = %node.task_id, "Recovery slot already filled");
                    }
                    info!(
                        job_id = %job.job_id,
                        task_id = %node.task_id,
                        error = %error,
                        "Task recovered with fallback"
                    );
                    let msg = error.to_string();
                    sched.mark_recovered(index, error)?;
                    self.emit(&sched, index, NodeState::Running, Some(msg)).await;
                }
                TaskOutcome::Failed(error) => {
                    let msg = error.to_string();
                    let required = !sched.node(index).optional;
                    if required && !error.is_canceled() && first_failure.is_none() {
                        first_failure = Some(error.to_failure());
                    }
                    warn!(
                        job_id = %job.job_id,
                        task_id = %sched.node(index).task_id,
                        optional = !required,
                        error = %msg,
                        "Task failed"
                    );
                    sched.mark_failed(index, error)?;
                    self.emit(&sched, index, NodeState::Running, Some(msg)).await;

                    if required && !run_job.cancel.is_cancelled() {
                        run_job.cancel.cancel();
                    }
                }
            }

            for cascaded in sched.cascade_failures() {
                let msg = sched.node(cascaded).error.as_ref().map(TaskError::to_string);
                self.emit(&sched, cascaded, NodeState::Pending, msg).await;
            }
        }

        // Anything still pending never got to run.
        let cancelled = job.cancel.is_cancelled();
        for index in 0..sched.node_count() {
            if sched.node(index).state == NodeState::Pending {
                let task_id = sched.node(index).task_id.clone();
                let error = if cancelled {
                    TaskError::canceled(&task_id)
                } else {
                    TaskError::new(
                        ErrorCode::DependencyFailed,
                        format!("Task {} was never eligible to run", task_id),
                    )
                };
                let msg = error.to_string();
                sched.mark_failed(index, error)?;
                self.emit(&sched, index, NodeState::Pending, Some(msg)).await;
            }
        }

        if first_failure.is_none()
            && !cancelled
            && let Some(node) = sched.first_required_failure()
        {
            first_failure = node.error.as_ref().map(TaskError::to_failure);
        }

        let success = !cancelled && first_failure.is_none() && sched.all_terminal();
        let outcomes = sched
            .nodes()
            .iter()
            .map(|n| (n.task_id.clone(), NodeOutcome::from(n)))
            .collect();

        info!(
            job_id = %job.job_id,
            success,
            cancelled,
            succeeded = sched.count(NodeState::Succeeded),
            recovered = sched.count(NodeState::Recovered),
            failed = sched.count(NodeState::Failed),
            "Task graph finished"
        );

        Ok(OrchestrationResult {
            success,
            cancelled,
            failure: first_failure,
            outcomes,
            duration: timer.elapsed(),
        })
    }

    async fn transition(
        &self,
        sched: &mut DagScheduler,
        index: NodeIndex,
        to: NodeState,
        error: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let from = sched.transition(index, to)?;
        self.emit(sched, index, from, error).await;
        Ok(())
    }

    /// Emit an event for a transition that has already been applied.
    async fn emit(
        &self,
        sched: &DagScheduler,
        index: NodeIndex,
        from: NodeState,
        error: Option<String>,
    ) {
        let node = sched.node(index);
        debug!(task_id = %node.task_id, from = from.as_str(), to = node.state.as_str(), "Node transition");
        if let Some(ref tx) = self.event_tx {
            tx.send(OrchestrationProgress {
                task_id: node.task_id.clone(),
                task_type: node.task_type,
                from,
                to: node.state,
                error,
                at: Utc::now(),
            })
            .await
            .ok();
        }
    }
}

fn upstream_snapshot(sched: &DagScheduler, index: NodeIndex) -> HashMap<String, UpstreamResult> {
    sched
        .graph()
        .dependencies(index)
        .iter()
        .map(|&d| {
            let dep = sched.node(d);
            (
                dep.task_id.clone(),
                UpstreamResult {
                    state: dep.state,
                    result: dep.result.clone(),
                },
            )
        })
        .collect()
}

/// Run one node's body under its time budget, then its recovery hook.
async fn run_node<H>(handler: &H, node: &GenerationNode, ctx: &TaskContext) -> TaskOutcome
where
    H: TaskHandler + ?Sized,
{
    let cancel = ctx.cancel_token().clone();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TaskError::canceled(&node.task_id)),
        timed = tokio::time::timeout(node.timeout, handler.run(node, ctx)) => match timed {
            Ok(result) => result,
            Err(_) => Err(TaskError::timeout(&node.task_id, node.timeout)),
        },
    };

    let error = match result {
        Ok(artifact) => return TaskOutcome::Succeeded(artifact),
        Err(error) if error.is_canceled() || cancel.is_cancelled() => {
            return TaskOutcome::Failed(TaskError::canceled(&node.task_id));
        }
        Err(error) => error,
    };

    // Recovery gets the same budget as the task body.
    let recovered = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        timed = tokio::time::timeout(node.timeout, handler.recover(node, &error, ctx)) => {
            timed.unwrap_or_else(|_| {
                warn!(task_id = %node.task_id, timeout_ms = node.timeout.as_millis() as u64, "Recovery timed out");
                None
            })
        }
    };
    match recovered {
        Some(fallback) => TaskOutcome::Recovered { error, fallback },
        None => TaskOutcome::Failed(error),
    }
}
