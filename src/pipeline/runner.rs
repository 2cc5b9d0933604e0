//! Drives one job through the task graph and into a terminal state.

use std::path::PathBuf;
use std::sync::Arc;

use reelsmith_common::{ErrorCode, Job, JobFailure, JobId, JobStatus};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span};

use crate::artifact::Brief;
use crate::dag::{DagConfig, DagExecutor, NodeState, OrchestrationProgress, OrchestrationResult};
use crate::errors::RegistryError;
use crate::job::{JobContext, JobRegistry};
use crate::pipeline::tasks::GenerationTasks;
use crate::pipeline::{COMPOSE_TASK, PipelineSettings, Providers, plan};

#[derive(Clone)]
pub struct JobRunner {
    registry: JobRegistry,
    providers: Providers,
    settings: Arc<PipelineSettings>,
    observer: Option<mpsc::Sender<OrchestrationProgress>>,
}

impl JobRunner {
    pub fn new(registry: JobRegistry, providers: Providers, settings: PipelineSettings) -> Self {
        Self {
            registry,
            providers,
            settings: Arc::new(settings),
            observer: None,
        }
    }

    /// Also forward every task transition to `tx`.
    pub fn with_task_events(mut self, tx: mpsc::Sender<OrchestrationProgress>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Queue a job and run it in the background.
    pub async fn submit(&self, brief: Brief, correlation_id: Option<String>) -> Result<JobId, RegistryError> {
        let ctx = self
            .registry
            .create(correlation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
            .await?;
        let id = ctx.job_id;
        let runner = self.clone();
        tokio::spawn(async move {
            runner.run(ctx, brief).await;
        });
        Ok(id)
    }

    /// Run a queued job to completion and return its final record.
    pub async fn run(&self, ctx: JobContext, brief: Brief) -> Option<Job> {
        let span = info_span!(
            "job",
            job_id = %ctx.job_id,
            correlation_id = %ctx.correlation_id
        );
        async move {
            self.drive(&ctx, brief).await;
            self.registry.get(ctx.job_id)
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, ctx: &JobContext, brief: Brief) {
        let id = ctx.job_id;
        if ctx.cancel.is_cancelled() {
            debug!("Job canceled before dispatch");
            return;
        }

        let work_dir = self.settings.work_dir.join(id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            self.settle(
                id,
                Err(JobFailure::new(
                    ErrorCode::Internal,
                    format!("Failed to create {}: {}", work_dir.display(), e),
                )),
            )
            .await;
            return;
        }

        if let Err(e) = self.registry.start(id).await {
            debug!(error = %e, "Job not started");
            return;
        }
        info!(title = %brief.title, work_dir = %work_dir.display(), "Job running");

        let handler = Arc::new(GenerationTasks::new(
            brief,
            self.providers.clone(),
            self.settings.clone(),
            work_dir,
        ));
        let (tx, rx) = mpsc::channel(64);
        let stage_events = tokio::spawn(follow_stages(rx, ctx.clone(), self.observer.clone()));

        let executed = DagExecutor::new(DagConfig::default().with_max_parallel(self.settings.max_parallel))
            .with_event_channel(tx)
            .execute(plan(&self.settings.timeouts), handler, ctx)
            .await;
        stage_events.await.ok();

        let outcome = match executed {
            Ok(result) => outcome_of(&result),
            Err(e) => {
                error!(error = %e, "Task graph rejected");
                Outcome::Failed(JobFailure::new(ErrorCode::Internal, e.to_string()))
            }
        };

        match outcome {
            Outcome::Done(output) => self.settle(id, Ok(output)).await,
            Outcome::Failed(failure) => self.settle(id, Err(failure)).await,
            Outcome::Canceled => {
                // Already terminal if canceled by request or by the watchdog.
                if let Err(e) = self.registry.cancel(id).await {
                    debug!(error = %e, "Cancel already recorded");
                }
            }
        }
    }

    async fn settle(&self, id: JobId, result: Result<PathBuf, JobFailure>) {
        let settled = match result {
            Ok(output) => self.registry.complete(id, output).await,
            Err(failure) => self.registry.fail(id, failure).await,
        };
        match settled {
            Ok(job) if job.status == JobStatus::Done => {}
            Ok(job) => debug!(status = %job.status, "Job settled without output"),
            Err(e) => debug!(error = %e, "Job was already terminal"),
        }
    }
}

enum Outcome {
    Done(PathBuf),
    Failed(JobFailure),
    Canceled,
}

fn outcome_of(result: &OrchestrationResult) -> Outcome {
    if result.cancelled {
        return Outcome::Canceled;
    }
    if let Some(ref failure) = result.failure {
        return Outcome::Failed(failure.clone());
    }
    let video = result
        .outcome(COMPOSE_TASK)
        .and_then(|o| o.result.as_ref())
        .and_then(|a| a.video_path());
    match video {
        Some(path) if result.success => Outcome::Done(path.to_path_buf()),
        _ => Outcome::Failed(JobFailure::new(
            ErrorCode::Internal,
            "Task graph finished without producing a video",
        )),
    }
}

/// Map node transitions onto stage progress: a stage's band starts when
/// its task starts and is filled when the task settles.
async fn follow_stages(
    mut rx: mpsc::Receiver<OrchestrationProgress>,
    ctx: JobContext,
    observer: Option<mpsc::Sender<OrchestrationProgress>>,
) {
    while let Some(event) = rx.recv().await {
        let stage = event.task_type.stage();
        match event.to {
            NodeState::Running => ctx.progress.stage_started(stage),
            NodeState::Succeeded | NodeState::Recovered => ctx.progress.stage_finished(stage),
            NodeState::Pending | NodeState::Failed => {}
        }
        if let Some(ref tx) = observer {
            let _ = tx.send(event).await;
        }
    }
}
