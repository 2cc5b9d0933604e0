//! The job registry: single source of truth for every job.
//!
//! All mutation goes through [`JobRegistry::apply`], which checks the state
//! machine, writes status, percent, stage and output path together, and
//! bumps the revision. Status changes are then replicated to the
//! [`JobStore`] and awaited; progress-only writes are replicated in a
//! spawned task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reelsmith_common::{ErrorCode, Job, JobFailure, JobId, JobStatus, JobView, Stage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::RecoveryChannel;
use crate::errors::RegistryError;
use crate::job::JobContext;
use crate::job::progress::{ProgressReporter, StageRanges};
use crate::store::JobStore;

/// One write to a job record.
#[derive(Debug, Clone)]
enum Update {
    Start,
    Progress { stage: Stage, percent: u8 },
    Complete { output_path: PathBuf },
    Fail(JobFailure),
    Cancel,
}

impl Update {
    fn target(&self) -> Option<JobStatus> {
        match self {
            Self::Start => Some(JobStatus::Running),
            Self::Progress { .. } => None,
            Self::Complete { .. } => Some(JobStatus::Done),
            Self::Fail(_) => Some(JobStatus::Failed),
            Self::Cancel => Some(JobStatus::Canceled),
        }
    }
}

#[derive(Debug)]
struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    recovery: RecoveryChannel,
}

#[derive(Debug)]
struct RegistryInner {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    store: JobStore,
    ranges: StageRanges,
}

/// Shared handle to the registry. Clones refer to the same jobs.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    pub fn new(store: JobStore, ranges: StageRanges) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: Mutex::new(HashMap::new()),
                store,
                ranges,
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn ranges(&self) -> &StageRanges {
        &self.inner.ranges
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new `Queued` job. Returns once the store has it, so a
    /// poll issued right after sees the job.
    pub async fn create(&self, correlation_id: impl Into<String>) -> Result<JobContext, RegistryError> {
        let job = Job::new(correlation_id, Utc::now());
        let ctx = JobContext {
            job_id: job.id,
            correlation_id: job.correlation_id.clone(),
            ranges: self.inner.ranges.clone(),
            recovery: RecoveryChannel::new(),
            cancel: CancellationToken::new(),
            progress: ProgressReporter::new(job.id, self.inner.ranges.clone(), self.clone()),
        };
        let view = JobView::from(&job);

        self.jobs().insert(
            job.id,
            JobEntry {
                job,
                cancel: ctx.cancel.clone(),
                recovery: ctx.recovery.clone(),
            },
        );
        self.inner.store.write(view).await?;

        info!(job_id = %ctx.job_id, correlation_id = %ctx.correlation_id, "Job queued");
        Ok(ctx)
    }

    /// `Queued -> Running`, on first task dispatch.
    pub async fn start(&self, id: JobId) -> Result<Job, RegistryError> {
        self.commit(id, Update::Start).await
    }

    /// Record stage progress. Percent only ever moves up while running;
    /// returns the new percent if the report advanced anything.
    pub fn record_progress(
        &self,
        id: JobId,
        stage: Stage,
        percent: u8,
    ) -> Result<Option<u8>, RegistryError> {
        let Some(job) = self.apply(id, Update::Progress { stage, percent }, Utc::now())? else {
            return Ok(None);
        };

        let view = JobView::from(&job);
        let store = self.inner.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.write(view).await {
                        debug!(error = %e, "Progress replication skipped");
                    }
                });
            }
            Err(_) => warn!(job_id = %id, "No runtime; progress not replicated"),
        }
        Ok(Some(job.percent))
    }

    /// `Running -> Done`, after checking the output exists and is non-empty.
    /// A bad output fails the job instead; the returned job carries the
    /// resulting status either way.
    pub async fn complete(&self, id: JobId, output_path: PathBuf) -> Result<Job, RegistryError> {
        match check_output(&output_path).await {
            Ok(()) => {
                let job = self.commit(id, Update::Complete { output_path }).await?;
                info!(job_id = %id, output = ?job.output_path, "Job done");
                Ok(job)
            }
            Err(failure) => self.fail(id, failure).await,
        }
    }

    pub async fn fail(&self, id: JobId, failure: JobFailure) -> Result<Job, RegistryError> {
        let code = failure.error_code;
        let job = self.commit(id, Update::Fail(failure)).await?;
        warn!(job_id = %id, error_code = %code, error = ?job.error_message(), "Job failed");
        Ok(job)
    }

    /// Cancel a job and fire its token. In-flight work stops cooperatively.
    pub async fn cancel(&self, id: JobId) -> Result<Job, RegistryError> {
        let job = self.commit(id, Update::Cancel).await?;
        info!(job_id = %id, "Job canceled");
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs().get(&id).map(|e| e.job.clone())
    }

    /// Snapshot of every running job.
    pub fn running(&self) -> Vec<Job> {
        self.jobs()
            .values()
            .filter(|e| e.job.status == JobStatus::Running)
            .map(|e| e.job.clone())
            .collect()
    }

    /// Forget jobs that reached a terminal state more than `retention`
    /// before `now`, in both the registry and the store.
    pub fn evict_finished(&self, now: DateTime<Utc>, retention: Duration) -> Vec<JobId> {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        let cutoff = now - retention;
        let evicted: Vec<JobId> = {
            let mut jobs = self.jobs();
            let expired: Vec<JobId> = jobs
                .values()
                .filter(|e| e.job.finished_at.is_some_and(|at| at < cutoff))
                .map(|e| e.job.id)
                .collect();
            for id in &expired {
                jobs.remove(id);
            }
            expired
        };
        for id in &evicted {
            self.inner.store.remove(*id);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted finished jobs");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// Apply a status change and wait for the store to acknowledge it.
    async fn commit(&self, id: JobId, update: Update) -> Result<Job, RegistryError> {
        let job = match self.apply(id, update, Utc::now())? {
            Some(job) => job,
            None => self.get(id).ok_or(RegistryError::JobNotFound { id })?,
        };
        self.inner.store.write(JobView::from(&job)).await?;
        Ok(job)
    }

    /// The single write path. Returns the updated job, or `None` when a
    /// progress report changed nothing.
    fn apply(
        &self,
        id: JobId,
        update: Update,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RegistryError> {
        let mut jobs = self.jobs();
        let entry = jobs.get_mut(&id).ok_or(RegistryError::JobNotFound { id })?;
        let job = &mut entry.job;

        match (update.target(), update) {
            (None, Update::Progress { stage, percent }) => {
                if job.status != JobStatus::Running {
                    return Err(RegistryError::NotRunning {
                        id,
                        status: job.status,
                    });
                }
                let advanced = percent > job.percent;
                if !advanced && !(percent == job.percent && stage > job.stage) {
                    return Ok(None);
                }
                if advanced {
                    job.percent = percent;
                    job.last_progress_at = now;
                }
                job.stage = stage;
            }
            (Some(to), update) => {
                if !job.status.can_transition_to(to) {
                    return Err(RegistryError::InvalidTransition {
                        id,
                        from: job.status,
                        to,
                    });
                }
                job.status = to;
                match update {
                    Update::Start => job.last_progress_at = now,
                    Update::Complete { output_path } => {
                        job.percent = 100;
                        job.stage = Stage::Finalization;
                        job.output_path = Some(output_path);
                    }
                    Update::Fail(failure) => job.failure = Some(failure),
                    Update::Cancel => {
                        job.failure = Some(JobFailure::new(ErrorCode::Canceled, "Job was canceled"))
                    }
                    Update::Progress { .. } => {}
                }
                if to.is_terminal() {
                    job.finished_at = Some(now);
                    entry.cancel.cancel();
                    entry.recovery.clear();
                }
            }
            (None, _) => return Ok(None),
        }

        job.updated_at = now;
        job.revision += 1;
        Ok(Some(job.clone()))
    }
}

async fn check_output(path: &Path) -> Result<(), JobFailure> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(meta) if meta.is_file() => Err(JobFailure::new(
            ErrorCode::OutputEmpty,
            format!("Encoder finished but {} is empty", path.display()),
        )),
        _ => Err(JobFailure::new(
            ErrorCode::OutputNotFound,
            format!("Encoder finished but {} does not exist", path.display()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> JobRegistry {
        JobRegistry::new(JobStore::default(), StageRanges::default())
    }

    async fn running(registry: &JobRegistry) -> JobContext {
        let ctx = registry.create("test").await.unwrap();
        registry.start(ctx.job_id).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_create_is_visible_in_store_immediately() {
        let registry = registry();
        let ctx = registry.create("corr-1").await.unwrap();

        let view = registry.store().get(ctx.job_id).unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.percent, 0);
        assert_eq!(registry.get(ctx.job_id).unwrap().correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn test_percent_is_monotonic_while_running() {
        let registry = registry();
        let ctx = running(&registry).await;
        let id = ctx.job_id;

        assert_eq!(registry.record_progress(id, Stage::Visuals, 40).unwrap(), Some(40));
        assert_eq!(registry.record_progress(id, Stage::Narration, 20).unwrap(), None);
        assert_eq!(registry.record_progress(id, Stage::Visuals, 40).unwrap(), None);

        let job = registry.get(id).unwrap();
        assert_eq!(job.percent, 40);
        assert_eq!(job.stage, Stage::Visuals);
    }

    #[tokio::test]
    async fn test_progress_rejected_unless_running() {
        let registry = registry();
        let ctx = registry.create("test").await.unwrap();

        assert!(matches!(
            registry.record_progress(ctx.job_id, Stage::Script, 5),
            Err(RegistryError::NotRunning { status: JobStatus::Queued, .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_write_is_visible_to_next_poll() {
        let registry = registry();
        let ctx = running(&registry).await;
        registry.record_progress(ctx.job_id, Stage::Render, 90).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        std::fs::write(&output, b"video").unwrap();

        registry.complete(ctx.job_id, output.clone()).await.unwrap();
        let view = registry.store().get(ctx.job_id).unwrap();
        assert_eq!(view.status, JobStatus::Done);
        assert_eq!(view.percent, 100);
        assert_eq!(view.output_path.as_deref(), Some(output.to_str().unwrap()));

        // A late progress replication must not overwrite the terminal state.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.store().get(ctx.job_id).unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_complete_with_missing_output_fails() {
        let registry = registry();
        let ctx = running(&registry).await;
        let dir = tempfile::tempdir().unwrap();

        let job = registry
            .complete(ctx.job_id, dir.path().join("missing.mp4"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.failure.map(|f| f.error_code),
            Some(ErrorCode::OutputNotFound)
        );
        assert!(job.output_path.is_none());
    }

    #[tokio::test]
    async fn test_complete_with_empty_output_fails() {
        let registry = registry();
        let ctx = running(&registry).await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("empty.mp4");
        std::fs::write(&output, b"").unwrap();

        let job = registry.complete(ctx.job_id, output).await.unwrap();
        assert_eq!(job.failure.map(|f| f.error_code), Some(ErrorCode::OutputEmpty));
    }

    #[tokio::test]
    async fn test_cancel_fires_token_and_is_final() {
        let registry = registry();
        let ctx = running(&registry).await;

        let job = registry.cancel(ctx.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(ctx.cancel.is_cancelled());
        assert!(job.finished_at.is_some());

        let err = registry
            .fail(ctx.job_id, JobFailure::new(ErrorCode::Internal, "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(registry.get(ctx.job_id).unwrap().status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_queued_job_can_be_canceled() {
        let registry = registry();
        let ctx = registry.create("test").await.unwrap();
        assert_eq!(
            registry.cancel(ctx.job_id).await.unwrap().status,
            JobStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let registry = registry();
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            registry.start(id).await,
            Err(RegistryError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reporter_routes_through_registry() {
        let registry = registry();
        let ctx = running(&registry).await;

        ctx.progress.report(Stage::Render, 100.0);
        assert_eq!(registry.get(ctx.job_id).unwrap().percent, 99);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_after_retention() {
        let registry = registry();
        let done = running(&registry).await;
        let live = running(&registry).await;
        registry
            .fail(done.job_id, JobFailure::new(ErrorCode::ScriptFailed, "boom"))
            .await
            .unwrap();
        let finished = registry.get(done.job_id).unwrap().finished_at.unwrap();
        let hour = Duration::from_secs(3600);

        assert!(registry
            .evict_finished(finished + chrono::Duration::minutes(30), hour)
            .is_empty());
        assert!(registry.store().get(done.job_id).is_some());

        let evicted = registry.evict_finished(finished + chrono::Duration::hours(2), hour);
        assert_eq!(evicted, vec![done.job_id]);
        assert!(registry.get(done.job_id).is_none());
        assert!(registry.store().get(done.job_id).is_none());

        // Running jobs are never evicted, however old.
        assert!(registry.get(live.job_id).is_some());
        assert!(registry.store().get(live.job_id).is_some());
        assert_eq!(registry.len(), 1);
    }
}
