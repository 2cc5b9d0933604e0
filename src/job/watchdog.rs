//! Background scan that fails jobs whose percent stopped moving and
//! forgets jobs that finished long ago.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reelsmith_common::{ErrorCode, JobFailure, JobId, is_stuck, stall_threshold};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::job::registry::JobRegistry;

/// How long finished jobs stay queryable unless configured otherwise.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

pub struct Watchdog {
    registry: JobRegistry,
    interval: Duration,
    retention: Duration,
}

impl Watchdog {
    pub fn new(registry: JobRegistry, interval: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(Duration::from_millis(10)),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Fail every running job that has been silent past its threshold at
    /// `now`. Returns the ids that were failed.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut failed = Vec::new();
        for job in self.registry.running() {
            let silent = (now - job.last_progress_at).to_std().unwrap_or_default();
            if !is_stuck(job.percent, silent) {
                continue;
            }

            let failure = JobFailure::new(
                ErrorCode::Stuck,
                format!(
                    "No progress for {}s at {}% (limit {}s)",
                    silent.as_secs(),
                    job.percent,
                    stall_threshold(job.percent).as_secs()
                ),
            );
            // The job may have finished since the snapshot was taken.
            match self.registry.fail(job.id, failure).await {
                Ok(_) => {
                    warn!(job_id = %job.id, percent = job.percent, stage = %job.stage, "Job stuck");
                    failed.push(job.id);
                }
                Err(e) => debug!(job_id = %job.id, error = %e, "Stuck job already settled"),
            }
        }
        failed
    }

    /// Run scans until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        self.scan_at(now).await;
                        self.registry.evict_finished(now, self.retention);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StageRanges;
    use crate::store::JobStore;
    use reelsmith_common::{JobStatus, Stage};

    async fn job_at(registry: &JobRegistry, percent: u8) -> (JobId, DateTime<Utc>) {
        let ctx = registry.create("test").await.unwrap();
        registry.start(ctx.job_id).await.unwrap();
        registry
            .record_progress(ctx.job_id, Stage::Render, percent)
            .unwrap();
        let since = registry.get(ctx.job_id).unwrap().last_progress_at;
        (ctx.job_id, since)
    }

    #[tokio::test]
    async fn test_frozen_at_95_is_not_stuck_after_4_minutes() {
        let registry = JobRegistry::new(JobStore::default(), StageRanges::default());
        let (id, since) = job_at(&registry, 95).await;
        let watchdog = Watchdog::new(registry.clone(), Duration::from_secs(1));

        let failed = watchdog.scan_at(since + chrono::Duration::minutes(4)).await;
        assert!(failed.is_empty());
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_frozen_at_95_is_stuck_after_11_minutes() {
        let registry = JobRegistry::new(JobStore::default(), StageRanges::default());
        let (id, since) = job_at(&registry, 95).await;
        let watchdog = Watchdog::new(registry.clone(), Duration::from_secs(1));

        let failed = watchdog.scan_at(since + chrono::Duration::minutes(11)).await;
        assert_eq!(failed, vec![id]);

        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure.unwrap().error_code, ErrorCode::Stuck);
        assert_eq!(
            registry.store().get(id).unwrap().error_code,
            Some(ErrorCode::Stuck)
        );
    }

    #[tokio::test]
    async fn test_low_percent_uses_short_threshold() {
        let registry = JobRegistry::new(JobStore::default(), StageRanges::default());
        let (id, since) = job_at(&registry, 10).await;
        let watchdog = Watchdog::new(registry.clone(), Duration::from_secs(1));

        assert_eq!(
            watchdog.scan_at(since + chrono::Duration::minutes(4)).await,
            vec![id]
        );
    }

    #[tokio::test]
    async fn test_watchdog_and_client_watcher_agree() {
        use crate::client::{WatchOutcome, WatchState};
        use reelsmith_common::JobView;

        let secs = |m: u64, s: u64| Duration::from_secs(m * 60 + s);
        let cases = [
            (10, secs(2, 59)),
            (10, secs(3, 0)),
            (10, secs(3, 1)),
            (49, secs(3, 30)),
            (50, secs(3, 30)),
            (50, secs(4, 1)),
            (69, secs(4, 30)),
            (70, secs(4, 30)),
            (89, secs(5, 1)),
            (90, secs(5, 1)),
            (95, secs(4, 0)),
            (95, secs(10, 0)),
            (95, secs(11, 0)),
        ];

        for (percent, silent) in cases {
            let registry = JobRegistry::new(JobStore::default(), StageRanges::default());
            let (id, since) = job_at(&registry, percent).await;
            let view = JobView::from(&registry.get(id).unwrap());

            let server = !Watchdog::new(registry.clone(), Duration::from_secs(1))
                .scan_at(since + chrono::Duration::from_std(silent).unwrap())
                .await
                .is_empty();

            let mut watcher = WatchState::default();
            assert!(watcher.observe(view.clone(), Duration::ZERO).is_none());
            let client = matches!(watcher.observe(view, silent), Some(WatchOutcome::Stuck(_)));

            assert_eq!(
                server, client,
                "disagree at {}% after {}s",
                percent,
                silent.as_secs()
            );
        }
    }
}
