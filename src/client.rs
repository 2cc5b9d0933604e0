//! HTTP client for a running gateway, and the polling watcher behind
//! `reelsmith watch`.
//!
//! The watcher applies the same stall policy as the server watchdog, so a
//! client never gives up on a job the server still considers healthy.

use std::time::Duration;

use anyhow::{Context, Result};
use reelsmith_common::{JobId, JobView, StallTracker};
use tokio::time::Instant;

use crate::artifact::Brief;
use crate::gateway::{CORRELATION_HEADER, SubmitResponse};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct JobClient {
    http: reqwest::Client,
    base_url: String,
}

impl JobClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn submit(&self, brief: &Brief, correlation_id: Option<&str>) -> Result<JobId> {
        let mut req = self.http.post(format!("{}/jobs", self.base_url)).json(brief);
        if let Some(id) = correlation_id {
            req = req.header(CORRELATION_HEADER, id);
        }
        let resp = req
            .send()
            .await
            .context("Failed to send job to gateway")?
            .error_for_status()
            .context("Gateway rejected the job")?;
        let body: SubmitResponse = resp.json().await.context("Failed to parse submit response")?;
        Ok(body.id)
    }

    pub async fn status(&self, id: JobId) -> Result<JobView> {
        let resp = self
            .http
            .get(format!("{}/jobs/{}", self.base_url, id))
            .send()
            .await
            .with_context(|| format!("Failed to poll job {}", id))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Job {} not found on {}", id, self.base_url);
        }
        resp.error_for_status()
            .context("Gateway returned error status")?
            .json::<JobView>()
            .await
            .context("Failed to parse job status")
    }

    pub async fn cancel(&self, id: JobId) -> Result<JobView> {
        self.http
            .post(format!("{}/jobs/{}/cancel", self.base_url, id))
            .send()
            .await
            .with_context(|| format!("Failed to cancel job {}", id))?
            .error_for_status()
            .context("Gateway refused to cancel")?
            .json::<JobView>()
            .await
            .context("Failed to parse cancel response")
    }
}

/// How a watch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    /// The job reached a terminal status.
    Finished(JobView),
    /// Percent froze for longer than the stall threshold allows.
    Stuck(JobView),
}

/// Decides when to stop watching, given successive polls.
#[derive(Debug, Default)]
pub struct WatchState {
    tracker: StallTracker,
}

impl WatchState {
    /// Feed a poll taken `at` after the watch started.
    pub fn observe(&mut self, view: JobView, at: Duration) -> Option<WatchOutcome> {
        if view.status.is_terminal() {
            return Some(WatchOutcome::Finished(view));
        }
        self.tracker.observe(view.percent, at);
        if self.tracker.is_stuck(at) {
            return Some(WatchOutcome::Stuck(view));
        }
        None
    }
}

/// Poll `id` until it finishes or stalls. `on_update` sees every poll.
pub async fn watch<F>(
    client: &JobClient,
    id: JobId,
    interval: Duration,
    mut on_update: F,
) -> Result<WatchOutcome>
where
    F: FnMut(&JobView),
{
    let started = Instant::now();
    let mut state = WatchState::default();
    loop {
        let view = client.status(id).await?;
        on_update(&view);
        if let Some(outcome) = state.observe(view, started.elapsed()) {
            return Ok(outcome);
        }
        tokio::time::sleep(interval).await;
    }
}
