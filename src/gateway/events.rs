//! Server-sent push channel for one job.
//!
//! A stream opens with `connected`, forwards `progress` as the store
//! accepts new views, and ends with exactly one terminal event
//! (`completed`, `failed`, `cancelled`, or `not_found` when the id never
//! showed up within the lookup window).

use std::convert::Infallible;
use std::ops::ControlFlow;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use reelsmith_common::{JobId, JobView, PushEvent, Stage};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::api::SharedState;
use crate::store::JobStore;

/// Timing of the push channel.
#[derive(Debug, Clone)]
pub struct EventStreamSettings {
    /// How long an unknown id is retried before `not_found`.
    pub lookup_window: Duration,
    pub lookup_interval: Duration,
    /// Comment frames keep idle proxies from closing the stream.
    pub keepalive: Duration,
}

impl Default for EventStreamSettings {
    fn default() -> Self {
        Self {
            lookup_window: Duration::from_secs(20),
            lookup_interval: Duration::from_millis(250),
            keepalive: Duration::from_secs(15),
        }
    }
}

pub(crate) async fn job_events(
    State(state): State<SharedState>,
    Path(id): Path<JobId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(pump(state.store.clone(), id, state.events.clone(), tx));

    let stream = ReceiverStream::new(rx).map(|event: PushEvent| {
        Ok(Event::default()
            .event(event.name())
            .data(event.data().to_string()))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.events.keepalive))
}

/// Feed one subscriber until a terminal event is sent or it hangs up.
pub(crate) async fn pump(
    store: JobStore,
    id: JobId,
    settings: EventStreamSettings,
    tx: mpsc::Sender<PushEvent>,
) {
    if tx.send(PushEvent::Connected { job_id: id }).await.is_err() {
        return;
    }

    // Subscribe before the first lookup so no write falls between them.
    let mut updates = store.subscribe();
    let Some(current) = lookup(&store, id, &settings, &tx).await else {
        let _ = tx.send(PushEvent::NotFound { job_id: id }).await;
        debug!(job_id = %id, "Push stream closed: job not found");
        return;
    };

    let mut cursor = Cursor::default();
    if cursor.forward(&current, &tx).await.is_break() {
        return;
    }

    loop {
        let view = tokio::select! {
            _ = tx.closed() => return,
            received = updates.recv() => match received {
                Ok(view) if view.id == id => view,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(job_id = %id, skipped, "Push stream lagged; resyncing from store");
                    match store.get(id) {
                        Some(view) => view,
                        None => continue,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        if cursor.forward(&view, &tx).await.is_break() {
            return;
        }
    }
}

async fn lookup(
    store: &JobStore,
    id: JobId,
    settings: &EventStreamSettings,
    tx: &mpsc::Sender<PushEvent>,
) -> Option<JobView> {
    let deadline = Instant::now() + settings.lookup_window;
    loop {
        if let Some(view) = store.get(id) {
            return Some(view);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::select! {
            _ = tx.closed() => return None,
            _ = tokio::time::sleep(settings.lookup_interval) => {}
        }
    }
}

/// What the subscriber has already been told.
#[derive(Debug, Default)]
struct Cursor {
    last: Option<(u8, Stage)>,
}

impl Cursor {
    /// Send `view` if it says something new. Breaks once the stream is over.
    async fn forward(
        &mut self,
        view: &JobView,
        tx: &mpsc::Sender<PushEvent>,
    ) -> ControlFlow<()> {
        let event = PushEvent::from_view(view);
        if event.is_terminal() {
            let _ = tx.send(event).await;
            return ControlFlow::Break(());
        }

        let position = (view.percent, view.stage);
        let newer = match self.last {
            None => true,
            Some(last) => position.0 > last.0 || (position.0 == last.0 && position.1 > last.1),
        };
        if newer {
            self.last = Some(position);
            if tx.send(event).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRegistry, StageRanges};
    use chrono::Utc;
    use reelsmith_common::{ErrorCode, Job, JobFailure, JobStatus};
    use std::path::PathBuf;

    fn settings() -> EventStreamSettings {
        EventStreamSettings {
            lookup_window: Duration::from_millis(150),
            lookup_interval: Duration::from_millis(10),
            keepalive: Duration::from_secs(15),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<PushEvent>) -> Vec<PushEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_unknown_job_gets_not_found_after_window() {
        let store = JobStore::default();
        let id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::channel(8);
        let started = Instant::now();
        tokio::spawn(pump(store, id, settings(), tx));

        let events = collect(rx).await;
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], PushEvent::Connected { job_id: id });
        assert_eq!(events[1], PushEvent::NotFound { job_id: id });
    }

    #[tokio::test]
    async fn test_stream_ends_with_one_terminal_event() {
        let registry = JobRegistry::new(JobStore::default(), StageRanges::default());
        let ctx = registry.create("c").await.unwrap();
        let id = ctx.job_id;
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(pump(registry.store().clone(), id, settings(), tx));

        registry.start(id).await.unwrap();
        ctx.progress.stage_started(Stage::Script);
        ctx.progress.report(Stage::Visuals, 50.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let dir = tempfile::tempdir().unwrap();
        let output: PathBuf = dir.path().join("video.mp4");
        std::fs::write(&output, b"mp4").unwrap();
        registry.complete(id, output.clone()).await.unwrap();

        let events = collect(rx).await;
        handle.await.unwrap();

        assert_eq!(events.first().unwrap().name(), "connected");
        let last = events.last().unwrap();
        assert_eq!(last.name(), "completed");
        assert_eq!(last.data()["outputPath"], output.to_string_lossy().as_ref());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let percents: Vec<u64> = events
            .iter()
            .filter(|e| e.name() == "progress")
            .map(|e| e.data()["percent"].as_u64().unwrap())
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|p| *p < 100));
    }

    #[tokio::test]
    async fn test_already_terminal_job_closes_immediately() {
        let registry = JobRegistry::new(JobStore::default(), StageRanges::default());
        let ctx = registry.create("c").await.unwrap();
        registry.cancel(ctx.job_id).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(pump(registry.store().clone(), ctx.job_id, settings(), tx));
        let events = collect(rx).await;

        let names: Vec<&str> = events.iter().map(PushEvent::name).collect();
        assert_eq!(names, vec!["connected", "cancelled"]);
        assert_eq!(events[1].data()["errorCode"], "canceled");
    }

    #[tokio::test]
    async fn test_late_job_is_found_within_window() {
        let store = JobStore::default();
        let mut job = Job::new("late", Utc::now());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(pump(store.clone(), job.id, settings(), tx));

        tokio::time::sleep(Duration::from_millis(40)).await;
        store.write(JobView::from(&job)).await.unwrap();
        job.status = JobStatus::Failed;
        job.failure = Some(JobFailure::new(ErrorCode::Internal, "boom"));
        job.revision += 1;
        store.write(JobView::from(&job)).await.unwrap();

        let names: Vec<&str> = collect(rx).await.iter().map(PushEvent::name).collect();
        assert_eq!(names.first(), Some(&"connected"));
        assert_eq!(names.last(), Some(&"failed"));
        assert!(!names.contains(&"not_found"));
    }
}
