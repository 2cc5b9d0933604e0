//! Remote job commands: `reelsmith submit` and `reelsmith watch`.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use reelsmith::client::{self, DEFAULT_POLL_INTERVAL, JobClient, WatchOutcome};
use reelsmith::common::{JobId, JobStatus, stall_threshold};
use reelsmith::ui::{JobProgressUi, UiMode};

use super::run::load_brief;

pub async fn cmd_submit(brief_path: &Path, server: &str, watch: bool) -> Result<()> {
    let brief = load_brief(brief_path)?;
    let client = JobClient::new(server);
    let id = client.submit(&brief, None).await?;
    println!("{}", id);

    if watch {
        follow(&client, id, DEFAULT_POLL_INTERVAL, JobProgressUi::new(&brief.title, UiMode::Full)).await?;
    }
    Ok(())
}

pub async fn cmd_watch(server: &str, id: JobId, interval: Duration, mode: UiMode) -> Result<()> {
    let client = JobClient::new(server);
    follow(&client, id, interval, JobProgressUi::new(&id.to_string(), mode)).await
}

async fn follow(client: &JobClient, id: JobId, interval: Duration, ui: JobProgressUi) -> Result<()> {
    match client::watch(client, id, interval, |view| ui.on_view(view)).await? {
        WatchOutcome::Finished(view) => {
            ui.finish(&view);
            if view.status != JobStatus::Done {
                anyhow::bail!("Job {} finished as {}", id, view.status);
            }
            Ok(())
        }
        WatchOutcome::Stuck(view) => {
            ui.stuck(&view, stall_threshold(view.percent));
            anyhow::bail!("Job {} appears stuck at {}%", id, view.percent)
        }
    }
}
