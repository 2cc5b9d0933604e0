//! Local single-job execution: `reelsmith run <brief.json>`.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use reelsmith::artifact::Brief;
use reelsmith::common::JobStatus;
use reelsmith::config::Config;
use reelsmith::job::JobRegistry;
use reelsmith::pipeline::{JobRunner, PipelineSettings, Providers};
use reelsmith::store::JobStore;
use reelsmith::ui::{JobProgressUi, UiMode};

pub fn load_brief(path: &Path) -> Result<Brief> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read brief {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse brief {}", path.display()))
}

pub async fn cmd_run(config: &Config, brief_path: &Path, mode: UiMode) -> Result<()> {
    let brief = load_brief(brief_path)?;

    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }
    let work_dir = &config.toml.paths.work_dir;
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;

    let registry = JobRegistry::new(JobStore::default(), config.toml.stages.clone());
    let (task_tx, mut task_rx) = mpsc::channel(64);
    let runner = JobRunner::new(
        registry.clone(),
        Providers::from_config(&config.toml),
        PipelineSettings::from_config(&config.toml),
    )
    .with_task_events(task_tx);

    let mut updates = registry.store().subscribe();
    let ctx = registry
        .create(uuid::Uuid::new_v4().to_string())
        .await
        .context("Failed to register job")?;
    let id = ctx.job_id;
    let ui = JobProgressUi::new(&brief.title, mode);

    let run = tokio::spawn(async move { runner.run(ctx, brief).await });
    tokio::pin!(run);

    loop {
        tokio::select! {
            joined = &mut run => {
                joined.context("Job task panicked")?;
                break;
            }
            Some(event) = task_rx.recv() => ui.on_task(&event),
            Ok(view) = updates.recv() => {
                if view.id == id {
                    ui.on_view(&view);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nCanceling...");
                let _ = registry.cancel(id).await;
            }
        }
    }
    while let Ok(event) = task_rx.try_recv() {
        ui.on_task(&event);
    }

    let view = registry
        .store()
        .get(id)
        .context("Job record missing after run")?;
    ui.finish(&view);

    if view.status != JobStatus::Done {
        anyhow::bail!("Job {} finished as {}", id, view.status);
    }
    Ok(())
}
