//! Task bodies for the four generation stages, and their recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reelsmith_common::{ErrorCode, Stage};
use tracing::{info, warn};

use crate::artifact::{Artifact, Brief, Scene, total_duration_secs};
use crate::dag::{
    AUDIO_KEY, GenerationNode, InputRequest, TaskContext, TaskHandler, TaskType, VISUALS_KEY,
    resolve_input,
};
use crate::encoder::{EncoderCommand, EncoderMonitor, TemplateInputs, write_concat_list};
use crate::errors::{ProviderError, TaskError};
use crate::pipeline::{PipelineSettings, Providers, SCRIPT_TASK, NARRATION_TASK, VISUALS_TASK};

const SILENCE_SAMPLE_RATE: u32 = 22_050;
/// Name of a pre-rendered narration fallback inside the fallback directory.
pub const CACHED_AUDIO_FILE: &str = "audio.wav";

/// The task and recovery functions of one job.
pub struct GenerationTasks {
    brief: Brief,
    providers: Providers,
    settings: Arc<PipelineSettings>,
    work_dir: PathBuf,
}

impl GenerationTasks {
    pub fn new(
        brief: Brief,
        providers: Providers,
        settings: Arc<PipelineSettings>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            brief,
            providers,
            settings,
            work_dir,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join("video.mp4")
    }

    async fn script(&self, ctx: &TaskContext) -> Result<Artifact, TaskError> {
        let scenes = match self.brief.scenes {
            Some(ref scenes) => scenes.clone(),
            None => self
                .providers
                .script
                .generate(&self.brief, ctx.cancel_token())
                .await
                .map_err(|e| provider_error(ErrorCode::ScriptFailed, "Script generation", e))?,
        };
        if scenes.is_empty() {
            return Err(TaskError::new(
                ErrorCode::ZeroScenes,
                format!("Script for '{}' has no scenes", self.brief.title),
            ));
        }
        info!(scenes = scenes.len(), "Script ready");
        Ok(Artifact::Script { scenes })
    }

    async fn narration(&self, ctx: &TaskContext) -> Result<Artifact, TaskError> {
        let scenes = script_scenes(ctx)?;
        let Some(ref speech) = self.providers.speech else {
            return Err(TaskError::new(
                ErrorCode::NarrationUnavailable,
                "No speech provider configured",
            ));
        };
        let out = self.work_dir.join("narration.wav");
        let path = speech
            .synthesize(scenes, &out, ctx.cancel_token())
            .await
            .map_err(|e| provider_error(ErrorCode::NarrationUnavailable, "Speech synthesis", e))?;
        Ok(Artifact::Audio {
            path,
            duration_secs: total_duration_secs(scenes),
        })
    }

    async fn visuals(&self, ctx: &TaskContext) -> Result<Artifact, TaskError> {
        let scenes = script_scenes(ctx)?;
        let Some(ref provider) = self.providers.visuals else {
            return Err(TaskError::new(
                ErrorCode::AllVisualsMissing,
                "No visual provider configured",
            ));
        };

        let total = scenes.len();
        let mut rendered: Vec<(usize, PathBuf)> = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut finished = 0usize;

        let jobs: Vec<_> = scenes
            .iter()
            .cloned()
            .map(|scene| {
                let out = self.work_dir.join(format!("scene-{:03}.png", scene.index));
                let provider = provider.clone();
                let cancel = ctx.cancel_token().clone();
                async move { (scene.index, provider.render(&scene, &out, &cancel).await) }
            })
            .collect();
        let mut renders =
            futures::stream::iter(jobs).buffer_unordered(self.settings.visual_concurrency.max(1));

        while let Some((index, result)) = renders.next().await {
            finished += 1;
            match result {
                Ok(path) => rendered.push((index, path)),
                Err(ProviderError::Canceled) => return Err(TaskError::canceled(ctx.task_id())),
                Err(e) => {
                    warn!(scene = index, error = %e, "Scene visual failed");
                    failures.push(format!("scene {}: {}", index, e));
                }
            }
            ctx.progress()
                .report(Stage::Visuals, finished as f64 * 100.0 / total as f64);
        }

        if rendered.is_empty() {
            return Err(TaskError::new(
                ErrorCode::AllVisualsMissing,
                format!("No scene produced a visual ({})", failures.join("; ")),
            ));
        }
        rendered.sort_by_key(|(index, _)| *index);
        Ok(Artifact::Visuals {
            paths: rendered.into_iter().map(|(_, p)| p).collect(),
        })
    }

    async fn compose(&self, ctx: &TaskContext) -> Result<Artifact, TaskError> {
        let scenes = script_scenes(ctx)?;

        let audio = resolve_input(
            ctx,
            InputRequest {
                label: "Narration audio",
                producer: NARRATION_TASK,
                canonical_key: AUDIO_KEY,
                cached_fallback: self
                    .settings
                    .fallback_dir
                    .as_ref()
                    .map(|d| d.join(CACHED_AUDIO_FILE)),
                from_cache: cached_audio,
                missing_code: ErrorCode::NarrationUnavailable,
            },
        )?;
        let visuals = resolve_input(
            ctx,
            InputRequest {
                label: "Scene visuals",
                producer: VISUALS_TASK,
                canonical_key: VISUALS_KEY,
                cached_fallback: None,
                from_cache: cached_visual,
                missing_code: ErrorCode::AllVisualsMissing,
            },
        )?;
        info!(audio = %audio.source, visuals = %visuals.source, "Composition inputs resolved");

        let audio_path = audio
            .artifact
            .audio_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| wrong_kind("audio", &audio.artifact))?;
        let visual_paths = visuals
            .artifact
            .visual_paths()
            .map(<[PathBuf]>::to_vec)
            .ok_or_else(|| wrong_kind("visuals", &visuals.artifact))?;

        let concat = self.work_dir.join("inputs.txt");
        let entries = concat_entries(scenes, &visual_paths);
        write_concat_list(&concat, &entries).map_err(|e| {
            TaskError::new(
                ErrorCode::Internal,
                format!("Failed to write {}: {}", concat.display(), e),
            )
        })?;

        let output = self.output_path();
        let expected = total_duration_secs(scenes);
        let command = EncoderCommand::from_template(
            &self.settings.encoder_program,
            &self.settings.encoder_args,
            TemplateInputs {
                inputs: &visual_paths,
                audio: &audio_path,
                concat: &concat,
                output: &output,
            },
        )
        .with_expected_duration((expected > 0.0).then(|| Duration::from_secs_f64(expected)))
        .with_working_dir(&self.work_dir);
        ctx.progress().stage_finished(Stage::Composition);

        let monitor = EncoderMonitor::new(self.settings.encoder_timeout, self.settings.grace_period);
        let progress = ctx.progress().clone();
        let outcome = monitor
            .run(&command, ctx.cancel_token(), move |p| {
                progress.report(Stage::Render, p.percent_within_stage)
            })
            .await?;

        ctx.progress().stage_started(Stage::Finalization);
        info!(completion = ?outcome.completion, elapsed_ms = outcome.elapsed.as_millis() as u64, "Render finished");
        Ok(Artifact::Video {
            path: outcome.output,
        })
    }

    /// Silent narration as long as the script, so composition can proceed.
    async fn silent_narration(&self, ctx: &TaskContext) -> Option<Artifact> {
        let duration_secs = total_duration_secs(script_scenes(ctx).ok()?);
        let path = self.work_dir.join("narration-silent.wav");
        let target = path.clone();
        let written =
            tokio::task::spawn_blocking(move || write_silence(&target, duration_secs)).await;
        match written {
            Ok(Ok(())) => Some(Artifact::Audio {
                path,
                duration_secs,
            }),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not write silent narration");
                None
            }
            Err(e) => {
                warn!(error = %e, "Silent narration writer panicked");
                None
            }
        }
    }
}

#[async_trait]
impl TaskHandler for GenerationTasks {
    async fn run(&self, node: &GenerationNode, ctx: &TaskContext) -> Result<Artifact, TaskError> {
        match node.task_type {
            TaskType::Script => self.script(ctx).await,
            TaskType::Narration => self.narration(ctx).await,
            TaskType::Visuals => self.visuals(ctx).await,
            TaskType::Compose => self.compose(ctx).await,
        }
    }

    async fn recover(
        &self,
        node: &GenerationNode,
        error: &TaskError,
        ctx: &TaskContext,
    ) -> Option<Artifact> {
        match node.task_type {
            TaskType::Narration => {
                warn!(error = %error, "Narration failed, falling back to silence");
                self.silent_narration(ctx).await
            }
            TaskType::Script | TaskType::Visuals | TaskType::Compose => None,
        }
    }
}

fn script_scenes(ctx: &TaskContext) -> Result<&[Scene], TaskError> {
    ctx.direct_result(SCRIPT_TASK)
        .and_then(Artifact::scenes)
        .ok_or_else(|| {
            TaskError::new(
                ErrorCode::DependencyFailed,
                format!("Task {} has no script to work from", ctx.task_id()),
            )
        })
}

fn provider_error(code: ErrorCode, what: &str, err: ProviderError) -> TaskError {
    match err {
        ProviderError::Canceled => TaskError::from(err),
        other => TaskError::new(code, format!("{} failed: {}", what, other)),
    }
}

fn wrong_kind(expected: &str, artifact: &Artifact) -> TaskError {
    TaskError::new(
        ErrorCode::Internal,
        format!("Expected {} artifact, found {}", expected, artifact.kind()),
    )
}

fn cached_audio(path: PathBuf) -> Artifact {
    Artifact::Audio {
        path,
        duration_secs: 0.0,
    }
}

fn cached_visual(path: PathBuf) -> Artifact {
    Artifact::Visuals { paths: vec![path] }
}

/// Pair each visual with a scene duration. With fewer visuals than scenes
/// the script length is spread evenly over the visuals that exist.
fn concat_entries(scenes: &[Scene], visuals: &[PathBuf]) -> Vec<(PathBuf, f64)> {
    if visuals.len() == scenes.len() {
        return visuals
            .iter()
            .cloned()
            .zip(scenes.iter().map(|s| s.duration_secs))
            .collect();
    }
    let each = total_duration_secs(scenes) / visuals.len().max(1) as f64;
    visuals.iter().cloned().map(|p| (p, each)).collect()
}

fn write_silence(path: &Path, duration_secs: f64) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SILENCE_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let samples = (duration_secs.max(1.0) * f64::from(SILENCE_SAMPLE_RATE)).ceil() as u64;
    let mut writer = hound::WavWriter::create(path, spec)?;
    for _ in 0..samples {
        writer.write_sample(0i16)?;
    }
    writer.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(index: usize, secs: f64) -> Scene {
        Scene {
            index,
            narration: format!("line {index}"),
            visual_prompt: format!("prompt {index}"),
            duration_secs: secs,
        }
    }

    #[test]
    fn test_concat_entries_match_scenes() {
        let scenes = vec![scene(0, 2.0), scene(1, 3.0)];
        let visuals = vec![PathBuf::from("a.png"), PathBuf::from("b.png")];
        assert_eq!(
            concat_entries(&scenes, &visuals),
            vec![(PathBuf::from("a.png"), 2.0), (PathBuf::from("b.png"), 3.0)]
        );
    }

    #[test]
    fn test_concat_entries_spread_missing_visuals() {
        let scenes = vec![scene(0, 2.0), scene(1, 3.0), scene(2, 1.0)];
        let visuals = vec![PathBuf::from("a.png"), PathBuf::from("c.png")];
        let entries = concat_entries(&scenes, &visuals);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, 3.0);
    }

    #[test]
    fn test_silence_has_requested_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.wav");
        write_silence(&path, 2.0).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, SILENCE_SAMPLE_RATE);
        assert_eq!(reader.duration(), 2 * SILENCE_SAMPLE_RATE);
        assert!(reader.into_samples::<i16>().all(|s| s.unwrap() == 0));
    }
}
