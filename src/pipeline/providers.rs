//! Provider seams: script, speech and visual generation.
//!
//! Provider protocols are out of reelsmith's hands, so each concern is a
//! trait. [`CommandProvider`] implements all three by running a configured
//! program; [`ScriptSplitter`] is the built-in script provider used when
//! none is configured.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::artifact::{Brief, Scene};
use crate::config::CommandSpec;
use crate::errors::ProviderError;

/// Narration speed used to size scenes when the brief gives no duration.
const WORDS_PER_SECOND: f64 = 2.5;
const MIN_SCENE_SECS: f64 = 2.0;

#[async_trait]
pub trait ScriptProvider: Send + Sync {
    async fn generate(&self, brief: &Brief, cancel: &CancellationToken) -> Result<Vec<Scene>, ProviderError>;
}

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Synthesize narration for every scene into one audio file at `out`.
    /// Returns the path actually written.
    async fn synthesize(
        &self,
        scenes: &[Scene],
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProviderError>;
}

#[async_trait]
pub trait VisualProvider: Send + Sync {
    /// Render the visual for one scene to `out`. Returns the path written.
    async fn render(
        &self,
        scene: &Scene,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProviderError>;
}

/// Splits the brief prompt into one scene per sentence.
#[derive(Debug, Clone, Default)]
pub struct ScriptSplitter;

impl ScriptSplitter {
    pub fn split(brief: &Brief) -> Vec<Scene> {
        let sentences: Vec<String> = brief
            .prompt
            .split_inclusive(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| s.chars().any(char::is_alphanumeric))
            .map(String::from)
            .collect();
        if sentences.is_empty() {
            return Vec::new();
        }

        let per_scene = brief
            .target_duration_secs
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d / sentences.len() as f64);

        sentences
            .into_iter()
            .enumerate()
            .map(|(index, narration)| {
                let words = narration.split_whitespace().count() as f64;
                let duration_secs =
                    per_scene.unwrap_or_else(|| (words / WORDS_PER_SECOND).max(MIN_SCENE_SECS));
                Scene {
                    index,
                    visual_prompt: format!("{}: {}", brief.title, narration),
                    narration,
                    duration_secs,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ScriptProvider for ScriptSplitter {
    async fn generate(&self, brief: &Brief, _cancel: &CancellationToken) -> Result<Vec<Scene>, ProviderError> {
        Ok(Self::split(brief))
    }
}

/// Runs an external program.
///
/// Arguments may contain `{out}`, `{index}` and `{prompt}`; the request is
/// also written to stdin as JSON. For speech and visuals the last
/// non-empty stdout line names the artifact (defaulting to `{out}`); for
/// scripts stdout is a JSON array of scenes.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(spec: &CommandSpec) -> Self {
        Self {
            program: spec.program.clone(),
            args: spec.args.clone(),
        }
    }

    async fn invoke(
        &self,
        vars: &[(&str, String)],
        stdin: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                vars.iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect();

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProviderError::SpawnFailed {
                program: self.program.clone(),
                source,
            })?;
        debug!(program = %self.program, ?args, "Provider spawned");

        if let Some(mut pipe) = child.stdin.take() {
            // A program that ignores stdin may close it early.
            let _ = pipe.write_all(&stdin).await;
            drop(pipe);
        }

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Canceled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            return Err(ProviderError::NonZeroExit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn produce_file(
        &self,
        vars: &[(&str, String)],
        stdin: Vec<u8>,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProviderError> {
        let stdout = self.invoke(vars, stdin, cancel).await?;
        let path = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| out.to_path_buf());

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(path),
            _ => Err(ProviderError::MissingArtifact { path }),
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProviderError> {
    serde_json::to_vec(value).map_err(|e| ProviderError::InvalidOutput(e.to_string()))
}

#[async_trait]
impl ScriptProvider for CommandProvider {
    async fn generate(&self, brief: &Brief, cancel: &CancellationToken) -> Result<Vec<Scene>, ProviderError> {
        let vars = [("{prompt}", brief.prompt.clone())];
        let stdout = self.invoke(&vars, to_json(brief)?, cancel).await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| ProviderError::InvalidOutput(format!("expected a JSON array of scenes: {}", e)))
    }
}

#[async_trait]
impl SpeechProvider for CommandProvider {
    async fn synthesize(
        &self,
        scenes: &[Scene],
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProviderError> {
        let vars = [("{out}", out.to_string_lossy().into_owned())];
        self.produce_file(&vars, to_json(scenes)?, out, cancel).await
    }
}

#[async_trait]
impl VisualProvider for CommandProvider {
    async fn render(
        &self,
        scene: &Scene,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProviderError> {
        let vars = [
            ("{out}", out.to_string_lossy().into_owned()),
            ("{index}", scene.index.to_string()),
            ("{prompt}", scene.visual_prompt.clone()),
        ];
        self.produce_file(&vars, to_json(scene)?, out, cancel).await
    }
}
