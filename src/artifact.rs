//! Inputs and outputs of generation tasks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A client request to produce a video.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brief {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub target_duration_secs: Option<f64>,
    /// Pre-written scenes. When present the script provider is bypassed.
    #[serde(default)]
    pub scenes: Option<Vec<Scene>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub index: usize,
    pub narration: String,
    pub visual_prompt: String,
    pub duration_secs: f64,
}

/// Typed result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Script { scenes: Vec<Scene> },
    Audio { path: PathBuf, duration_secs: f64 },
    Visuals { paths: Vec<PathBuf> },
    Video { path: PathBuf },
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Script { .. } => "script",
            Self::Audio { .. } => "audio",
            Self::Visuals { .. } => "visuals",
            Self::Video { .. } => "video",
        }
    }

    pub fn scenes(&self) -> Option<&[Scene]> {
        match self {
            Self::Script { scenes } => Some(scenes),
            _ => None,
        }
    }

    pub fn audio_path(&self) -> Option<&Path> {
        match self {
            Self::Audio { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn visual_paths(&self) -> Option<&[PathBuf]> {
        match self {
            Self::Visuals { paths } => Some(paths),
            _ => None,
        }
    }

    pub fn video_path(&self) -> Option<&Path> {
        match self {
            Self::Video { path } => Some(path),
            _ => None,
        }
    }
}

/// Total narration length of a script, used to size silent fallbacks and
/// to convert encoder timestamps into a render percentage.
pub fn total_duration_secs(scenes: &[Scene]) -> f64 {
    scenes.iter().map(|s| s.duration_secs.max(0.0)).sum()
}
