//! The brief-to-video pipeline: task plan, providers, task bodies and the
//! runner that drives a job from `Queued` to a terminal state.

pub mod providers;
mod runner;
mod tasks;

pub use providers::{CommandProvider, ScriptProvider, ScriptSplitter, SpeechProvider, VisualProvider};
pub use runner::JobRunner;
pub use tasks::{CACHED_AUDIO_FILE, GenerationTasks};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CommandSpec, ReelsmithToml};
use crate::dag::{GenerationNode, TaskType};

pub const SCRIPT_TASK: &str = "script";
pub const NARRATION_TASK: &str = "narration";
pub const VISUALS_TASK: &str = "visuals";
pub const COMPOSE_TASK: &str = "compose";

/// Per-task wall-clock budgets.
#[derive(Debug, Clone)]
pub struct TaskTimeouts {
    pub script: Duration,
    pub narration: Duration,
    pub visuals: Duration,
    pub compose: Duration,
}

/// Everything the pipeline needs from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    pub fallback_dir: Option<PathBuf>,
    pub max_parallel: usize,
    pub timeouts: TaskTimeouts,
    pub visual_concurrency: usize,
    pub encoder_program: String,
    pub encoder_args: Vec<String>,
    pub encoder_timeout: Duration,
    pub grace_period: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &ReelsmithToml) -> Self {
        let exec = &config.executor;
        Self {
            work_dir: config.paths.work_dir.clone(),
            fallback_dir: config.paths.fallback_dir.clone(),
            max_parallel: exec.max_parallel.max(1),
            timeouts: TaskTimeouts {
                script: Duration::from_secs(exec.script_timeout_secs),
                narration: Duration::from_secs(exec.narration_timeout_secs),
                visuals: Duration::from_secs(exec.visuals_timeout_secs),
                compose: Duration::from_secs(exec.compose_timeout_secs),
            },
            visual_concurrency: config.providers.visual_concurrency.max(1),
            encoder_program: config.encoder.program.clone(),
            encoder_args: config.encoder.args.clone(),
            encoder_timeout: Duration::from_secs(config.encoder.timeout_secs),
            grace_period: Duration::from_secs(config.encoder.grace_period_secs),
        }
    }
}

/// The providers a job runs against.
#[derive(Clone)]
pub struct Providers {
    pub script: Arc<dyn ScriptProvider>,
    pub speech: Option<Arc<dyn SpeechProvider>>,
    pub visuals: Option<Arc<dyn VisualProvider>>,
}

impl Providers {
    pub fn from_config(config: &ReelsmithToml) -> Self {
        let command = |spec: &CommandSpec| Arc::new(CommandProvider::new(spec));
        Self {
            script: match config.providers.script {
                Some(ref spec) => command(spec) as Arc<dyn ScriptProvider>,
                None => Arc::new(ScriptSplitter) as Arc<dyn ScriptProvider>,
            },
            speech: config
                .providers
                .speech
                .as_ref()
                .map(|s| command(s) as Arc<dyn SpeechProvider>),
            visuals: config
                .providers
                .visuals
                .as_ref()
                .map(|s| command(s) as Arc<dyn VisualProvider>),
        }
    }
}

/// The fixed task graph: script, then narration and visuals in parallel,
/// then composition. Composition also reads the script, so it depends on
/// it directly.
pub fn plan(timeouts: &TaskTimeouts) -> Vec<GenerationNode> {
    vec![
        GenerationNode::new(SCRIPT_TASK, TaskType::Script).with_timeout(timeouts.script),
        GenerationNode::new(NARRATION_TASK, TaskType::Narration)
            .depends_on([SCRIPT_TASK])
            .with_timeout(timeouts.narration),
        GenerationNode::new(VISUALS_TASK, TaskType::Visuals)
            .depends_on([SCRIPT_TASK])
            .with_timeout(timeouts.visuals),
        GenerationNode::new(COMPOSE_TASK, TaskType::Compose)
            .depends_on([SCRIPT_TASK, NARRATION_TASK, VISUALS_TASK])
            .with_timeout(timeouts.compose),
    ]
}
