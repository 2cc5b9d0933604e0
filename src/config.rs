//! Configuration for reelsmith, read from `reelsmith.toml`.
//!
//! Layered: file → environment → CLI flags. A missing file means defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [executor]
//! max_parallel = 4
//! narration_timeout_secs = 300
//!
//! [stages]
//! script = { start = 0, end = 15 }
//! render = { start = 80, end = 99 }
//!
//! [encoder]
//! program = "ffmpeg"
//! timeout_secs = 1500
//! grace_period_secs = 5
//!
//! [providers.speech]
//! program = "./tts.sh"
//! args = ["{out}"]
//!
//! [gateway]
//! lookup_window_secs = 20
//!
//! [paths]
//! work_dir = "./reelsmith-work"
//! fallback_dir = "./fallback"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::encoder::{CONCAT_PLACEHOLDER, INPUTS_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use crate::job::StageRanges;

pub const CONFIG_FILE: &str = "reelsmith.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served frontend.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_parallel: usize,
    pub script_timeout_secs: u64,
    pub narration_timeout_secs: u64,
    pub visuals_timeout_secs: u64,
    /// Covers composition and the whole encoder run.
    pub compose_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            script_timeout_secs: 120,
            narration_timeout_secs: 300,
            visuals_timeout_secs: 600,
            compose_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub program: String,
    /// Placeholders: `{inputs}`, `{concat}`, `{audio}`, `{output}`.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for EncoderSection {
    fn default() -> Self {
        let args = [
            "-y",
            "-nostdin",
            "-hide_banner",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            CONCAT_PLACEHOLDER,
            "-i",
            "{audio}",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-shortest",
            "-progress",
            "pipe:1",
            OUTPUT_PLACEHOLDER,
        ];
        Self {
            program: "ffmpeg".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 1500,
            grace_period_secs: 5,
        }
    }
}

/// An external program standing in for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    /// Unset: the brief prompt is split into scenes locally.
    pub script: Option<CommandSpec>,
    pub speech: Option<CommandSpec>,
    pub visuals: Option<CommandSpec>,
    /// Scenes rendered concurrently by the visual provider.
    pub visual_concurrency: usize,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            script: None,
            speech: None,
            visuals: None,
            visual_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// How long a push stream waits for an unknown job id to appear.
    pub lookup_window_secs: u64,
    pub lookup_interval_ms: u64,
    pub keepalive_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            lookup_window_secs: 20,
            lookup_interval_ms: 250,
            keepalive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub interval_secs: u64,
    /// Finished jobs are forgotten this long after reaching a terminal state.
    pub retention_secs: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Per-job directories are created under here.
    pub work_dir: PathBuf,
    /// Pre-rendered fallbacks, e.g. `audio.wav`.
    pub fallback_dir: Option<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("reelsmith-work"),
            fallback_dir: None,
        }
    }
}

/// Parsed `reelsmith.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReelsmithToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub stages: StageRanges,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub paths: PathsSection,
}

impl ReelsmithToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("In {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse reelsmith.toml")
    }

    /// Load `path`, or defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Apply `REELSMITH_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("REELSMITH_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid REELSMITH_PORT '{}'", port))?;
        }
        if let Some(program) = lookup("REELSMITH_ENCODER").filter(|p| !p.trim().is_empty()) {
            self.encoder.program = program;
        }
        if let Some(dir) = lookup("REELSMITH_WORK_DIR").filter(|d| !d.trim().is_empty()) {
            self.paths.work_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Problems that would make a job fail or hang. Empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.stages.validate();

        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_string());
        }
        if self.executor.max_parallel == 0 {
            problems.push("executor.max_parallel must be at least 1".to_string());
        }
        for (name, secs) in [
            ("script_timeout_secs", self.executor.script_timeout_secs),
            ("narration_timeout_secs", self.executor.narration_timeout_secs),
            ("visuals_timeout_secs", self.executor.visuals_timeout_secs),
            ("compose_timeout_secs", self.executor.compose_timeout_secs),
        ] {
            if secs == 0 {
                problems.push(format!("executor.{} must be non-zero", name));
            }
        }
        if self.executor.compose_timeout_secs < self.encoder.timeout_secs {
            problems.push(format!(
                "executor.compose_timeout_secs ({}) is shorter than encoder.timeout_secs ({})",
                self.executor.compose_timeout_secs, self.encoder.timeout_secs
            ));
        }

        if self.encoder.program.trim().is_empty() {
            problems.push("encoder.program is empty".to_string());
        }
        if !self.encoder.args.iter().any(|a| a.contains(OUTPUT_PLACEHOLDER)) {
            problems.push("encoder.args never mentions {output}".to_string());
        }
        if !self
            .encoder
            .args
            .iter()
            .any(|a| a == INPUTS_PLACEHOLDER || a.contains(CONCAT_PLACEHOLDER))
        {
            problems.push("encoder.args needs {inputs} or {concat}".to_string());
        }

        for (name, spec) in [
            ("script", &self.providers.script),
            ("speech", &self.providers.speech),
            ("visuals", &self.providers.visuals),
        ] {
            if let Some(spec) = spec
                && spec.program.trim().is_empty()
            {
                problems.push(format!("providers.{}.program is empty", name));
            }
        }
        if self.providers.visual_concurrency == 0 {
            problems.push("providers.visual_concurrency must be at least 1".to_string());
        }

        if self.gateway.lookup_interval_ms == 0 {
            problems.push("gateway.lookup_interval_ms must be non-zero".to_string());
        } else if self.gateway.lookup_interval_ms > self.gateway.lookup_window_secs * 1000 {
            problems.push("gateway.lookup_interval_ms exceeds the lookup window".to_string());
        }
        if self.watchdog.interval_secs == 0 {
            problems.push("watchdog.interval_secs must be non-zero".to_string());
        }

        problems
    }
}

/// Effective configuration: the parsed file plus where it came from.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub from_file: bool,
    pub toml: ReelsmithToml,
}

impl Config {
    /// Load `path` (or `./reelsmith.toml`) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        let from_file = path.exists();
        let mut toml = ReelsmithToml::load_or_default(&path)?;
        toml.apply_env()?;
        Ok(Self {
            path,
            from_file,
            toml,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.toml.server.host, self.toml.server.port)
    }

    pub fn lookup_window(&self) -> Duration {
        Duration::from_secs(self.toml.gateway.lookup_window_secs)
    }

    pub fn lookup_interval(&self) -> Duration {
        Duration::from_millis(self.toml.gateway.lookup_interval_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.toml.gateway.keepalive_secs.max(1))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.toml.watchdog.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.toml.watchdog.retention_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StageRange;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReelsmithToml::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.gateway.lookup_window_secs, 20);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = ReelsmithToml::parse(
            r#"
            [server]
            port = 8080
            dev_mode = true

            [stages]
            render = { start = 80, end = 99 }

            [providers.speech]
            program = "./tts.sh"
            args = ["{out}"]

            [paths]
            fallback_dir = "/srv/fallback"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.server.dev_mode);
        assert_eq!(config.stages.render, StageRange::new(80, 99));
        assert_eq!(
            config.providers.speech,
            Some(CommandSpec {
                program: "./tts.sh".into(),
                args: vec!["{out}".into()],
            })
        );
        assert!(config.providers.script.is_none());
        assert_eq!(config.paths.fallback_dir, Some(PathBuf::from("/srv/fallback")));
        assert_eq!(config.executor.max_parallel, 4);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = ReelsmithToml::parse("[server\nport = 1").unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("REELSMITH_PORT", "9000"),
            ("REELSMITH_ENCODER", "/opt/ffmpeg"),
            ("REELSMITH_WORK_DIR", "/var/reelsmith"),
        ]
        .into_iter()
        .collect();
        let mut config = ReelsmithToml::default();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.encoder.program, "/opt/ffmpeg");
        assert_eq!(config.paths.work_dir, PathBuf::from("/var/reelsmith"));
    }

    #[test]
    fn test_bad_env_port() {
        let mut config = ReelsmithToml::default();
        let err = config
            .apply_env_from(|k| (k == "REELSMITH_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("REELSMITH_PORT"));
    }

    #[test]
    fn test_validate_collects_problems() {
        let mut config = ReelsmithToml::default();
        config.executor.max_parallel = 0;
        config.encoder.args = vec!["-y".into()];
        config.stages.script = StageRange::new(0, 20);
        config.gateway.lookup_interval_ms = 0;

        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("max_parallel")));
        assert!(problems.iter().any(|p| p.contains("{output}")));
        assert!(problems.iter().any(|p| p.contains("{inputs} or {concat}")));
        assert!(problems.iter().any(|p| p.contains("stages.narration")));
        assert!(problems.iter().any(|p| p.contains("lookup_interval_ms")));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReelsmithToml::load_or_default(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.encoder.program, "ffmpeg");
    }

    #[test]
    fn test_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = ReelsmithToml::default();
        config.server.port = 4000;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = ReelsmithToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 4000);
        assert_eq!(loaded.encoder.args, config.encoder.args);
    }
}
