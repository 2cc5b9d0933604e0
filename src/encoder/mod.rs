//! External encoder supervision.
//!
//! Building the filter graph is the encoder's business; reelsmith only
//! fills an argument template, runs the process, follows its progress
//! output and decides when it has really finished.

mod monitor;
pub mod parse;

pub use monitor::{Completion, EncoderMonitor, EncoderOutcome, RenderProgress};

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by one argument per visual input.
pub const INPUTS_PLACEHOLDER: &str = "{inputs}";
pub const AUDIO_PLACEHOLDER: &str = "{audio}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";
/// Path of a concat list naming every visual input with its duration.
pub const CONCAT_PLACEHOLDER: &str = "{concat}";

/// Values substituted into the encoder argument template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateInputs<'a> {
    pub inputs: &'a [PathBuf],
    pub audio: &'a Path,
    pub concat: &'a Path,
    pub output: &'a Path,
}

/// A fully expanded encoder invocation.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output: PathBuf,
    /// Media length used to turn time readings into percent. When `None`
    /// the encoder's `Duration:` header is used.
    pub expected_duration: Option<Duration>,
    pub working_dir: Option<PathBuf>,
}

impl EncoderCommand {
    /// Expand an argument template.
    ///
    /// An argument that is exactly `{inputs}` becomes one argument per
    /// input; `{audio}`, `{concat}` and `{output}` are substituted anywhere.
    pub fn from_template(program: &str, template: &[String], values: TemplateInputs<'_>) -> Self {
        let audio = values.audio.to_string_lossy();
        let concat = values.concat.to_string_lossy();
        let output = values.output.to_string_lossy();
        let mut args = Vec::with_capacity(template.len() + values.inputs.len());
        for arg in template {
            if arg == INPUTS_PLACEHOLDER {
                args.extend(values.inputs.iter().map(|p| p.to_string_lossy().into_owned()));
            } else {
                args.push(
                    arg.replace(AUDIO_PLACEHOLDER, &audio)
                        .replace(CONCAT_PLACEHOLDER, &concat)
                        .replace(OUTPUT_PLACEHOLDER, &output),
                );
            }
        }
        Self {
            program: program.to_string(),
            args,
            output: values.output.to_path_buf(),
            expected_duration: None,
            working_dir: None,
        }
    }

    pub fn with_expected_duration(mut self, duration: Option<Duration>) -> Self {
        self.expected_duration = duration;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Write an ffconcat list: each image held for its scene's duration.
/// The last entry is repeated, as the concat demuxer ignores the final
/// `duration` otherwise.
pub fn write_concat_list(path: &Path, entries: &[(PathBuf, f64)]) -> std::io::Result<()> {
    let mut body = String::from("ffconcat version 1.0\n");
    for (file, secs) in entries {
        body.push_str(&format!("file '{}'\nduration {:.3}\n", escape(file), secs.max(0.04)));
    }
    if let Some((last, _)) = entries.last() {
        body.push_str(&format!("file '{}'\n", escape(last)));
    }
    std::fs::write(path, body)
}

fn escape(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<'a>(inputs: &'a [PathBuf]) -> TemplateInputs<'a> {
        TemplateInputs {
            inputs,
            audio: Path::new("/w/audio.wav"),
            concat: Path::new("/w/inputs.txt"),
            output: Path::new("/w/out.mp4"),
        }
    }

    #[test]
    fn test_template_expansion() {
        let template: Vec<String> = ["-y", "{inputs}", "-i", "{audio}", "-progress", "pipe:1", "{output}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let inputs = vec![PathBuf::from("/w/0.png"), PathBuf::from("/w/1.png")];

        let cmd = EncoderCommand::from_template("ffmpeg", &template, values(&inputs));

        assert_eq!(
            cmd.args,
            vec!["-y", "/w/0.png", "/w/1.png", "-i", "/w/audio.wav", "-progress", "pipe:1", "/w/out.mp4"]
        );
        assert_eq!(cmd.output, PathBuf::from("/w/out.mp4"));
    }

    #[test]
    fn test_placeholders_inside_arguments() {
        let template = vec!["list={concat}".to_string(), "out={output}".to_string()];
        let cmd = EncoderCommand::from_template("enc", &template, values(&[]));
        assert_eq!(cmd.args, vec!["list=/w/inputs.txt", "out=/w/out.mp4"]);
    }

    #[test]
    fn test_concat_list_repeats_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("inputs.txt");
        write_concat_list(
            &list,
            &[
                (PathBuf::from("/w/0.png"), 2.0),
                (PathBuf::from("/w/it's.png"), 3.5),
            ],
        )
        .unwrap();

        let body = std::fs::read_to_string(&list).unwrap();
        assert!(body.starts_with("ffconcat version 1.0\n"));
        assert!(body.contains("file '/w/0.png'\nduration 2.000\n"));
        assert!(body.contains(r"it'\''s.png"));
        assert!(body.trim_end().ends_with("file '/w/it'\\''s.png'"));
    }
}
