use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable reason a job ended in `failed`.
///
/// Codes are grouped by root cause: unrecoverable task failures, output
/// validation failures (the pipeline claimed success but left no usable
/// file) and stuck jobs. Clients switch on these, so the serialized names
/// are stable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ZeroScenes,
    ScriptFailed,
    NarrationUnavailable,
    AllVisualsMissing,
    EncoderFailed,
    TaskTimeout,
    DependencyFailed,
    OutputNotFound,
    OutputEmpty,
    Stuck,
    Canceled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZeroScenes => "zero_scenes",
            Self::ScriptFailed => "script_failed",
            Self::NarrationUnavailable => "narration_unavailable",
            Self::AllVisualsMissing => "all_visuals_missing",
            Self::EncoderFailed => "encoder_failed",
            Self::TaskTimeout => "task_timeout",
            Self::DependencyFailed => "dependency_failed",
            Self::OutputNotFound => "output_not_found",
            Self::OutputEmpty => "output_empty",
            Self::Stuck => "stuck",
            Self::Canceled => "canceled",
            Self::Internal => "internal",
        }
    }

    /// The pipeline reported success but the artifact is unusable.
    pub fn is_output_validation(&self) -> bool {
        matches!(self, Self::OutputNotFound | Self::OutputEmpty)
    }

    pub fn suggested_actions(&self) -> Vec<String> {
        let actions: &[&str] = match self {
            Self::ZeroScenes => &[
                "Add more detail to the brief so at least one scene can be written",
                "Provide scenes explicitly in the request",
            ],
            Self::ScriptFailed => &[
                "Check the script provider configuration",
                "Retry the job",
            ],
            Self::NarrationUnavailable => &[
                "Check the speech provider configuration",
                "Place a fallback audio.wav in the fallback directory",
            ],
            Self::AllVisualsMissing => &[
                "Check the visual provider configuration",
                "Simplify the visual prompts and retry",
            ],
            Self::EncoderFailed => &[
                "Verify the encoder binary is installed and on PATH",
                "Inspect the encoder output in the server log",
            ],
            Self::TaskTimeout => &[
                "Retry the job",
                "Increase the task timeout in the [executor] config section",
            ],
            Self::DependencyFailed => &["Fix the upstream task failure and retry"],
            Self::OutputNotFound => &[
                "Verify the encoder output path is writable",
                "Check the encoder arguments write to {output}",
            ],
            Self::OutputEmpty => &[
                "Check free disk space",
                "Inspect the encoder output in the server log",
            ],
            Self::Stuck => &[
                "Retry the job",
                "Check whether the encoder or a provider is hanging",
            ],
            Self::Canceled => &[],
            Self::Internal => &["Retry the job", "Report the error with its correlation id"],
        };
        actions.iter().map(|a| a.to_string()).collect()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure carried from the point of failure to the client unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

impl JobFailure {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            suggested_actions: error_code.suggested_actions(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_validation_codes_are_distinct_from_task_codes() {
        assert!(ErrorCode::OutputNotFound.is_output_validation());
        assert!(ErrorCode::OutputEmpty.is_output_validation());
        assert!(!ErrorCode::EncoderFailed.is_output_validation());
        assert_ne!(ErrorCode::OutputNotFound, ErrorCode::OutputEmpty);
    }

    #[test]
    fn test_failure_carries_suggestions() {
        let failure = JobFailure::new(ErrorCode::ZeroScenes, "script produced no scenes");
        assert!(!failure.suggested_actions.is_empty());
        assert_eq!(failure.to_string(), "[zero_scenes] script produced no scenes");
    }

    #[test]
    fn test_serialized_code_matches_as_str() {
        for code in [ErrorCode::Stuck, ErrorCode::TaskTimeout, ErrorCode::AllVisualsMissing] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_str());
        }
    }
}
