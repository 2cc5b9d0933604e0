//! Typed error hierarchy for reelsmith.
//!
//! One enum per subsystem:
//! - `TaskError`: a single generation task failed (carried in node state)
//! - `OrchestratorError`: the task graph could not be executed
//! - `RegistryError`: a job update was rejected by the registry
//! - `StoreError`: a replicated write was rejected by the job store
//! - `EncoderError`: the external encoder process misbehaved
//! - `ProviderError`: a script/speech/visual provider call failed

use std::path::PathBuf;
use std::time::Duration;

use reelsmith_common::{ErrorCode, JobFailure, JobId, JobStatus};
use thiserror::Error;

/// Failure of one task body. Cloneable because it is stored on the node
/// and echoed in orchestration events.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{code}] {message}")]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(task_id: &str, budget: Duration) -> Self {
        Self::new(
            ErrorCode::TaskTimeout,
            format!("Task {} exceeded its {}s budget", task_id, budget.as_secs()),
        )
    }

    pub fn canceled(task_id: &str) -> Self {
        Self::new(ErrorCode::Canceled, format!("Task {} was canceled", task_id))
    }

    pub fn is_canceled(&self) -> bool {
        self.code == ErrorCode::Canceled
    }

    pub fn to_failure(&self) -> JobFailure {
        JobFailure::new(self.code, self.message.clone())
    }
}

impl From<ProviderError> for TaskError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Canceled => Self::new(ErrorCode::Canceled, "Provider call canceled"),
            other => Self::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

impl From<EncoderError> for TaskError {
    fn from(err: EncoderError) -> Self {
        let code = match &err {
            EncoderError::Canceled => ErrorCode::Canceled,
            EncoderError::Timeout { .. } => ErrorCode::TaskTimeout,
            _ => ErrorCode::EncoderFailed,
        };
        Self::new(code, err.to_string())
    }
}

/// Errors that prevent a task graph from running at all.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Duplicate task id: {task_id}")]
    DuplicateTask { task_id: String },

    #[error("Unknown dependency '{dependency}' in task '{task_id}': no task with that id exists")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {involved:?}")]
    Cycle { involved: Vec<String> },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    IllegalTransition {
        task_id: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Errors from the job registry's single update entry point.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job {id} not found")]
    JobNotFound { id: JobId },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} is {status} and no longer accepts progress")]
    NotRunning { id: JobId, status: JobStatus },

    #[error("Job store rejected write: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the client-facing job store's write boundary.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("Job {id} cannot be marked done without a non-empty output path")]
    MissingOutput { id: JobId },

    #[error("Job {id} write at revision {revision} is not newer than stored revision {stored}")]
    Stale {
        id: JobId,
        revision: u64,
        stored: u64,
    },

    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },
}

/// Errors from supervising the encoder process.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("Failed to spawn encoder '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read encoder output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder exited with code {code:?}: {tail}")]
    NonZeroExit { code: Option<i32>, tail: String },

    #[error("Encoder exceeded its {secs}s budget")]
    Timeout { secs: u64 },

    #[error("Encoder was canceled")]
    Canceled,
}

/// Errors from external generation providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to spawn provider '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provider '{program}' exited with code {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Provider produced no usable artifact at {path}")]
    MissingArtifact { path: PathBuf },

    #[error("Provider returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("Provider I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider call canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_timeout_has_distinct_code() {
        let err = TaskError::timeout("narration", Duration::from_secs(90));
        assert_eq!(err.code, ErrorCode::TaskTimeout);
        assert!(err.to_string().contains("90s"));
    }

    #[test]
    fn task_error_from_encoder_error_maps_codes() {
        let exit: TaskError = EncoderError::NonZeroExit {
            code: Some(1),
            tail: "bad filter".into(),
        }
        .into();
        assert_eq!(exit.code, ErrorCode::EncoderFailed);

        let canceled: TaskError = EncoderError::Canceled.into();
        assert!(canceled.is_canceled());

        let timeout: TaskError = EncoderError::Timeout { secs: 5 }.into();
        assert_eq!(timeout.code, ErrorCode::TaskTimeout);
    }

    #[test]
    fn task_error_converts_to_structured_failure() {
        let err = TaskError::new(ErrorCode::ZeroScenes, "no scenes");
        let failure = err.to_failure();
        assert_eq!(failure.error_code, ErrorCode::ZeroScenes);
        assert_eq!(failure.message, "no scenes");
        assert!(!failure.suggested_actions.is_empty());
    }

    #[test]
    fn registry_error_wraps_store_error() {
        let id = uuid::Uuid::new_v4();
        let err: RegistryError = StoreError::MissingOutput { id }.into();
        match &err {
            RegistryError::Store(StoreError::MissingOutput { id: got }) => assert_eq!(*got, id),
            _ => panic!("Expected RegistryError::Store(MissingOutput)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TaskError::canceled("x"));
        assert_std_error(&OrchestratorError::Cycle { involved: vec![] });
        assert_std_error(&EncoderError::Canceled);
        assert_std_error(&ProviderError::Canceled);
    }
}
