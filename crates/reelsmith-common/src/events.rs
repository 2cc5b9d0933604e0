use serde::{Deserialize, Serialize};

use crate::failure::ErrorCode;
use crate::job::{JobId, JobStatus, JobView, Stage};

/// Payload of a `progress` push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub percent: u8,
    pub stage: Stage,
}

/// Payload shared by the three terminal push events.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub suggested_actions: Vec<String>,
}

/// One event on the push channel. The variant name is the SSE event name,
/// the inner value is the JSON `data` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    /// Sent once, before anything else, as soon as the stream is open.
    Connected { job_id: JobId },
    Progress(ProgressPayload),
    Completed(TerminalPayload),
    Failed(TerminalPayload),
    Cancelled(TerminalPayload),
    /// The job id never became visible within the lookup window.
    NotFound { job_id: JobId },
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Progress(_) => "progress",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled(_) => "cancelled",
            Self::NotFound { .. } => "not_found",
        }
    }

    /// JSON body for the SSE `data:` field.
    pub fn data(&self) -> serde_json::Value {
        let value = match self {
            Self::Connected { job_id } | Self::NotFound { job_id } => {
                Ok(serde_json::json!({ "jobId": job_id }))
            }
            Self::Progress(p) => serde_json::to_value(p),
            Self::Completed(t) | Self::Failed(t) | Self::Cancelled(t) => serde_json::to_value(t),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// The stream closes after a terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Failed(_) | Self::Cancelled(_) | Self::NotFound { .. }
        )
    }

    /// Project a store record into the event a client should see for it.
    pub fn from_view(view: &JobView) -> Self {
        let terminal = || TerminalPayload {
            output_path: view.output_path.clone(),
            error_message: view.error_message.clone(),
            error_code: view.error_code,
            suggested_actions: view.suggested_actions.clone(),
        };
        match view.status {
            JobStatus::Queued | JobStatus::Running => Self::Progress(ProgressPayload {
                percent: view.percent,
                stage: view.stage,
            }),
            JobStatus::Done => Self::Completed(terminal()),
            JobStatus::Failed => Self::Failed(terminal()),
            JobStatus::Canceled => Self::Cancelled(terminal()),
        }
    }
}
