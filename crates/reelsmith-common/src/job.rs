use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::failure::JobFailure;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    /// Whether `self -> to` is an edge of the job state machine.
    ///
    /// Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Queued, Self::Canceled)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Canceled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A named phase of the pipeline. Each stage owns a slice of the 0-100 scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Script,
    Narration,
    Visuals,
    Composition,
    Render,
    Finalization,
}

impl Stage {
    /// Stages that carry a percent band, in pipeline order.
    pub const BANDED: [Stage; 6] = [
        Stage::Script,
        Stage::Narration,
        Stage::Visuals,
        Stage::Composition,
        Stage::Render,
        Stage::Finalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Script => "script",
            Self::Narration => "narration",
            Self::Visuals => "visuals",
            Self::Composition => "composition",
            Self::Render => "render",
            Self::Finalization => "finalization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "script" => Ok(Self::Script),
            "narration" => Ok(Self::Narration),
            "visuals" => Ok(Self::Visuals),
            "composition" => Ok(Self::Composition),
            "render" => Ok(Self::Render),
            "finalization" => Ok(Self::Finalization),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// The authoritative job record, owned by the server-side job registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub percent: u8,
    pub stage: Stage,
    pub output_path: Option<PathBuf>,
    pub failure: Option<JobFailure>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last time `percent` advanced. Stuck detection measures from here.
    pub last_progress_at: DateTime<Utc>,
    /// Bumped on every write; replicas discard anything not newer.
    pub revision: u64,
}

impl Job {
    pub fn new(correlation_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            percent: 0,
            stage: Stage::Queued,
            output_path: None,
            failure: None,
            correlation_id: correlation_id.into(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            last_progress_at: now,
            revision: 1,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }
}

/// Client-facing projection of a [`Job`], served by polling and mirrored
/// into push events. Field names are camelCase on the wire regardless of
/// the Rust naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub percent: u8,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<crate::failure::ErrorCode>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub suggested_actions: Vec<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub revision: u64,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            percent: job.percent,
            stage: job.stage,
            output_path: job
                .output_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            error_message: job.failure.as_ref().map(|f| f.message.clone()),
            error_code: job.failure.as_ref().map(|f| f.error_code),
            suggested_actions: job
                .failure
                .as_ref()
                .map(|f| f.suggested_actions.clone())
                .unwrap_or_default(),
            updated_at: job.updated_at,
            revision: job.revision,
        }
    }
}
