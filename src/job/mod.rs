//! Job lifecycle: the canonical registry, stage-to-percent mapping, the
//! stuck-job watchdog, and the per-job context threaded through tasks.

mod progress;
mod registry;
mod watchdog;

pub use progress::{MAX_REPORTED_PERCENT, ProgressReporter, StageRange, StageRanges};
pub use registry::JobRegistry;
pub use watchdog::Watchdog;

use reelsmith_common::JobId;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dag::RecoveryChannel;

/// Everything job-scoped that a task may need. Cheap to clone; clones
/// share the recovery channel, the cancellation token and the registry.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub correlation_id: String,
    pub ranges: StageRanges,
    pub recovery: RecoveryChannel,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

impl JobContext {
    /// A context bound to no registry. Progress reports are dropped.
    pub fn detached() -> Self {
        let job_id = Uuid::new_v4();
        Self {
            job_id,
            correlation_id: job_id.to_string(),
            ranges: StageRanges::default(),
            recovery: RecoveryChannel::new(),
            cancel: CancellationToken::new(),
            progress: ProgressReporter::detached(job_id),
        }
    }

    /// Same job, observed through a different cancellation token.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}
