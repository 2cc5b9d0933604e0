//! Mapping of per-stage progress onto the job's single 0-100 percent.

use reelsmith_common::{JobId, Stage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::job::registry::JobRegistry;

/// Highest percent reachable through progress reports. 100 is written only
/// by the completion transition.
pub const MAX_REPORTED_PERCENT: u8 = 99;

/// The slice `[start, end]` of the overall scale owned by one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRange {
    pub start: u8,
    pub end: u8,
}

impl StageRange {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub fn width(&self) -> u8 {
        self.end.saturating_sub(self.start)
    }
}

/// Configurable stage table (`[stages]` in `reelsmith.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRanges {
    pub script: StageRange,
    pub narration: StageRange,
    pub visuals: StageRange,
    pub composition: StageRange,
    pub render: StageRange,
    pub finalization: StageRange,
}

impl Default for StageRanges {
    fn default() -> Self {
        Self {
            script: StageRange::new(0, 15),
            narration: StageRange::new(15, 35),
            visuals: StageRange::new(35, 65),
            composition: StageRange::new(65, 80),
            render: StageRange::new(80, 99),
            finalization: StageRange::new(99, 100),
        }
    }
}

impl StageRanges {
    pub fn range(&self, stage: Stage) -> StageRange {
        match stage {
            Stage::Queued => StageRange::new(0, 0),
            Stage::Script => self.script,
            Stage::Narration => self.narration,
            Stage::Visuals => self.visuals,
            Stage::Composition => self.composition,
            Stage::Render => self.render,
            Stage::Finalization => self.finalization,
        }
    }

    /// Overall percent for `within` percent (0-100) of `stage`.
    ///
    /// Floors, and never exceeds [`MAX_REPORTED_PERCENT`]. With the default
    /// table a finished render maps to 80 + floor(100 * 19 / 100) = 99.
    pub fn map(&self, stage: Stage, within: f64) -> u8 {
        let range = self.range(stage);
        let within = if within.is_finite() {
            within.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let offset = (within * f64::from(range.width()) / 100.0).floor() as u8;
        range
            .start
            .saturating_add(offset)
            .min(range.end)
            .min(MAX_REPORTED_PERCENT)
    }

    pub fn start(&self, stage: Stage) -> u8 {
        self.map(stage, 0.0)
    }

    pub fn end(&self, stage: Stage) -> u8 {
        self.map(stage, 100.0)
    }

    /// Problems with the table, if any: ranges must be ascending and
    /// contiguous from 0, and finalization must end at 100.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut expected_start = 0u8;
        for stage in Stage::BANDED {
            let range = self.range(stage);
            if range.start >= range.end {
                problems.push(format!(
                    "stages.{}: start {} must be below end {}",
                    stage, range.start, range.end
                ));
            }
            if range.start != expected_start {
                problems.push(format!(
                    "stages.{}: starts at {} but the previous stage ends at {}",
                    stage, range.start, expected_start
                ));
            }
            expected_start = range.end;
        }
        if self.finalization.end != 100 {
            problems.push(format!(
                "stages.finalization: must end at 100, not {}",
                self.finalization.end
            ));
        }
        problems
    }
}

/// Handle a task uses to report progress within its stage.
///
/// Bound to one job in the registry; a detached reporter (tests, dry runs)
/// drops every report.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    ranges: StageRanges,
    registry: Option<JobRegistry>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, ranges: StageRanges, registry: JobRegistry) -> Self {
        Self {
            job_id,
            ranges,
            registry: Some(registry),
        }
    }

    pub fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            ranges: StageRanges::default(),
            registry: None,
        }
    }

    /// Report `within` percent (0-100) of `stage`. Never fails the task:
    /// a job that stopped running simply ignores late reports.
    pub fn report(&self, stage: Stage, within: f64) {
        let Some(ref registry) = self.registry else {
            return;
        };
        let percent = self.ranges.map(stage, within);
        if let Err(e) = registry.record_progress(self.job_id, stage, percent) {
            debug!(job_id = %self.job_id, stage = %stage, error = %e, "Progress report ignored");
        }
    }

    pub fn stage_started(&self, stage: Stage) {
        self.report(stage, 0.0);
    }

    pub fn stage_finished(&self, stage: Stage) {
        self.report(stage, 100.0);
    }
}
