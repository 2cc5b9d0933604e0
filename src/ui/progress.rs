//! Terminal progress for `reelsmith run` and `reelsmith watch`.
//!
//! Three output modes:
//! - `full`: an `indicatif` bar for overall percent plus one line per task transition
//! - `minimal`: one plain line whenever percent or stage changes
//! - `json`: each job view and task event as a JSON line

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use console::{Term, style};
use indicatif::{ProgressBar, ProgressStyle};
use reelsmith_common::{JobStatus, JobView, Stage};

use crate::dag::{NodeState, OrchestrationProgress};
use crate::ui::icons::{CHECK, CLOCK, CROSS, RECOVERED, RUNNING, SPARKLE, STOP};

/// Output mode for the job UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Progress bar with colors
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

pub struct JobProgressUi {
    mode: UiMode,
    bar: ProgressBar,
    term: Term,
    last: Mutex<Option<(u8, Stage)>>,
}

impl JobProgressUi {
    pub fn new(title: &str, mode: UiMode) -> Self {
        let bar = if mode == UiMode::Full {
            let style = ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .expect("progress bar template is a valid static string")
                .progress_chars("█▓▒░");
            let bar = ProgressBar::new(100);
            bar.set_style(style);
            bar.set_prefix(title.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            mode,
            bar,
            term: Term::stdout(),
            last: Mutex::new(None),
        }
    }

    /// Render a job view. Repeats of the last percent and stage are skipped.
    pub fn on_view(&self, view: &JobView) {
        let position = (view.percent, view.stage);
        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if *last == Some(position) && !view.status.is_terminal() {
                return;
            }
            *last = Some(position);
        }

        match self.mode {
            UiMode::Json => self.json_line(view),
            UiMode::Minimal => {
                let _ = writeln!(
                    &self.term,
                    "{:>3}% {} ({})",
                    view.percent, view.stage, view.status
                );
            }
            UiMode::Full => {
                self.bar.set_position(u64::from(view.percent));
                self.bar.set_message(format!("{}", style(view.stage).cyan()));
            }
        }
    }

    /// Render a task transition.
    pub fn on_task(&self, event: &OrchestrationProgress) {
        match self.mode {
            UiMode::Json => self.json_line(event),
            UiMode::Minimal => {
                if event.to.is_terminal() {
                    let _ = writeln!(&self.term, "{} {}", event.task_id, event.to.as_str());
                }
            }
            UiMode::Full => {
                let line = match event.to {
                    NodeState::Running => format!("{}{}", RUNNING, style(&event.task_id).yellow()),
                    NodeState::Succeeded => format!("{}{}", CHECK, event.task_id),
                    NodeState::Recovered => format!(
                        "{}{} recovered ({})",
                        RECOVERED,
                        style(&event.task_id).yellow(),
                        style(event.error.as_deref().unwrap_or("fallback")).dim()
                    ),
                    NodeState::Failed => format!(
                        "{}{} {}",
                        CROSS,
                        style(&event.task_id).red(),
                        style(event.error.as_deref().unwrap_or("failed")).dim()
                    ),
                    NodeState::Pending => return,
                };
                self.bar.println(line);
            }
        }
    }

    /// Close the bar and print the outcome.
    pub fn finish(&self, view: &JobView) {
        self.on_view(view);
        if self.mode == UiMode::Json {
            return;
        }
        self.bar.finish_and_clear();

        let summary = match view.status {
            JobStatus::Done => format!(
                "{}Done: {}",
                SPARKLE,
                style(view.output_path.as_deref().unwrap_or("-")).green().bold()
            ),
            JobStatus::Canceled => format!("{}Canceled at {}%", STOP, view.percent),
            JobStatus::Failed => {
                let mut text = format!(
                    "{}Failed [{}]: {}",
                    CROSS,
                    view.error_code.map(|c| c.as_str()).unwrap_or("unknown"),
                    style(view.error_message.as_deref().unwrap_or("no message")).red()
                );
                for action in &view.suggested_actions {
                    text.push_str(&format!("\n   - {}", action));
                }
                text
            }
            JobStatus::Queued | JobStatus::Running => {
                format!("{}{} at {}% ({})", CLOCK, view.status, view.percent, view.stage)
            }
        };
        let _ = writeln!(&self.term, "{}", summary);
    }

    /// Report a watch that gave up on a frozen job.
    pub fn stuck(&self, view: &JobView, threshold: Duration) {
        self.bar.abandon();
        let _ = writeln!(
            &self.term,
            "{}No progress at {}% ({}) for over {}s",
            CLOCK,
            view.percent,
            view.stage,
            threshold.as_secs()
        );
    }

    fn json_line<T: serde::Serialize>(&self, value: &T) {
        if let Ok(json) = serde_json::to_string(value) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!("json".parse::<UiMode>().unwrap(), UiMode::Json);
        assert_eq!("MINIMAL".parse::<UiMode>().unwrap(), UiMode::Minimal);
        assert_eq!("anything".parse::<UiMode>().unwrap(), UiMode::Full);
    }

    #[test]
    fn test_repeated_view_is_skipped() {
        let ui = JobProgressUi::new("t", UiMode::Minimal);
        let mut job = reelsmith_common::Job::new("c", chrono::Utc::now());
        job.status = JobStatus::Running;
        job.percent = 30;
        job.stage = Stage::Narration;
        let view = JobView::from(&job);

        ui.on_view(&view);
        assert_eq!(*ui.last.lock().unwrap(), Some((30, Stage::Narration)));
        ui.on_view(&view);
        assert_eq!(*ui.last.lock().unwrap(), Some((30, Stage::Narration)));
    }
}
