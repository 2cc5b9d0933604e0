//! Supervision of one encoder process.
//!
//! The monitor spawns the encoder, reads stdout and stderr line by line
//! (splitting on both `\r` and `\n`), turns time readings into render
//! progress, and decides completion explicitly: a `progress=end` marker or
//! exit status 0. Silence is never treated as completion.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::encoder::EncoderCommand;
use crate::encoder::parse::{EncoderLine, try_parse_line};
use crate::errors::EncoderError;

/// Lines of output kept for the failure message.
const TAIL_LINES: usize = 20;
/// How long to keep reading after the encoder has exited.
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(500);

/// One progress reading within the render stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderProgress {
    /// 0-100 within the render stage.
    pub percent_within_stage: f64,
    pub elapsed: Duration,
    pub remaining_estimate: Option<Duration>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    EndMarker,
    CleanExit,
}

#[derive(Debug, Clone)]
pub struct EncoderOutcome {
    pub completion: Completion,
    pub output: PathBuf,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct EncoderMonitor {
    timeout: Duration,
    grace_period: Duration,
}

enum Interrupt {
    Canceled,
    TimedOut,
}

enum Watched {
    Line(Option<String>),
    Exited(std::io::Result<std::process::ExitStatus>),
}

impl EncoderMonitor {
    pub fn new(timeout: Duration, grace_period: Duration) -> Self {
        Self {
            timeout,
            grace_period,
        }
    }

    /// Run the encoder to completion, calling `on_progress` for each
    /// percent advance.
    pub async fn run<F>(
        &self,
        command: &EncoderCommand,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<EncoderOutcome, EncoderError>
    where
        F: FnMut(RenderProgress) + Send,
    {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| EncoderError::SpawnFailed {
            program: command.program.clone(),
            source,
        })?;
        info!(
            program = %command.program,
            pid = child.id().unwrap_or(0),
            output = %command.output.display(),
            "Encoder spawned"
        );

        let (tx, mut rx) = mpsc::channel::<String>(256);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let started = Instant::now();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut state = RenderState::new(command.expected_duration);

        // Read until both pipes close or the process exits, whichever is
        // first. A grandchild may hold the pipes open after the encoder is
        // gone, so exit alone ends the loop.
        let mut exited = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Canceled),
                _ = &mut deadline => Err(Interrupt::TimedOut),
                line = rx.recv() => Ok(Watched::Line(line)),
                status = child.wait() => Ok(Watched::Exited(status)),
            };
            match next {
                Ok(Watched::Line(Some(line))) => {
                    if let Some(progress) = state.observe(&line, started.elapsed()) {
                        on_progress(progress);
                    }
                }
                Ok(Watched::Line(None)) => break,
                Ok(Watched::Exited(status)) => {
                    exited = Some(status?);
                    break;
                }
                Err(interrupt) => return Err(self.interrupt(&mut child, interrupt).await),
            }
        }

        let status = match exited {
            Some(status) => {
                // Pick up output still in flight, without waiting on pipes
                // that something else keeps open.
                let drain = async {
                    while let Some(line) = rx.recv().await {
                        if let Some(progress) = state.observe(&line, started.elapsed()) {
                            on_progress(progress);
                        }
                    }
                };
                if tokio::time::timeout(DRAIN_AFTER_EXIT, drain).await.is_err() {
                    debug!("Encoder output still open after exit");
                }
                status
            }
            None => {
                let waited = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Interrupt::Canceled),
                    _ = &mut deadline => Err(Interrupt::TimedOut),
                    status = child.wait() => Ok(status),
                };
                match waited {
                    Ok(status) => status?,
                    Err(interrupt) => return Err(self.interrupt(&mut child, interrupt).await),
                }
            }
        };
        for reader in readers {
            reader.abort();
        }

        if !status.success() {
            warn!(code = ?status.code(), "Encoder exited with failure");
            return Err(EncoderError::NonZeroExit {
                code: status.code(),
                tail: state.tail(),
            });
        }

        let completion = if state.ended {
            Completion::EndMarker
        } else {
            if let Some(progress) = state.advance(100.0, started.elapsed(), "encoder exited") {
                on_progress(progress);
            }
            Completion::CleanExit
        };
        debug!(?completion, "Encoder finished");

        Ok(EncoderOutcome {
            completion,
            output: command.output.clone(),
            elapsed: started.elapsed(),
        })
    }

    async fn interrupt(&self, child: &mut Child, interrupt: Interrupt) -> EncoderError {
        terminate(child, self.grace_period).await;
        match interrupt {
            Interrupt::Canceled => {
                info!("Encoder terminated on cancel");
                EncoderError::Canceled
            }
            Interrupt::TimedOut => {
                warn!(timeout_secs = self.timeout.as_secs(), "Encoder timed out");
                EncoderError::Timeout {
                    secs: self.timeout.as_secs(),
                }
            }
        }
    }
}

/// SIGTERM first so the encoder can finish the container; kill after the
/// grace period.
async fn terminate(child: &mut Child, grace_period: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child, which has not been reaped yet.
        let sent = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0;
        if sent && matches!(tokio::time::timeout(grace_period, child.wait()).await, Ok(Ok(_))) {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace_period;

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Encoder already gone");
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(reader).split(b'\r');
        while let Ok(Some(segment)) = segments.next_segment().await {
            let text = String::from_utf8_lossy(&segment);
            for line in text.split('\n') {
                if tx.send(line.to_string()).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Accumulated view of the encoder's output.
struct RenderState {
    total: Option<Duration>,
    last_whole_percent: Option<u8>,
    ended: bool,
    tail: VecDeque<String>,
}

impl RenderState {
    fn new(total: Option<Duration>) -> Self {
        Self {
            total: total.filter(|d| !d.is_zero()),
            last_whole_percent: None,
            ended: false,
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn observe(&mut self, line: &str, elapsed: Duration) -> Option<RenderProgress> {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            if self.tail.len() == TAIL_LINES {
                self.tail.pop_front();
            }
            self.tail.push_back(trimmed.to_string());
        }

        match try_parse_line(trimmed)? {
            EncoderLine::TotalDuration(total) => {
                if self.total.is_none() && !total.is_zero() {
                    self.total = Some(total);
                }
                None
            }
            EncoderLine::Time(encoded) => {
                let total = self.total?;
                let percent = encoded.as_secs_f64() / total.as_secs_f64() * 100.0;
                let message = format!(
                    "encoded {:.1}s of {:.1}s",
                    encoded.as_secs_f64(),
                    total.as_secs_f64()
                );
                self.advance(percent, elapsed, &message)
            }
            EncoderLine::Continue => None,
            EncoderLine::End => {
                if self.ended {
                    return None;
                }
                self.ended = true;
                self.advance(100.0, elapsed, "finalizing output")
            }
        }
    }

    /// Emit only when the whole-percent value moves forward.
    fn advance(&mut self, percent: f64, elapsed: Duration, message: &str) -> Option<RenderProgress> {
        let percent = percent.clamp(0.0, 100.0);
        let whole = percent.floor() as u8;
        if self.last_whole_percent.is_some_and(|last| whole <= last) {
            return None;
        }
        self.last_whole_percent = Some(whole);

        let remaining_estimate = (percent > 0.0 && percent < 100.0)
            .then(|| elapsed.mul_f64((100.0 - percent) / percent));
        Some(RenderProgress {
            percent_within_stage: percent,
            elapsed,
            remaining_estimate,
            message: message.to_string(),
        })
    }

    fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_state_needs_a_total() {
        let mut state = RenderState::new(None);
        assert!(state.observe("time=00:00:05.00", Duration::from_secs(1)).is_none());

        state.observe("  Duration: 00:00:10.00, start: 0.0", Duration::from_secs(1));
        let p = state
            .observe("frame=1 time=00:00:05.00 bitrate=1", Duration::from_secs(2))
            .unwrap();
        assert_eq!(p.percent_within_stage, 50.0);
        assert_eq!(p.remaining_estimate, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_render_state_is_monotonic_and_ends_once() {
        let mut state = RenderState::new(Some(Duration::from_secs(10)));
        assert!(state.observe("out_time_ms=6000000", Duration::ZERO).is_some());
        assert!(state.observe("out_time_ms=4000000", Duration::ZERO).is_none());
        assert!(state.observe("out_time_ms=6000000", Duration::ZERO).is_none());

        let end = state.observe("progress=end", Duration::ZERO).unwrap();
        assert_eq!(end.percent_within_stage, 100.0);
        assert!(state.ended);
        assert!(state.observe("progress=end", Duration::ZERO).is_none());
    }

    #[test]
    fn test_tail_is_bounded() {
        let mut state = RenderState::new(None);
        for i in 0..50 {
            state.observe(&format!("line {i}"), Duration::ZERO);
        }
        let tail = state.tail();
        assert!(tail.starts_with("line 30"));
        assert!(tail.ends_with("line 49"));
    }

    #[cfg(unix)]
    fn sh(script: &str, output: PathBuf) -> EncoderCommand {
        EncoderCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            output,
            expected_duration: Some(Duration::from_secs(10)),
            working_dir: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_end_marker_completes() {
        let monitor = EncoderMonitor::new(Duration::from_secs(10), Duration::from_millis(200));
        let script = r"printf 'out_time_ms=5000000\nprogress=continue\n'; printf 'frame=2 time=00:00:09.00 x=1\r'; printf 'progress=end\n'";
        let mut seen = Vec::new();

        let outcome = monitor
            .run(&sh(script, "/tmp/out.mp4".into()), &CancellationToken::new(), |p| {
                seen.push(p.percent_within_stage)
            })
            .await
            .unwrap();

        assert_eq!(outcome.completion, Completion::EndMarker);
        assert_eq!(seen, vec![50.0, 90.0, 100.0]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_completes_without_marker() {
        let monitor = EncoderMonitor::new(Duration::from_secs(10), Duration::from_millis(200));
        let outcome = monitor
            .run(&sh("echo encoding >&2", "/tmp/o.mp4".into()), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.completion, Completion::CleanExit);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_completes_while_grandchild_holds_pipes() {
        let monitor = EncoderMonitor::new(Duration::from_secs(5), Duration::from_millis(200));
        let started = Instant::now();

        let outcome = monitor
            .run(
                &sh("sleep 30 & echo progress=end; exit 0", "/tmp/o.mp4".into()),
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(outcome.completion, Completion::EndMarker);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_tail() {
        let monitor = EncoderMonitor::new(Duration::from_secs(10), Duration::from_millis(200));
        let err = monitor
            .run(
                &sh("echo 'Invalid filtergraph' >&2; exit 3", "/tmp/o.mp4".into()),
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap_err();
        match err {
            EncoderError::NonZeroExit { code, tail } => {
                assert_eq!(code, Some(3));
                assert!(tail.contains("Invalid filtergraph"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_process() {
        let monitor = EncoderMonitor::new(Duration::from_secs(30), Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = monitor
            .run(&sh("exec sleep 30", "/tmp/o.mp4".into()), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let monitor = EncoderMonitor::new(Duration::from_millis(150), Duration::from_millis(100));
        let err = monitor
            .run(&sh("exec sleep 30", "/tmp/o.mp4".into()), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure() {
        let monitor = EncoderMonitor::new(Duration::from_secs(1), Duration::from_millis(100));
        let cmd = EncoderCommand {
            program: "/definitely/not/an/encoder".into(),
            args: vec![],
            output: "/tmp/o.mp4".into(),
            expected_duration: None,
            working_dir: None,
        };
        let err = monitor
            .run(&cmd, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::SpawnFailed { .. }));
    }
}
