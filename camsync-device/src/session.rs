use chrono::{DateTime, Local, Utc};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capture::{Capture, CaptureEvent};
use crate::clock::Clock;

pub const ARTIFACT_PREFIX: &str = "RECORDING_";
pub const DEFAULT_EXTENSION: &str = "mp4";
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_millis(120_000);
pub const DEFAULT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Binding,
    Recording,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxDuration,
    Requested,
    /// The capture finished on its own.
    CaptureEnded,
}

/// A validated, non-empty recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub bytes: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub stop_reason: StopReason,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind capture: {0}")]
    Binding(String),
    #[error("failed to start capture: {0}")]
    Start(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("capture did not finalize within {0:?}")]
    FinalizeTimeout(Duration),
    #[error("recording {0} is missing")]
    MissingArtifact(PathBuf),
    #[error("recording {0} is empty")]
    EmptyArtifact(PathBuf),
}

/// Exactly one of these is produced per session.
#[derive(Debug)]
pub enum SessionOutcome {
    Completed(Artifact),
    Failed(SessionError),
    /// Torn down before reaching a terminal state. Nothing is reported.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub output_dir: PathBuf,
    pub extension: String,
    pub max_duration: Duration,
    pub finalize_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            extension: DEFAULT_EXTENSION.to_string(),
            max_duration: DEFAULT_MAX_DURATION,
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
        }
    }
}

/// `<videos>/camsync`, or `./camsync` where the platform has no videos dir.
pub fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camsync")
}

/// `RECORDING_<yyyyMMdd_HHmmss>.<ext>` in local time.
pub fn artifact_path(dir: &Path, extension: &str, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}{}.{}",
        ARTIFACT_PREFIX,
        at.format("%Y%m%d_%H%M%S"),
        extension
    ))
}

type TransitionFn = Box<dyn Fn(SessionState) + Send + Sync>;

enum Stopped {
    By(StopReason),
    /// The capture already delivered its final event.
    Finalized(Result<(), String>),
    TornDown,
}

/// One recording attempt: `Idle -> Binding -> Recording -> Finalizing -> Idle`.
///
/// All state changes happen inside [`RecordingSession::run`], on the task that
/// awaits it. Once `teardown` fires the session stops emitting transitions,
/// even if a capture event is still in flight.
pub struct RecordingSession {
    settings: SessionSettings,
    clock: Arc<dyn Clock>,
    state: SessionState,
    alive: Arc<AtomicBool>,
    on_transition: Option<TransitionFn>,
}

impl RecordingSession {
    pub fn new(settings: SessionSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            state: SessionState::Idle,
            alive: Arc::new(AtomicBool::new(true)),
            on_transition: None,
        }
    }

    pub fn on_transition(mut self, f: impl Fn(SessionState) + Send + Sync + 'static) -> Self {
        self.on_transition = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, state: SessionState) {
        if !self.alive.load(Ordering::SeqCst) {
            debug!("session torn down, dropping transition to {:?}", state);
            return;
        }
        debug!("session {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(f) = &self.on_transition {
            f(state);
        }
    }

    fn tear_down(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state = SessionState::Idle;
    }

    /// Runs the session to a single terminal outcome.
    ///
    /// `stop` ends recording early; `teardown` abandons the session entirely.
    /// The capture is always unbound before this returns.
    pub async fn run(
        &mut self,
        capture: &mut dyn Capture,
        stop: CancellationToken,
        teardown: CancellationToken,
    ) -> SessionOutcome {
        let outcome = self.record(capture, &stop, &teardown).await;
        capture.unbind().await;
        match &outcome {
            SessionOutcome::Completed(artifact) => info!(
                "Recording saved: {} ({} bytes, {:?})",
                artifact.path.display(),
                artifact.bytes,
                artifact.duration
            ),
            SessionOutcome::Failed(e) => warn!("Recording failed: {}", e),
            SessionOutcome::Cancelled => info!("Recording session torn down"),
        }
        if !matches!(outcome, SessionOutcome::Cancelled) {
            self.enter(SessionState::Idle);
        }
        outcome
    }

    async fn record(
        &mut self,
        capture: &mut dyn Capture,
        stop: &CancellationToken,
        teardown: &CancellationToken,
    ) -> SessionOutcome {
        self.enter(SessionState::Binding);
        let bound = tokio::select! {
            biased;
            _ = teardown.cancelled() => None,
            result = capture.bind() => Some(result),
        };
        match bound {
            None => {
                self.tear_down();
                return SessionOutcome::Cancelled;
            }
            Some(Err(e)) => return SessionOutcome::Failed(SessionError::Binding(format!("{e:#}"))),
            Some(Ok(())) => {}
        }

        let started_at = self.clock.now();
        let output = artifact_path(
            &self.settings.output_dir,
            &self.settings.extension,
            started_at.with_timezone(&Local),
        );
        if let Err(e) = tokio::fs::create_dir_all(&self.settings.output_dir).await {
            return SessionOutcome::Failed(SessionError::Start(format!(
                "creating {}: {}",
                self.settings.output_dir.display(),
                e
            )));
        }
        let mut events = match capture.start(&output).await {
            Ok(events) => events,
            Err(e) => {
                discard(&output).await;
                return SessionOutcome::Failed(SessionError::Start(format!("{e:#}")));
            }
        };

        self.enter(SessionState::Recording);
        info!(
            "Recording to {} for at most {:?}",
            output.display(),
            self.settings.max_duration
        );
        let recording_since = Instant::now();
        let deadline = tokio::time::sleep(self.settings.max_duration);
        tokio::pin!(deadline);

        let stopped = loop {
            tokio::select! {
                biased;
                _ = teardown.cancelled() => break Stopped::TornDown,
                event = events.recv() => match event {
                    Some(CaptureEvent::Started) => continue,
                    Some(CaptureEvent::Finalized(result)) => break Stopped::Finalized(result),
                    None => break Stopped::Finalized(Err("capture went away".to_string())),
                },
                _ = stop.cancelled() => break Stopped::By(StopReason::Requested),
                _ = &mut deadline => break Stopped::By(StopReason::MaxDuration),
            }
        };

        let (stop_reason, finalized) = match stopped {
            Stopped::TornDown => {
                self.tear_down();
                if let Err(e) = capture.stop().await {
                    debug!("stopping capture on teardown: {:#}", e);
                }
                discard(&output).await;
                return SessionOutcome::Cancelled;
            }
            Stopped::Finalized(result) => (StopReason::CaptureEnded, result),
            Stopped::By(reason) => {
                self.enter(SessionState::Finalizing);
                if let Err(e) = capture.stop().await {
                    discard(&output).await;
                    return SessionOutcome::Failed(SessionError::Capture(format!("{e:#}")));
                }
                match self.await_finalized(&mut events, teardown).await {
                    Some(Ok(result)) => (reason, result),
                    Some(Err(e)) => {
                        discard(&output).await;
                        return SessionOutcome::Failed(e);
                    }
                    None => {
                        self.tear_down();
                        discard(&output).await;
                        return SessionOutcome::Cancelled;
                    }
                }
            }
        };
        let duration = recording_since.elapsed();
        if stop_reason == StopReason::CaptureEnded {
            self.enter(SessionState::Finalizing);
        }
        debug!("recording stopped ({:?}) after {:?}", stop_reason, duration);

        if let Err(e) = finalized {
            discard(&output).await;
            return SessionOutcome::Failed(SessionError::Capture(e));
        }
        match validate_artifact(&output).await {
            Ok(bytes) => SessionOutcome::Completed(Artifact {
                path: output,
                bytes,
                started_at,
                duration,
                stop_reason,
            }),
            Err(e) => SessionOutcome::Failed(e),
        }
    }

    /// `None` if torn down while waiting.
    async fn await_finalized(
        &self,
        events: &mut mpsc::UnboundedReceiver<CaptureEvent>,
        teardown: &CancellationToken,
    ) -> Option<Result<Result<(), String>, SessionError>> {
        let timeout = self.settings.finalize_timeout;
        let finalized = async {
            loop {
                match events.recv().await {
                    Some(CaptureEvent::Finalized(result)) => return result,
                    Some(CaptureEvent::Started) => continue,
                    None => return Err("capture went away before finalizing".to_string()),
                }
            }
        };
        tokio::select! {
            biased;
            _ = teardown.cancelled() => None,
            result = tokio::time::timeout(timeout, finalized) => {
                Some(result.map_err(|_| SessionError::FinalizeTimeout(timeout)))
            }
        }
    }
}

/// Returns the artifact size. Missing and empty files are failures; an
/// empty file is deleted.
pub async fn validate_artifact(path: &Path) -> Result<u64, SessionError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| SessionError::MissingArtifact(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(SessionError::MissingArtifact(path.to_path_buf()));
    }
    if meta.len() == 0 {
        discard(path).await;
        return Err(SessionError::EmptyArtifact(path.to_path_buf()));
    }
    Ok(meta.len())
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("discarded partial recording {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to discard {}: {}", path.display(), e),
    }
}
