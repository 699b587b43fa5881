//! The capture capability a recording session drives.
//!
//! The session never touches a camera itself. It binds a [`Capture`], starts
//! it with an output path, stops it, and waits for the capture to report
//! that the artifact is finalized.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

/// Reported by a capture after `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Started,
    /// The output file is complete (or the capture failed). Sent once.
    Finalized(Result<(), String>),
}

#[async_trait]
pub trait Capture: Send + 'static {
    /// Acquires the device. Fails if it is unavailable or already bound.
    async fn bind(&mut self) -> anyhow::Result<()>;

    /// Begins writing to `output`. Events for this capture arrive on the
    /// returned channel.
    async fn start(&mut self, output: &Path)
        -> anyhow::Result<mpsc::UnboundedReceiver<CaptureEvent>>;

    /// Asks the capture to stop. Completion is reported as
    /// [`CaptureEvent::Finalized`].
    async fn stop(&mut self) -> anyhow::Result<()>;

    /// Releases the device. Safe to call when not bound.
    async fn unbind(&mut self);
}

/// Records by running an external command, e.g.
/// `ffmpeg -y -f v4l2 -i /dev/video0 {output}`.
///
/// `{output}` in any argument is replaced with the artifact path. Stopping
/// writes the quit sequence to the recorder's stdin and kills it if it has
/// not exited after the grace period.
pub struct ProcessCapture {
    command: Vec<String>,
    quit_sequence: Vec<u8>,
    stop_grace: Duration,
    bound: bool,
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessCapture {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            quit_sequence: b"q".to_vec(),
            stop_grace: Duration::from_secs(5),
            bound: false,
            stdin: None,
            kill: None,
        }
    }

    pub fn with_quit_sequence(mut self, quit: impl Into<Vec<u8>>) -> Self {
        self.quit_sequence = quit.into();
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn command_for(&self, output: &Path) -> anyhow::Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("no capture command configured"))?;
        let output = output.to_string_lossy();
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|arg| arg.replace("{output}", &output)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

async fn watch_child(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<CaptureEvent>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            warn!("recorder did not exit in time, killing it");
            if let Err(e) = child.start_kill() {
                warn!("failed to kill recorder: {}", e);
            }
            child.wait().await
        }
    };

    let result = match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("recorder exited with {status}")),
        Err(e) => Err(format!("failed to wait for recorder: {e}")),
    };
    debug!("recorder finished: {:?}", result);
    let _ = events.send(CaptureEvent::Finalized(result));
}

#[async_trait]
impl Capture for ProcessCapture {
    async fn bind(&mut self) -> anyhow::Result<()> {
        if self.bound {
            bail!("capture is already bound");
        }
        if self.command.is_empty() {
            bail!("no capture command configured");
        }
        self.bound = true;
        Ok(())
    }

    async fn start(
        &mut self,
        output: &Path,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<CaptureEvent>> {
        if !self.bound {
            bail!("capture is not bound");
        }
        let mut child = self
            .command_for(output)?
            .spawn()
            .with_context(|| format!("spawning recorder {:?}", self.command))?;
        info!("Recorder started (pid {:?}) -> {}", child.id(), output.display());

        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.stdin = child.stdin.take();
        self.kill = Some(kill_tx);
        let _ = tx.send(CaptureEvent::Started);
        tokio::spawn(watch_child(child, kill_rx, tx));
        Ok(rx)
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let mut stdin = self.stdin.take().context("recorder is not running")?;
        let quit = stdin.write_all(&self.quit_sequence).await;
        drop(stdin);

        if let Some(kill) = self.kill.take() {
            let grace = self.stop_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = kill.send(());
            });
        }
        quit.context("writing quit sequence to recorder")
    }

    async fn unbind(&mut self) {
        self.stdin = None;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.bound = false;
    }
}

/// What a [`FakeCapture`] does when driven.
#[derive(Debug, Clone)]
pub struct FakeCaptureBehavior {
    pub fail_bind: Option<String>,
    pub fail_start: Option<String>,
    /// Bytes written to the artifact on stop. 0 leaves an empty file.
    pub bytes: usize,
    pub finalize_error: Option<String>,
    pub finalize_delay: Duration,
    /// Finalize on its own after this long, as if the engine stopped.
    pub end_after: Option<Duration>,
}

impl Default for FakeCaptureBehavior {
    fn default() -> Self {
        Self {
            fail_bind: None,
            fail_start: None,
            bytes: 1024,
            finalize_error: None,
            finalize_delay: Duration::ZERO,
            end_after: None,
        }
    }
}

#[derive(Default)]
struct FakeCaptureState {
    behavior: FakeCaptureBehavior,
    calls: Vec<&'static str>,
    bound: bool,
    output: Option<PathBuf>,
    events: Option<mpsc::UnboundedSender<CaptureEvent>>,
}

/// In-memory capture for tests. Clones share state, so a test can keep one
/// handle while the session owns another.
#[derive(Clone, Default)]
pub struct FakeCapture {
    state: Arc<Mutex<FakeCaptureState>>,
}

impl FakeCapture {
    pub fn new(behavior: FakeCaptureBehavior) -> Self {
        let capture = Self::default();
        capture.state.lock().unwrap().behavior = behavior;
        capture
    }

    pub fn set_behavior(&self, behavior: FakeCaptureBehavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().unwrap().bound
    }

    fn finalize_later(&self, delay: Duration) {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state.lock().unwrap();
            let Some(events) = state.events.take() else {
                return;
            };
            let result = match (&state.behavior.finalize_error, &state.output) {
                (Some(err), _) => Err(err.clone()),
                (None, Some(path)) => std::fs::write(path, vec![0u8; state.behavior.bytes])
                    .map_err(|e| e.to_string()),
                (None, None) => Err("no output".to_string()),
            };
            state.calls.push("finalized");
            let _ = events.send(CaptureEvent::Finalized(result));
        });
    }
}

#[async_trait]
impl Capture for FakeCapture {
    async fn bind(&mut self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("bind");
        if let Some(err) = &state.behavior.fail_bind {
            bail!("{}", err);
        }
        if state.bound {
            bail!("capture is already bound");
        }
        state.bound = true;
        Ok(())
    }

    async fn start(
        &mut self,
        output: &Path,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<CaptureEvent>> {
        let end_after = {
            let mut state = self.state.lock().unwrap();
            state.calls.push("start");
            if let Some(err) = &state.behavior.fail_start {
                bail!("{}", err);
            }
            std::fs::File::create(output)
                .with_context(|| format!("creating {}", output.display()))?;
            state.output = Some(output.to_path_buf());
            state.behavior.end_after
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(CaptureEvent::Started);
        self.state.lock().unwrap().events = Some(tx);
        if let Some(after) = end_after {
            self.finalize_later(after);
        }
        Ok(rx)
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push("stop");
            state.behavior.finalize_delay
        };
        self.finalize_later(delay);
        Ok(())
    }

    async fn unbind(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push("unbind");
        state.bound = false;
        state.events = None;
    }
}
