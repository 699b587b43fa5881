//! The device actor.
//!
//! One task owns the role coordinator, the armed scheduler task and the
//! active recording session. The UI layer talks to it through a
//! [`DeviceHandle`] and observes it through [`DeviceEvent`]s.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use camsync_proto::relay::{DeviceType, RelayMessage};

use crate::capture::Capture;
use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::connection::ConnectionManager;
use crate::coordinator::{CoordinatorError, Role, RoleCoordinator};
use crate::latest::Subscription;
use crate::scheduler::{ArmOutcome, SyncScheduler};
use crate::session::{Artifact, RecordingSession, SessionOutcome, SessionSettings, SessionState};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("device controller has stopped")]
    Stopped,
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[derive(Debug)]
pub enum DeviceCommand {
    SelectRole(DeviceType, oneshot::Sender<Result<String, CoordinatorError>>),
    Trigger(oneshot::Sender<Result<(), CoordinatorError>>),
    StopRecording,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected { device_id: String, role: Role },
    ConnectionFailed(String),
    TriggerSent(RelayMessage),
    Armed { origin: Option<String> },
    /// Seconds until the alignment boundary while armed.
    Countdown(u32),
    ArmExpired,
    Released { at: DateTime<Utc>, missed: u32 },
    SessionState(SessionState),
    RecordingFinished(Artifact),
    RecordingFailed(String),
}

/// Cloneable front end to a running [`DeviceController`].
#[derive(Clone)]
pub struct DeviceHandle {
    commands: mpsc::Sender<DeviceCommand>,
    countdown: watch::Receiver<Option<u32>>,
}

impl DeviceHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DeviceCommand,
    ) -> Result<T, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    /// Connects under `device_type`, replacing any previous role and
    /// connection. Returns the new device id.
    pub async fn select_role(&self, device_type: DeviceType) -> Result<String, ControllerError> {
        Ok(self
            .request(|reply| DeviceCommand::SelectRole(device_type, reply))
            .await??)
    }

    pub async fn trigger(&self) -> Result<(), ControllerError> {
        Ok(self.request(DeviceCommand::Trigger).await??)
    }

    pub async fn stop_recording(&self) -> Result<(), ControllerError> {
        self.commands
            .send(DeviceCommand::StopRecording)
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    /// Returns once owned tasks are cancelled and the connection is closed.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.request(DeviceCommand::Shutdown).await
    }

    pub fn countdown(&self) -> watch::Receiver<Option<u32>> {
        self.countdown.clone()
    }
}

enum Internal {
    ArmFinished { attempt: u64, outcome: ArmOutcome },
    SessionFinished { attempt: u64, outcome: SessionOutcome },
}

struct ArmTask {
    attempt: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionTask {
    attempt: u64,
    stop: CancellationToken,
    teardown: CancellationToken,
    handle: JoinHandle<Box<dyn Capture>>,
}

pub struct DeviceController {
    coordinator: RoleCoordinator,
    scheduler: Arc<SyncScheduler>,
    session_settings: SessionSettings,
    clock: Arc<dyn Clock>,
    /// `None` while a session owns it.
    capture: Option<Box<dyn Capture>>,
    inbound: Subscription<RelayMessage>,
    commands: mpsc::Receiver<DeviceCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    arm: Option<ArmTask>,
    session: Option<SessionTask>,
    next_attempt: u64,
}

impl DeviceController {
    /// Starts the controller task.
    pub fn spawn(
        config: &DeviceConfig,
        connection: Arc<ConnectionManager>,
        clock: Arc<dyn Clock>,
        capture: Box<dyn Capture>,
    ) -> (DeviceHandle, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(SyncScheduler::new(clock.clone(), config.scheduler_settings()));
        let handle = DeviceHandle {
            commands: command_tx,
            countdown: scheduler.countdown(),
        };

        let controller = DeviceController {
            coordinator: RoleCoordinator::new(connection.clone(), clock.clone())
                .with_legacy_trigger(config.legacy_trigger),
            scheduler,
            session_settings: config.session_settings(),
            clock,
            capture: Some(capture),
            inbound: connection.subscribe(),
            commands: command_rx,
            internal_tx,
            internal_rx,
            events: event_tx,
            arm: None,
            session: None,
            next_attempt: 0,
        };
        tokio::spawn(controller.run());
        (handle, event_rx)
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!("no event listener");
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(message) = self.inbound.recv() => self.handle_inbound(&message),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
            }
        }
        info!("Device controller stopped");
    }

    /// Returns false once the controller should stop.
    async fn handle_command(&mut self, command: DeviceCommand) -> bool {
        match command {
            DeviceCommand::SelectRole(device_type, reply) => {
                self.cancel_tasks().await;
                let result = self.coordinator.select_role(device_type).await;
                match &result {
                    Ok(device_id) => self.emit(DeviceEvent::Connected {
                        device_id: device_id.clone(),
                        role: self.coordinator.role(),
                    }),
                    Err(e) => self.emit(DeviceEvent::ConnectionFailed(e.to_string())),
                }
                let _ = reply.send(result);
            }
            DeviceCommand::Trigger(reply) => {
                let result = self.coordinator.trigger().await.map(|message| {
                    self.emit(DeviceEvent::TriggerSent(message));
                });
                let _ = reply.send(result);
            }
            DeviceCommand::StopRecording => match &self.session {
                Some(session) => session.stop.cancel(),
                None => debug!("stop requested with no recording in progress"),
            },
            DeviceCommand::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_inbound(&mut self, message: &RelayMessage) {
        let Some(request) = self.coordinator.on_inbound(message) else {
            return;
        };
        self.emit(DeviceEvent::Armed {
            origin: request.origin,
        });
        self.start_arm();
    }

    fn start_arm(&mut self) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let cancel = CancellationToken::new();
        let scheduler = self.scheduler.clone();
        let internal = self.internal_tx.clone();
        let events = self.events.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut countdown = scheduler.countdown();
            let release = scheduler.wait_for_release(&token);
            tokio::pin!(release);
            let outcome = loop {
                tokio::select! {
                    biased;
                    outcome = &mut release => break outcome,
                    Ok(()) = countdown.changed() => {
                        let remaining = *countdown.borrow_and_update();
                        if let Some(seconds) = remaining {
                            let _ = events.send(DeviceEvent::Countdown(seconds));
                        }
                    }
                }
            };
            let _ = internal.send(Internal::ArmFinished { attempt, outcome });
        });

        self.arm = Some(ArmTask {
            attempt,
            cancel,
            handle,
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ArmFinished { attempt, outcome } => {
                if self.arm.as_ref().map(|a| a.attempt) != Some(attempt) {
                    debug!("ignoring stale arm result #{}", attempt);
                    return;
                }
                self.arm = None;
                match outcome {
                    ArmOutcome::Released { at, missed } => {
                        self.emit(DeviceEvent::Released { at, missed });
                        self.start_session(attempt);
                    }
                    ArmOutcome::Expired { waited } => {
                        warn!("trigger expired after {:?} without a release", waited);
                        self.coordinator.mark_idle();
                        self.emit(DeviceEvent::ArmExpired);
                    }
                    ArmOutcome::Cancelled => self.coordinator.mark_idle(),
                }
            }
            Internal::SessionFinished { attempt, outcome } => {
                if self.session.as_ref().map(|s| s.attempt) != Some(attempt) {
                    debug!("ignoring stale session result #{}", attempt);
                    return;
                }
                if let Some(session) = self.session.take() {
                    self.reclaim_capture(session.handle).await;
                }
                self.coordinator.mark_idle();
                match outcome {
                    SessionOutcome::Completed(artifact) => {
                        self.emit(DeviceEvent::RecordingFinished(artifact))
                    }
                    SessionOutcome::Failed(e) => self.emit(DeviceEvent::RecordingFailed(e.to_string())),
                    SessionOutcome::Cancelled => {}
                }
            }
        }
    }

    fn start_session(&mut self, attempt: u64) {
        let Some(mut capture) = self.capture.take() else {
            error!("released with the capture still held by another session");
            self.coordinator.mark_idle();
            self.emit(DeviceEvent::RecordingFailed("capture is busy".to_string()));
            return;
        };
        self.coordinator.mark_recording();

        let stop = CancellationToken::new();
        let teardown = CancellationToken::new();
        let events = self.events.clone();
        let mut session = RecordingSession::new(self.session_settings.clone(), self.clock.clone())
            .on_transition(move |state| {
                let _ = events.send(DeviceEvent::SessionState(state));
            });
        let internal = self.internal_tx.clone();
        let (session_stop, session_teardown) = (stop.clone(), teardown.clone());

        let handle = tokio::spawn(async move {
            let outcome = session
                .run(capture.as_mut(), session_stop, session_teardown)
                .await;
            let _ = internal.send(Internal::SessionFinished { attempt, outcome });
            capture
        });

        self.session = Some(SessionTask {
            attempt,
            stop,
            teardown,
            handle,
        });
    }

    async fn reclaim_capture(&mut self, handle: JoinHandle<Box<dyn Capture>>) {
        match handle.await {
            Ok(capture) => self.capture = Some(capture),
            Err(e) => error!("recording task failed, capture lost: {}", e),
        }
    }

    /// Cancels the armed wait and tears down any session. No session
    /// transition is emitted after this returns.
    async fn cancel_tasks(&mut self) {
        if let Some(arm) = self.arm.take() {
            arm.cancel.cancel();
            if let Err(e) = arm.handle.await {
                error!("arm task failed: {}", e);
            }
        }
        if let Some(session) = self.session.take() {
            session.teardown.cancel();
            self.reclaim_capture(session.handle).await;
        }
        self.coordinator.mark_idle();
    }

    async fn shutdown(&mut self) {
        self.cancel_tasks().await;
        self.coordinator.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FakeCapture, FakeCaptureBehavior};
    use crate::clock::VirtualClock;
    use crate::transport::FakeTransport;
    use chrono::{TimeZone, Timelike};
    use std::time::Duration;

    struct Device {
        handle: DeviceHandle,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
        transport: FakeTransport,
        capture: FakeCapture,
        _dir: tempfile::TempDir,
    }

    fn device(origin: DateTime<Utc>, behavior: FakeCaptureBehavior) -> Device {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        let capture = FakeCapture::new(behavior);
        let config = DeviceConfig {
            output_dir: dir.path().to_path_buf(),
            ..DeviceConfig::default()
        };
        let connection = Arc::new(
            ConnectionManager::new(&config.relay_url, Arc::new(transport.clone())).unwrap(),
        );
        let (handle, events) = DeviceController::spawn(
            &config,
            connection,
            Arc::new(VirtualClock::starting_at(origin)),
            Box::new(capture.clone()),
        );
        Device {
            handle,
            events,
            transport,
            capture,
            _dir: dir,
        }
    }

    fn at(m: u32, s: u32, ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, m, s).unwrap() + chrono::Duration::milliseconds(ms)
    }

    impl Device {
        /// Next event that is not a countdown tick.
        async fn next(&mut self) -> DeviceEvent {
            loop {
                match self.events.recv().await.expect("controller alive") {
                    DeviceEvent::Countdown(_) => continue,
                    event => return event,
                }
            }
        }

        async fn connect(&mut self, device_type: DeviceType) {
            self.handle.select_role(device_type).await.unwrap();
            assert!(matches!(self.next().await, DeviceEvent::Connected { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slave_records_from_the_boundary_for_max_duration() {
        let mut slave = device(at(0, 58, 0), FakeCaptureBehavior::default());
        slave.connect(DeviceType::Slave).await;
        assert_eq!(slave.transport.sent(), vec![r#"{"deviceType":"SLAVE"}"#]);

        slave
            .transport
            .inject(&RelayMessage::trigger("master-1", 0).encode().unwrap());
        assert_eq!(
            slave.next().await,
            DeviceEvent::Armed {
                origin: Some("master-1".to_string())
            }
        );

        match slave.next().await {
            DeviceEvent::Released { at: released, missed } => {
                assert_eq!(missed, 0);
                assert_eq!(released.second(), 0);
                assert!(released.timestamp_subsec_millis() < 100);
            }
            other => panic!("expected release, got {other:?}"),
        }
        assert_eq!(slave.next().await, DeviceEvent::SessionState(SessionState::Binding));
        assert_eq!(slave.next().await, DeviceEvent::SessionState(SessionState::Recording));
        assert_eq!(slave.next().await, DeviceEvent::SessionState(SessionState::Finalizing));
        assert_eq!(slave.next().await, DeviceEvent::SessionState(SessionState::Idle));
        match slave.next().await {
            DeviceEvent::RecordingFinished(artifact) => {
                assert_eq!(artifact.duration, Duration::from_millis(120_000));
                assert!(artifact.bytes > 0);
                assert!(artifact.path.exists());
            }
            other => panic!("expected a finished recording, got {other:?}"),
        }
        slave.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_is_reported_while_armed() {
        let mut slave = device(at(0, 57, 500), FakeCaptureBehavior::default());
        slave.connect(DeviceType::Slave).await;
        slave.transport.inject("SEND_TO_SLAVES");

        assert!(matches!(slave.next().await, DeviceEvent::Armed { origin: None }));
        let mut ticks = Vec::new();
        loop {
            match slave.events.recv().await.unwrap() {
                DeviceEvent::Countdown(s) => ticks.push(s),
                DeviceEvent::Released { .. } => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(ticks, vec![3, 2, 1]);
        slave.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_triggers_start_one_recording() {
        let mut slave = device(at(0, 59, 0), FakeCaptureBehavior::default());
        slave.connect(DeviceType::Slave).await;

        slave.transport.inject("SEND_TO_SLAVES");
        assert!(matches!(slave.next().await, DeviceEvent::Armed { .. }));
        slave.transport.inject(&RelayMessage::trigger("m", 1).encode().unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        slave.transport.inject("SEND_TO_SLAVES");

        assert!(matches!(slave.next().await, DeviceEvent::Released { .. }));
        slave.handle.stop_recording().await.unwrap();
        loop {
            match slave.next().await {
                DeviceEvent::RecordingFinished(_) => break,
                DeviceEvent::SessionState(_) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        let binds = slave
            .capture
            .calls()
            .into_iter()
            .filter(|c| *c == "bind")
            .count();
        assert_eq!(binds, 1);
        slave.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn master_triggers_but_never_arms() {
        let mut master = device(at(0, 59, 0), FakeCaptureBehavior::default());
        master.connect(DeviceType::Master).await;

        master.handle.trigger().await.unwrap();
        assert!(matches!(master.next().await, DeviceEvent::TriggerSent(_)));
        let on_wire = master.transport.sent();
        assert!(RelayMessage::decode(&on_wire[1]).is_trigger());

        // an echoed copy of its own trigger is ignored
        master.transport.inject(&on_wire[1]);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(master.events.try_recv().is_err());
        assert!(master.capture.calls().is_empty());
        master.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slave_cannot_trigger() {
        let mut slave = device(at(0, 0, 0), FakeCaptureBehavior::default());
        slave.connect(DeviceType::Slave).await;
        assert!(matches!(
            slave.handle.trigger().await,
            Err(ControllerError::Coordinator(CoordinatorError::NotMaster(Role::Slave)))
        ));
        slave.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn role_change_mid_poll_never_records() {
        let mut slave = device(at(0, 30, 0), FakeCaptureBehavior::default());
        slave.connect(DeviceType::Slave).await;
        slave.transport.inject("SEND_TO_SLAVES");
        assert!(matches!(slave.next().await, DeviceEvent::Armed { .. }));

        tokio::time::sleep(Duration::from_secs(10)).await;
        slave.connect(DeviceType::Master).await;

        // well past the boundary the old arm was waiting for
        tokio::time::sleep(Duration::from_secs(90)).await;
        while let Ok(event) = slave.events.try_recv() {
            assert!(
                matches!(event, DeviceEvent::Countdown(_)),
                "unexpected {event:?}"
            );
        }
        assert!(slave.capture.calls().is_empty());
        assert_eq!(slave.transport.live_links(), 1);
        slave.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_recording_closes_everything() {
        let mut slave = device(at(0, 59, 900), FakeCaptureBehavior::default());
        slave.connect(DeviceType::Slave).await;
        slave.transport.inject("SEND_TO_SLAVES");
        assert!(matches!(slave.next().await, DeviceEvent::Armed { .. }));
        assert!(matches!(slave.next().await, DeviceEvent::Released { .. }));
        assert_eq!(slave.next().await, DeviceEvent::SessionState(SessionState::Binding));
        assert_eq!(slave.next().await, DeviceEvent::SessionState(SessionState::Recording));

        slave.handle.shutdown().await.unwrap();
        assert_eq!(slave.transport.live_links(), 0);
        assert!(!slave.capture.is_bound());

        tokio::time::sleep(Duration::from_secs(200)).await;
        // the controller is gone; nothing after Recording was ever emitted
        while let Some(event) = slave.events.recv().await {
            panic!("unexpected {event:?} after shutdown");
        }
        assert!(matches!(
            slave.handle.trigger().await,
            Err(ControllerError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn binding_failure_is_reported_and_device_rearms() {
        let mut slave = device(
            at(0, 59, 900),
            FakeCaptureBehavior {
                fail_bind: Some("camera unavailable".to_string()),
                ..FakeCaptureBehavior::default()
            },
        );
        slave.connect(DeviceType::Slave).await;
        slave.transport.inject("SEND_TO_SLAVES");

        loop {
            match slave.next().await {
                DeviceEvent::RecordingFailed(msg) => {
                    assert!(msg.contains("camera unavailable"));
                    break;
                }
                DeviceEvent::RecordingFinished(_) => panic!("binding failure reported as success"),
                _ => {}
            }
        }

        // back to idle: the next trigger arms again
        slave.capture.set_behavior(FakeCaptureBehavior::default());
        slave.transport.inject("SEND_TO_SLAVES");
        assert!(matches!(slave.next().await, DeviceEvent::Armed { .. }));
        slave.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_recording_is_reported_as_failure() {
        let mut slave = device(
            at(0, 59, 900),
            FakeCaptureBehavior {
                bytes: 0,
                ..FakeCaptureBehavior::default()
            },
        );
        slave.connect(DeviceType::Slave).await;
        slave.transport.inject("SEND_TO_SLAVES");

        loop {
            match slave.next().await {
                DeviceEvent::RecordingFailed(msg) => {
                    assert!(msg.contains("empty"));
                    break;
                }
                DeviceEvent::RecordingFinished(_) => panic!("empty file reported as success"),
                _ => {}
            }
        }
        slave.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connection_is_reported() {
        let mut slave = device(at(0, 0, 0), FakeCaptureBehavior::default());
        slave.transport.set_fail_open(true);

        assert!(slave.handle.select_role(DeviceType::Slave).await.is_err());
        assert!(matches!(
            slave.next().await,
            DeviceEvent::ConnectionFailed(_)
        ));
        slave.handle.shutdown().await.unwrap();
    }
}
