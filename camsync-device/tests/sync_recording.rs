//! End-to-end: a master and a slave device talking through a real relay.
//!
//! The slave's clock is shifted so that it reads just before a minute
//! boundary, which keeps the wait for the alignment window short.

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use camsync_device::{
    AlignmentWindow, Clock, ConnectionManager, DeviceConfig, DeviceController, DeviceEvent,
    DeviceHandle, FakeCapture, FakeCaptureBehavior, OffsetClock, SessionState, StopReason,
    SystemClock, WsTransport,
};
use camsync_proto::relay::DeviceType;
use camsync_relay::{spawn_ephemeral, State};

struct Device {
    handle: DeviceHandle,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    capture: FakeCapture,
}

fn spawn_device(relay_url: &str, config: DeviceConfig, clock: Arc<dyn Clock>) -> Device {
    let connection =
        Arc::new(ConnectionManager::new(relay_url, Arc::new(WsTransport)).expect("relay url"));
    let capture = FakeCapture::new(FakeCaptureBehavior::default());
    let (handle, events) =
        DeviceController::spawn(&config, connection, clock, Box::new(capture.clone()));
    Device {
        handle,
        events,
        capture,
    }
}

/// A clock that reads 1.5s before the next top of the minute right now.
fn clock_near_boundary() -> Arc<dyn Clock> {
    let boundary = AlignmentWindow::default().next_boundary(Utc::now());
    Arc::new(OffsetClock::reading(boundary - ChronoDuration::milliseconds(1_500)))
}

async fn wait_for_announced_peers(state: &State, n: usize) {
    for _ in 0..100 {
        let peers = state.peer_infos().await;
        if peers.len() == n && peers.iter().all(|p| p.device_type.is_some()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("relay never saw {n} announced peers");
}

async fn next_event(device: &mut Device) -> DeviceEvent {
    loop {
        match timeout(Duration::from_secs(10), device.events.recv()).await {
            Ok(Some(DeviceEvent::Countdown(_))) => continue,
            Ok(Some(event)) => return event,
            Ok(None) => panic!("device controller stopped"),
            Err(_) => panic!("timed out waiting for a device event"),
        }
    }
}

#[tokio::test]
async fn slave_starts_recording_at_the_boundary() {
    let state = Arc::new(State::default());
    let addr = spawn_ephemeral(state.clone());
    let relay_url = format!("ws://{}/ws", addr);
    let dir = tempfile::tempdir().unwrap();
    let config = DeviceConfig {
        relay_url: relay_url.clone(),
        output_dir: dir.path().to_path_buf(),
        max_duration: Duration::from_millis(500),
        ..DeviceConfig::default()
    };

    let mut master = spawn_device(&relay_url, config.clone(), Arc::new(SystemClock));
    let slave_clock = clock_near_boundary();
    let mut slave = spawn_device(&relay_url, config, slave_clock.clone());

    master.handle.select_role(DeviceType::Master).await.unwrap();
    slave.handle.select_role(DeviceType::Slave).await.unwrap();
    assert!(matches!(next_event(&mut master).await, DeviceEvent::Connected { .. }));
    assert!(matches!(next_event(&mut slave).await, DeviceEvent::Connected { .. }));
    wait_for_announced_peers(&state, 2).await;

    let infos = state.peer_infos().await;
    let masters = infos
        .iter()
        .filter(|p| p.device_type == Some(DeviceType::Master))
        .count();
    assert_eq!(masters, 1);

    master.handle.trigger().await.unwrap();
    assert!(matches!(next_event(&mut master).await, DeviceEvent::TriggerSent(_)));

    match next_event(&mut slave).await {
        DeviceEvent::Armed { origin } => assert!(origin.is_some()),
        other => panic!("expected the slave to arm, got {other:?}"),
    }
    match next_event(&mut slave).await {
        DeviceEvent::Released { at, .. } => {
            assert_eq!(at.second(), 0, "released at {at}");
            assert!(at.timestamp_subsec_millis() < 100, "released at {at}");
        }
        other => panic!("expected a release, got {other:?}"),
    }

    let mut states = Vec::new();
    let artifact = loop {
        match next_event(&mut slave).await {
            DeviceEvent::SessionState(s) => states.push(s),
            DeviceEvent::RecordingFinished(artifact) => break artifact,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(
        states,
        vec![
            SessionState::Binding,
            SessionState::Recording,
            SessionState::Finalizing,
            SessionState::Idle
        ]
    );
    assert_eq!(artifact.stop_reason, StopReason::MaxDuration);
    assert!(artifact.bytes > 0);
    assert!(artifact.path.starts_with(dir.path()));
    assert!(artifact
        .path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("RECORDING_"));

    // the master never records
    assert!(master.capture.calls().is_empty());

    master.handle.shutdown().await.unwrap();
    slave.handle.shutdown().await.unwrap();
    wait_for_announced_peers(&state, 0).await;
}

#[tokio::test]
async fn legacy_marker_from_master_arms_slave() {
    let state = Arc::new(State::default());
    let addr = spawn_ephemeral(state.clone());
    let relay_url = format!("ws://{}/ws", addr);
    let dir = tempfile::tempdir().unwrap();
    let config = DeviceConfig {
        relay_url: relay_url.clone(),
        output_dir: dir.path().to_path_buf(),
        legacy_trigger: true,
        ..DeviceConfig::default()
    };

    let mut master = spawn_device(&relay_url, config.clone(), Arc::new(SystemClock));
    let mut slave = spawn_device(&relay_url, config, clock_near_boundary());
    master.handle.select_role(DeviceType::Master).await.unwrap();
    slave.handle.select_role(DeviceType::Slave).await.unwrap();
    next_event(&mut master).await;
    next_event(&mut slave).await;
    wait_for_announced_peers(&state, 2).await;

    master.handle.trigger().await.unwrap();
    assert!(matches!(
        next_event(&mut slave).await,
        DeviceEvent::Armed { origin: None }
    ));

    // backing out while armed releases nothing
    slave.handle.select_role(DeviceType::Slave).await.unwrap();
    assert!(matches!(next_event(&mut slave).await, DeviceEvent::Connected { .. }));
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    while let Ok(event) = slave.events.try_recv() {
        assert!(matches!(event, DeviceEvent::Countdown(_)), "unexpected {event:?}");
    }
    assert!(slave.capture.calls().is_empty());

    master.handle.shutdown().await.unwrap();
    slave.handle.shutdown().await.unwrap();
}
