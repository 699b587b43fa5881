//! Device side of camsync: connects to the relay under a role, arms on a
//! trigger, waits for the shared top-of-minute boundary and records.

pub mod capture;
pub mod clock;
pub mod config;
pub mod connection;
pub mod controller;
pub mod coordinator;
pub mod latest;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use capture::{Capture, CaptureEvent, FakeCapture, FakeCaptureBehavior, ProcessCapture};
pub use clock::{Clock, OffsetClock, SystemClock, VirtualClock};
pub use config::DeviceConfig;
pub use connection::{ConnectionError, ConnectionManager};
pub use controller::{ControllerError, DeviceController, DeviceEvent, DeviceHandle};
pub use coordinator::{ArmRequest, CoordinatorError, Phase, Role, RoleCoordinator};
pub use scheduler::{AlignmentWindow, ArmOutcome, ArmedTrigger, SchedulerSettings, SyncScheduler};
pub use session::{
    Artifact, RecordingSession, SessionError, SessionOutcome, SessionSettings, SessionState,
    StopReason,
};
pub use transport::{FakeTransport, Transport, WsTransport};
