use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use camsync_proto::relay::{DeviceType, RelayMessage};

use crate::clock::Clock;
use crate::connection::{ConnectionError, ConnectionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unset,
    Master,
    Slave,
}

impl Role {
    pub fn device_type(&self) -> Option<DeviceType> {
        match self {
            Role::Unset => None,
            Role::Master => Some(DeviceType::Master),
            Role::Slave => Some(DeviceType::Slave),
        }
    }
}

impl From<DeviceType> for Role {
    fn from(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Master => Role::Master,
            DeviceType::Slave => Role::Slave,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_type() {
            Some(device_type) => fmt::Display::fmt(&device_type, f),
            None => f.write_str("UNSET"),
        }
    }
}

/// Where the local device is in the trigger/record cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Armed,
    Recording,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("only a master can issue a trigger (role is {0})")]
    NotMaster(Role),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// An accepted trigger. Produced at most once per Idle period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmRequest {
    pub origin: Option<String>,
    pub scheduled_time: Option<i64>,
    pub received_at: DateTime<Utc>,
}

/// Tracks the local role and decides which inbound frames arm this device.
///
/// A device holds one role per connection. `select_role` tears the previous
/// connection down before a new one is opened, and the role is only recorded
/// once the new connection has announced it.
pub struct RoleCoordinator {
    connection: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
    role: Role,
    phase: Phase,
    device_id: Option<String>,
    legacy_trigger: bool,
}

impl RoleCoordinator {
    pub fn new(connection: Arc<ConnectionManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            connection,
            clock,
            role: Role::Unset,
            phase: Phase::Idle,
            device_id: None,
            legacy_trigger: false,
        }
    }

    /// Send the bare `SEND_TO_SLAVES` command instead of a structured trigger.
    pub fn with_legacy_trigger(mut self, legacy: bool) -> Self {
        self.legacy_trigger = legacy;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Drops the current connection and role, then connects under `device_type`
    /// with a fresh device id. On failure the role stays `Unset`.
    pub async fn select_role(
        &mut self,
        device_type: DeviceType,
    ) -> Result<String, CoordinatorError> {
        self.disconnect().await;

        let device_id = Uuid::new_v4().to_string();
        self.connection.connect(&device_id, device_type).await?;

        self.role = device_type.into();
        self.device_id = Some(device_id.clone());
        info!("Role selected: {} device_id={}", self.role, device_id);
        Ok(device_id)
    }

    /// Broadcasts a trigger to every other device on the relay.
    ///
    /// Delivery is best-effort; the returned message is what was handed to
    /// the connection, not proof that anyone received it.
    pub async fn trigger(&mut self) -> Result<RelayMessage, CoordinatorError> {
        if self.role != Role::Master {
            return Err(CoordinatorError::NotMaster(self.role));
        }

        let message = if self.legacy_trigger {
            RelayMessage::legacy_trigger()
        } else {
            let device_id = self.device_id.clone().unwrap_or_default();
            RelayMessage::trigger(device_id, self.clock.now_millis())
        };
        self.connection.send(&message).await;
        info!("Trigger broadcast ({})", message.kind());
        Ok(message)
    }

    /// Returns an [`ArmRequest`] if `message` should arm this device.
    ///
    /// Only a slave in `Idle` arms; it then stays `Armed` until the caller
    /// moves it on with [`RoleCoordinator::mark_recording`] or
    /// [`RoleCoordinator::mark_idle`].
    pub fn on_inbound(&mut self, message: &RelayMessage) -> Option<ArmRequest> {
        if !message.is_trigger() {
            return None;
        }

        match self.role {
            Role::Slave => {}
            Role::Master => {
                debug!("master ignores inbound trigger");
                return None;
            }
            Role::Unset => {
                debug!("no role selected, ignoring trigger");
                return None;
            }
        }

        if self.phase != Phase::Idle {
            debug!("ignoring trigger while {:?}", self.phase);
            return None;
        }

        let received_at = self.clock.now();
        let request = match message {
            RelayMessage::Trigger {
                device_id,
                scheduled_time,
                ..
            } => {
                if let Some(sent) = scheduled_time {
                    info!(
                        "trigger from {} arrived {}ms after it was sent",
                        device_id.as_deref().unwrap_or("unknown master"),
                        received_at.timestamp_millis() - sent
                    );
                }
                ArmRequest {
                    origin: device_id.clone(),
                    scheduled_time: *scheduled_time,
                    received_at,
                }
            }
            _ => {
                info!("unstructured frame matched the trigger marker");
                ArmRequest {
                    origin: None,
                    scheduled_time: None,
                    received_at,
                }
            }
        };

        self.phase = Phase::Armed;
        Some(request)
    }

    pub fn mark_recording(&mut self) {
        if self.phase != Phase::Armed {
            warn!("recording started from {:?}", self.phase);
        }
        self.phase = Phase::Recording;
    }

    pub fn mark_idle(&mut self) {
        self.phase = Phase::Idle;
    }

    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await;
        self.role = Role::Unset;
        self.phase = Phase::Idle;
        self.device_id = None;
    }
}
