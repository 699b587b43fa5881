use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Raw command text that every device treats as a trigger when a frame
/// does not parse as a structured message.
pub const TRIGGER_MARKER: &str = "SEND_TO_SLAVES";

pub const TYPE_ROLE_ANNOUNCE: &str = "ROLE_ANNOUNCE";
pub const TYPE_TRIGGER: &str = "TRIGGER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Master,
    Slave,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Master => "MASTER",
            DeviceType::Slave => "SLAVE",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not a structured message: {0}")]
    Unstructured(String),
    #[error("structured frame has neither a type tag nor a device type")]
    Untagged,
    #[error("failed to encode {0} message: {1}")]
    Encode(&'static str, String),
}

/// The structured JSON shape of a relay frame. Every field is optional on
/// the wire; the role announcement for instance is just `{"deviceType":"SLAVE"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    /// Unix timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<i64>,
}

impl Envelope {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Unstructured(e.to_string()))
    }
}

/// One relay frame, decoded.
///
/// Frames that do not fit the structured schema are kept as `Raw` so that
/// callers can still inspect their text (see [`RelayMessage::is_trigger`]).
/// Structured variants carry the frame text in `raw` when they were decoded
/// off the wire, and `None` when built locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Sent once per connection right after the socket opens.
    RoleAnnounce {
        device_type: DeviceType,
        device_id: Option<String>,
        raw: Option<String>,
    },
    /// Master -> Slaves: arm the alignment barrier.
    Trigger {
        device_id: Option<String>,
        scheduled_time: Option<i64>,
        raw: Option<String>,
    },
    /// Structured frame with a type tag this protocol does not act on.
    Command {
        envelope: Envelope,
        raw: Option<String>,
    },
    /// Unstructured text. `error` is set when the text came off the wire and
    /// failed structured decoding; locally built raw commands carry `None`.
    Raw {
        text: String,
        error: Option<ProtocolError>,
    },
}

impl RelayMessage {
    pub fn role_announce(device_type: DeviceType) -> Self {
        RelayMessage::RoleAnnounce {
            device_type,
            device_id: None,
            raw: None,
        }
    }

    pub fn trigger(device_id: impl Into<String>, scheduled_time: i64) -> Self {
        RelayMessage::Trigger {
            device_id: Some(device_id.into()),
            scheduled_time: Some(scheduled_time),
            raw: None,
        }
    }

    /// The bare legacy trigger command.
    pub fn legacy_trigger() -> Self {
        RelayMessage::Raw {
            text: TRIGGER_MARKER.to_string(),
            error: None,
        }
    }

    /// Decodes one frame. Never fails: anything that is not a structured
    /// message becomes `Raw` with the reason attached.
    pub fn decode(text: &str) -> Self {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                return RelayMessage::Raw {
                    text: text.to_string(),
                    error: Some(error),
                }
            }
        };

        let raw = Some(text.to_string());
        let tag = envelope.typ.clone();
        match (tag.as_deref(), envelope.device_type) {
            (Some(TYPE_TRIGGER), _) => RelayMessage::Trigger {
                device_id: envelope.device_id,
                scheduled_time: envelope.scheduled_time,
                raw,
            },
            (Some(TYPE_ROLE_ANNOUNCE) | None, Some(device_type)) => RelayMessage::RoleAnnounce {
                device_type,
                device_id: envelope.device_id,
                raw,
            },
            (None, None) => RelayMessage::Raw {
                text: text.to_string(),
                error: Some(ProtocolError::Untagged),
            },
            _ => RelayMessage::Command { envelope, raw },
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            RelayMessage::Raw { text, .. } => return Ok(text.clone()),
            RelayMessage::RoleAnnounce {
                device_type,
                device_id,
                ..
            } => Envelope {
                device_id: device_id.clone(),
                device_type: Some(*device_type),
                ..Envelope::default()
            },
            RelayMessage::Trigger {
                device_id,
                scheduled_time,
                ..
            } => Envelope {
                typ: Some(TYPE_TRIGGER.to_string()),
                device_id: device_id.clone(),
                device_type: Some(DeviceType::Master),
                scheduled_time: *scheduled_time,
            },
            RelayMessage::Command { envelope, .. } => envelope.clone(),
        };
        serde_json::to_string(&envelope)
            .map_err(|e| ProtocolError::Encode(self.kind(), e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::RoleAnnounce { .. } => "role_announce",
            RelayMessage::Trigger { .. } => "trigger",
            RelayMessage::Command { .. } => "command",
            RelayMessage::Raw { .. } => "raw",
        }
    }

    /// True for a structured trigger, or for unstructured text containing
    /// [`TRIGGER_MARKER`]. Structured frames of other types never match,
    /// even if their fields happen to contain the marker.
    pub fn is_trigger(&self) -> bool {
        match self {
            RelayMessage::Trigger { .. } => true,
            RelayMessage::Raw { text, .. } => text.contains(TRIGGER_MARKER),
            _ => false,
        }
    }

    /// The frame text this message was decoded from.
    pub fn raw(&self) -> Option<&str> {
        match self {
            RelayMessage::RoleAnnounce { raw, .. }
            | RelayMessage::Trigger { raw, .. }
            | RelayMessage::Command { raw, .. } => raw.as_deref(),
            RelayMessage::Raw { text, .. } => Some(text),
        }
    }

    pub fn parse_error(&self) -> Option<&ProtocolError> {
        match self {
            RelayMessage::Raw { error, .. } => error.as_ref(),
            _ => None,
        }
    }
}
