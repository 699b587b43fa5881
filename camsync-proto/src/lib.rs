pub mod relay;

pub use relay::{DeviceType, Envelope, ProtocolError, RelayMessage, TRIGGER_MARKER};
