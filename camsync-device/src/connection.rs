use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use camsync_proto::relay::{DeviceType, ProtocolError, RelayMessage};

use crate::latest::{Publisher, Subscription};
use crate::transport::{LinkSink, LinkStream, Transport};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid relay url {0:?}: {1}")]
    InvalidUrl(String, String),
    #[error("failed to open relay connection: {0}")]
    Open(String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("failed to close relay connection: {0}")]
    Close(String),
    #[error("relay connection error: {0}")]
    Receive(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct LiveConnection {
    device_id: String,
    device_type: DeviceType,
    sink: Box<dyn LinkSink>,
    reader: JoinHandle<()>,
}

/// Owns the device's single relay connection.
///
/// At most one socket is live at any time: `connect` holds the slot lock
/// while it closes the previous socket and opens the next, so concurrent
/// callers are serialized. Inbound frames are decoded and published on a
/// latest-value channel (see [`crate::latest`]).
pub struct ConnectionManager {
    url: Url,
    transport: Arc<dyn Transport>,
    live: Mutex<Option<LiveConnection>>,
    inbound: Arc<Publisher<RelayMessage>>,
}

impl ConnectionManager {
    pub fn new(relay_url: &str, transport: Arc<dyn Transport>) -> Result<Self, ConnectionError> {
        let url = Url::parse(relay_url)
            .map_err(|e| ConnectionError::InvalidUrl(relay_url.to_string(), e.to_string()))?;
        Ok(Self {
            url,
            transport,
            live: Mutex::new(None),
            inbound: Arc::new(Publisher::new()),
        })
    }

    /// Frames received after this call. Nothing earlier is replayed.
    pub fn subscribe(&self) -> Subscription<RelayMessage> {
        self.inbound.subscribe()
    }

    /// False once the relay has closed the socket, even before the next
    /// `connect` or `disconnect`.
    pub async fn is_connected(&self) -> bool {
        matches!(&*self.live.lock().await, Some(conn) if !conn.reader.is_finished())
    }

    /// Closes any existing socket, opens a new one and announces the role.
    pub async fn connect(
        &self,
        device_id: &str,
        device_type: DeviceType,
    ) -> Result<(), ConnectionError> {
        let mut live = self.live.lock().await;
        Self::close_live(&mut live).await;

        info!("Connecting to relay: {} as {}", self.url, device_type);
        let link = self.transport.open(&self.url).await.map_err(|e| {
            warn!("relay connection failed: {}", e);
            e
        })?;
        let mut sink = link.sink;

        let announce = RelayMessage::role_announce(device_type).encode()?;
        if let Err(e) = sink.send_text(announce).await {
            warn!("role announcement failed, dropping connection: {}", e);
            if let Err(e) = sink.close().await {
                debug!("close after failed announcement: {}", e);
            }
            return Err(e);
        }

        let reader = tokio::spawn(receive_loop(link.stream, self.inbound.clone()));
        *live = Some(LiveConnection {
            device_id: device_id.to_string(),
            device_type,
            sink,
            reader,
        });
        info!("Connected to relay as {} device_id={}", device_type, device_id);
        Ok(())
    }

    /// Closes the socket if one is open. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut live = self.live.lock().await;
        Self::close_live(&mut live).await;
    }

    async fn close_live(slot: &mut Option<LiveConnection>) {
        let Some(mut conn) = slot.take() else {
            return;
        };
        conn.reader.abort();
        if let Err(e) = conn.sink.close().await {
            warn!("error closing relay connection: {}", e);
        }
        info!(
            "Disconnected from relay ({} device_id={})",
            conn.device_type, conn.device_id
        );
    }

    /// Best-effort send. Failures are logged and otherwise ignored; nothing
    /// is queued or retried.
    pub async fn send(&self, message: &RelayMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("not sending {} message: {}", message.kind(), e);
                return;
            }
        };

        let mut live = self.live.lock().await;
        if live.as_ref().is_some_and(|conn| conn.reader.is_finished()) {
            warn!("relay closed the connection, releasing it");
            Self::close_live(&mut live).await;
        }
        let Some(conn) = live.as_mut() else {
            warn!("not sending {} message: not connected", message.kind());
            return;
        };
        match conn.sink.send_text(text).await {
            Ok(()) => debug!("sent {} message", message.kind()),
            Err(e) => warn!("error sending {} message: {}", message.kind(), e),
        }
    }
}

async fn receive_loop(mut stream: Box<dyn LinkStream>, inbound: Arc<Publisher<RelayMessage>>) {
    while let Some(frame) = stream.next_text().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                warn!("{}", e);
                break;
            }
        };

        let message = RelayMessage::decode(&text);
        match message.parse_error() {
            Some(err) => debug!("unstructured frame {:?}: {}", text, err),
            None => debug!(
                "received {} frame {}",
                message.kind(),
                message.raw().unwrap_or(&text)
            ),
        }
        inbound.publish(message);
    }
    info!("Relay connection closed");
}
