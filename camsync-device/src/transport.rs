use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::connection::ConnectionError;

/// Write half of a relay socket.
#[async_trait]
pub trait LinkSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Read half of a relay socket. `None` means the peer closed.
#[async_trait]
pub trait LinkStream: Send + 'static {
    async fn next_text(&mut self) -> Option<Result<String, ConnectionError>>;
}

pub struct Link {
    pub sink: Box<dyn LinkSink>,
    pub stream: Box<dyn LinkStream>,
}

/// Opens relay sockets. The connection manager owns one of these and never
/// holds more than one open [`Link`] at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

struct WsReader {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError> {
        let (ws, _resp) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Open(format!("{url}: {e}")))?;
        let (sink, stream) = ws.split();
        Ok(Link {
            sink: Box::new(WsSink { inner: sink }),
            stream: Box::new(WsReader { inner: stream }),
        })
    }
}

#[async_trait]
impl LinkSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.inner
            .close()
            .await
            .map_err(|e| ConnectionError::Close(e.to_string()))
    }
}

#[async_trait]
impl LinkStream for WsReader {
    async fn next_text(&mut self) -> Option<Result<String, ConnectionError>> {
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => debug!("dropping non-utf8 binary frame: {}", e),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {} // ping/pong
                Err(e) => return Some(Err(ConnectionError::Receive(e.to_string()))),
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened(u64),
    Sent(u64, String),
    Closed(u64),
}

#[derive(Default)]
struct FakeState {
    next_id: AtomicU64,
    fail_open: AtomicBool,
    events: Mutex<Vec<LinkEvent>>,
    inbound: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
}

/// In-memory transport that records every open, send and close.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

struct FakeSink {
    id: u64,
    state: Arc<FakeState>,
}

struct FakeReader {
    rx: mpsc::UnboundedReceiver<String>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.state.events.lock().unwrap().clone()
    }

    /// Number of links opened and not yet closed.
    pub fn live_links(&self) -> usize {
        self.state.inbound.lock().unwrap().len()
    }

    /// Texts sent on any link, in order.
    pub fn sent(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Sent(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Delivers `text` as an inbound frame on every live link. Returns how
    /// many links received it.
    pub fn inject(&self, text: &str) -> usize {
        self.state
            .inbound
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.send(text.to_string()).is_ok())
            .count()
    }

    /// Ends every live link from the relay side. Returns how many were
    /// live. Closing a hung-up sink afterwards records nothing.
    pub fn hang_up(&self) -> usize {
        let mut inbound = self.state.inbound.lock().unwrap();
        let n = inbound.len();
        inbound.clear();
        n
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(ConnectionError::Open(format!("{url}: connection refused")));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.inbound.lock().unwrap().insert(id, tx);
        self.state.events.lock().unwrap().push(LinkEvent::Opened(id));
        Ok(Link {
            sink: Box::new(FakeSink {
                id,
                state: self.state.clone(),
            }),
            stream: Box::new(FakeReader { rx }),
        })
    }
}

#[async_trait]
impl LinkSink for FakeSink {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        if !self.state.inbound.lock().unwrap().contains_key(&self.id) {
            return Err(ConnectionError::Send("link closed".to_string()));
        }
        self.state
            .events
            .lock()
            .unwrap()
            .push(LinkEvent::Sent(self.id, text));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.state.inbound.lock().unwrap().remove(&self.id).is_some() {
            self.state
                .events
                .lock()
                .unwrap()
                .push(LinkEvent::Closed(self.id));
        }
        Ok(())
    }
}

#[async_trait]
impl LinkStream for FakeReader {
    async fn next_text(&mut self) -> Option<Result<String, ConnectionError>> {
        self.rx.recv().await.map(Ok)
    }
}
