//! camsync relay server library
//!
//! The relay forwards every text frame a device sends to every other
//! connected device. It does not interpret frames beyond noting the device
//! type a peer announces, which is only used for logging and `/peers`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use camsync_proto::relay::{DeviceType, RelayMessage};

/// Per-peer outbound buffer. A peer that falls this far behind loses frames.
pub const CHANNEL_BUFFER_SIZE: usize = 256;

pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Peers silent for longer than this are dropped by [`heartbeat_checker`].
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

pub type Tx = mpsc::Sender<Message>;

#[derive(Clone)]
pub struct Peer {
    pub tx: Tx,
    pub device_type: Option<DeviceType>,
    pub last_heartbeat: Arc<Mutex<Instant>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub device_type: Option<DeviceType>,
}

#[derive(Default)]
pub struct State {
    pub peers: Mutex<HashMap<String, Peer>>,
}

impl State {
    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        let peers = self.peers.lock().await;
        let mut infos: Vec<PeerInfo> = peers
            .iter()
            .map(|(peer_id, peer)| PeerInfo {
                peer_id: peer_id.clone(),
                device_type: peer.device_type,
            })
            .collect();
        infos.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        infos
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(listen) = std::env::var("CAMSYNC_RELAY_LISTEN") {
            config.listen = listen.parse().map_err(|e| {
                anyhow::anyhow!("invalid CAMSYNC_RELAY_LISTEN {listen:?} (expected host:port): {e}")
            })?;
        }
        Ok(config)
    }
}

/// All relay routes: `/`, `/healthz`, `/peers` and the `/ws` device socket.
pub fn routes(
    state: Arc<State>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let hello = warp::path::end().map(|| "camsync relay is active");
    let healthz = warp::path!("healthz").map(|| "ok");

    let peers = warp::path!("peers")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(|state: Arc<State>| async move {
            Ok::<_, warp::Rejection>(warp::reply::json(&state.peer_infos().await))
        });

    let ws_device = warp::path!("ws")
        .and(warp::ws())
        .and(with_state)
        .map(|ws: warp::ws::Ws, state: Arc<State>| {
            ws.on_upgrade(move |socket| device_socket(socket, state))
        });

    hello.or(healthz).or(peers).or(ws_device)
}

/// Binds `listen` and serves until the process exits.
pub async fn serve(config: RelayConfig, state: Arc<State>) {
    tokio::spawn(heartbeat_checker(state.clone()));
    let routes = routes(state).with(warp::log("camsync_relay"));
    log::info!("camsync-relay listening on {}", config.listen);
    warp::serve(routes).run(config.listen).await;
}

/// Binds an OS-assigned port on localhost and serves in the background.
pub fn spawn_ephemeral(state: Arc<State>) -> SocketAddr {
    let (addr, server) =
        warp::serve(routes(state)).bind_ephemeral(SocketAddr::from(([127, 0, 0, 1], 0)));
    tokio::spawn(server);
    addr
}

/// Background task that drops peers which stopped answering pings.
pub async fn heartbeat_checker(state: Arc<State>) {
    let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    loop {
        ticker.tick().await;

        let timeout = Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);
        let now = Instant::now();

        let mut dead = Vec::new();
        {
            let peers = state.peers.lock().await;
            for (peer_id, peer) in peers.iter() {
                let last = *peer.last_heartbeat.lock().await;
                if now.duration_since(last) > timeout {
                    dead.push(peer_id.clone());
                }
            }
        }

        for peer_id in dead {
            log::warn!("peer {} timed out (no heartbeat)", peer_id);
            let mut peers = state.peers.lock().await;
            if let Some(peer) = peers.remove(&peer_id) {
                let _ = peer.tx.send(Message::close()).await;
            }
        }
    }
}

/// Forwards `text` to every peer except `from`.
async fn fan_out(state: &State, from: &str, text: &str) -> usize {
    let targets: Vec<(String, Tx)> = {
        let peers = state.peers.lock().await;
        peers
            .iter()
            .filter(|(peer_id, _)| peer_id.as_str() != from)
            .map(|(peer_id, peer)| (peer_id.clone(), peer.tx.clone()))
            .collect()
    };

    let mut delivered = 0;
    for (peer_id, tx) in targets {
        // try_send: a slow peer must not stall the sender's read loop
        match tx.try_send(Message::text(text)) {
            Ok(()) => delivered += 1,
            Err(e) => log::warn!("dropping frame for peer {}: {}", peer_id, e),
        }
    }
    delivered
}

pub async fn device_socket(ws: WebSocket, state: Arc<State>) {
    let peer_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_BUFFER_SIZE);

    let writer = tokio::task::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let last_heartbeat = Arc::new(Mutex::new(Instant::now()));
    {
        let mut peers = state.peers.lock().await;
        peers.insert(
            peer_id.clone(),
            Peer {
                tx: out_tx.clone(),
                device_type: None,
                last_heartbeat: last_heartbeat.clone(),
            },
        );
    }
    log::info!("peer connected peer_id={}", peer_id);

    let heartbeat_tx = out_tx.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(Message::ping(Vec::new())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(e) => {
                log::warn!("peer {} socket error: {}", peer_id, e);
                break;
            }
        };

        *last_heartbeat.lock().await = Instant::now();

        if msg.is_pong() {
            continue;
        }
        if msg.is_close() {
            break;
        }
        let Ok(text) = msg.to_str() else {
            log::debug!("peer {}: ignoring non-text frame", peer_id);
            continue;
        };

        if let RelayMessage::RoleAnnounce { device_type, .. } = RelayMessage::decode(text) {
            let mut peers = state.peers.lock().await;
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.device_type = Some(device_type);
            }
            log::info!("peer {} announced {}", peer_id, device_type);
        }

        let delivered = fan_out(&state, &peer_id, text).await;
        log::debug!(
            "peer {}: forwarded {} bytes to {} peer(s)",
            peer_id,
            text.len(),
            delivered
        );
    }

    heartbeat_handle.abort();
    {
        let mut peers = state.peers.lock().await;
        peers.remove(&peer_id);
    }
    writer.abort();
    log::info!("peer disconnected peer_id={}", peer_id);
}
