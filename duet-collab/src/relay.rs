//! WebSocket relay: the peer-discovery channel for sessions that cannot
//! reach each other directly.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                          ┌──► Peer B
//!          ├── Room ("doc-42") ───────┤
//! Peer C ──┘   peer id → outbound tx  └──► Peer C
//! ```
//!
//! The relay forwards opaque payloads inside one room and reports joins and
//! leaves. It never looks into, stores or orders document data; every
//! replica lives at the edges.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::{decode_payload, encode_payload, ProtocolError};

/// Frames exchanged between peers and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay, first frame on a connection.
    Join { room: String, peer: Uuid },
    /// Client → relay: forward to `to`, or to the whole room.
    Data { to: Option<Uuid>, payload: Vec<u8> },
    /// Relay → client: accepted, these peers were already there.
    Welcome { peers: Vec<Uuid> },
    PeerJoined(Uuid),
    PeerLeft(Uuid),
    /// Relay → client: payload forwarded from `from`.
    Forward { from: Uuid, payload: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("peer did not join within the handshake timeout")]
    HandshakeTimeout,
    #[error("expected a join frame, got {0}")]
    UnexpectedFrame(String),
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("peer {0} is already in the room")]
    DuplicatePeer(Uuid),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before further frames to it are dropped
    pub peer_buffer: usize,
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            peer_buffer: 256,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub forwarded_frames: u64,
    pub dropped_frames: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    forwarded_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

type Outbound = mpsc::Sender<Arc<Vec<u8>>>;
type Rooms = Arc<RwLock<HashMap<String, HashMap<Uuid, Outbound>>>>;
type WsStream = WebSocketStream<TcpStream>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    rooms: Rooms,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    /// Bind the listening socket. Use port 0 to pick a free port.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            config,
            listener,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicRelayStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", self.local_addr()?);
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats, config).await {
                    log::warn!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            forwarded_frames: self.stats.forwarded_frames.load(Ordering::Relaxed),
            dropped_frames: self.stats.dropped_frames.load(Ordering::Relaxed),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn peer_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }
}

/// Next relay frame from the socket; `None` once the peer hung up.
async fn next_frame(stream: &mut SplitStream<WsStream>) -> Result<Option<RelayFrame>, RelayError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(data) => {
                let bytes: Vec<u8> = data.into();
                return Ok(Some(RelayFrame::decode(&bytes)?));
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

fn deliver(stats: &AtomicRelayStats, to: Uuid, tx: &Outbound, frame: Arc<Vec<u8>>) {
    match tx.try_send(frame) {
        Ok(()) => {
            stats.forwarded_frames.fetch_add(1, Ordering::Relaxed);
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
            log::warn!("Peer {to} is lagging, frame dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<AtomicRelayStats>,
    config: RelayConfig,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (room, peer) = match tokio::time::timeout(config.handshake_timeout, next_frame(&mut ws_receiver)).await {
        Err(_) => return Err(RelayError::HandshakeTimeout),
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(RelayFrame::Join { room, peer }))) => (room, peer),
        Ok(Ok(Some(other))) => return Err(RelayError::UnexpectedFrame(format!("{other:?}"))),
        Ok(Err(e)) => return Err(e),
    };

    let (tx, mut outbound) = mpsc::channel::<Arc<Vec<u8>>>(config.peer_buffer.max(1));
    let existing = {
        let mut rooms_w = rooms.write().await;
        let members = rooms_w.entry(room.clone()).or_default();
        if members.len() >= config.max_peers_per_room {
            return Err(RelayError::RoomFull(room));
        }
        if members.contains_key(&peer) {
            return Err(RelayError::DuplicatePeer(peer));
        }
        let joined = Arc::new(RelayFrame::PeerJoined(peer).encode()?);
        for (id, member) in members.iter() {
            deliver(&stats, *id, member, joined.clone());
        }
        let existing: Vec<Uuid> = members.keys().copied().collect();
        members.insert(peer, tx);
        existing
    };

    stats.total_connections.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("Peer {peer} from {addr} joined room {room} ({} already there)", existing.len());

    let welcome = RelayFrame::Welcome { peers: existing }.encode()?;
    let result = match ws_sender.send(Message::Binary(welcome.into())).await {
        Ok(()) => {
            forward_loop(peer, &room, &rooms, &stats, &mut ws_receiver, &mut ws_sender, &mut outbound).await
        }
        Err(e) => Err(e.into()),
    };

    // Cleanup: remove peer from room
    {
        let mut rooms_w = rooms.write().await;
        if let Some(members) = rooms_w.get_mut(&room) {
            members.remove(&peer);
            if members.is_empty() {
                rooms_w.remove(&room);
                log::info!("Room {room} removed (empty)");
            } else if let Ok(left) = RelayFrame::PeerLeft(peer).encode() {
                let left = Arc::new(left);
                for (id, member) in members.iter() {
                    deliver(&stats, *id, member, left.clone());
                }
            }
        }
    }
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Peer {peer} left room {room}");

    result
}

async fn forward_loop(
    peer: Uuid,
    room: &str,
    rooms: &Rooms,
    stats: &AtomicRelayStats,
    ws_receiver: &mut SplitStream<WsStream>,
    ws_sender: &mut futures_util::stream::SplitSink<WsStream, Message>,
    outbound: &mut mpsc::Receiver<Arc<Vec<u8>>>,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            frame = next_frame(ws_receiver) => {
                match frame {
                    Ok(Some(RelayFrame::Data { to, payload })) => {
                        let forward = Arc::new(RelayFrame::Forward { from: peer, payload }.encode()?);
                        let rooms_r = rooms.read().await;
                        let Some(members) = rooms_r.get(room) else {
                            return Ok(());
                        };
                        for (id, member) in members {
                            if *id == peer || to.is_some_and(|to| to != *id) {
                                continue;
                            }
                            deliver(stats, *id, member, forward.clone());
                        }
                    }
                    Ok(Some(other)) => {
                        log::debug!("Ignoring {other:?} from {peer}");
                    }
                    Ok(None) => return Ok(()),
                    Err(RelayError::Protocol(e)) => {
                        log::warn!("Dropping malformed frame from {peer}: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }

            bytes = outbound.recv() => {
                match bytes {
                    Some(bytes) => ws_sender.send(Message::Binary(bytes.to_vec().into())).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}
