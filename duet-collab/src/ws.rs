//! [`Transport`] over a WebSocket connection to a [`relay`](crate::relay).
//!
//! Provides:
//! - Join handshake and translation of relay frames into transport events
//! - Automatic reconnect with a fixed delay
//! - `Disconnected` errors while the link is down, so the session falls
//!   back to catch-up instead of queueing stale traffic

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::relay::RelayFrame;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    pub room: String,
    /// Must match the session's peer id.
    pub peer: Uuid,
    pub reconnect_delay: Duration,
    /// Give up after this many consecutive failed attempts (`None` = never).
    pub max_reconnect_attempts: Option<u32>,
}

impl WsTransportConfig {
    pub fn new(url: impl Into<String>, room: impl Into<String>, peer: Uuid) -> Self {
        Self {
            url: url.into(),
            room: room.into(),
            peer,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: None,
        }
    }
}

/// WebSocket transport. The connection lives on a background task that
/// stops when the transport is closed or dropped.
pub struct WsTransport {
    outgoing: Option<mpsc::UnboundedSender<RelayFrame>>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// Start connecting; must be called from within a tokio runtime.
    pub fn connect(config: WsTransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(connection_task(config, out_rx, event_tx, connected.clone()));

        let transport = Self {
            outgoing: Some(out_tx),
            connected,
        };
        (transport, event_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.outgoing.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn push(&self, frame: RelayFrame) -> Result<(), TransportError> {
        let tx = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

impl Transport for WsTransport {
    fn broadcast(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.push(RelayFrame::Data { to: None, payload: bytes })
    }

    fn send(&mut self, peer: Uuid, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.push(RelayFrame::Data { to: Some(peer), payload: bytes })
    }

    fn close(&mut self) {
        self.outgoing.take();
    }
}

enum Outcome {
    /// The transport was closed or its session went away.
    Shutdown,
    /// The link dropped; try again.
    Lost,
}

async fn connection_task(
    config: WsTransportConfig,
    mut outgoing: mpsc::UnboundedReceiver<RelayFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut failures = 0u32;
    loop {
        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                failures = 0;
                let outcome = drive(&config, ws_stream, &mut outgoing, &events, &connected).await;
                if connected.swap(false, Ordering::AcqRel) {
                    let _ = events.send(TransportEvent::Disconnected);
                }
                if let Outcome::Shutdown = outcome {
                    break;
                }
                log::warn!("Lost connection to {}, reconnecting", config.url);
            }
            Err(e) => {
                failures += 1;
                log::warn!("Connecting to {} failed (attempt {failures}): {e}", config.url);
            }
        }

        if config.max_reconnect_attempts.is_some_and(|max| failures >= max) {
            log::error!("Giving up on {} after {failures} attempts", config.url);
            break;
        }

        // Anything queued while offline is stale; catch-up will cover it.
        let delay = tokio::time::sleep(config.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                frame = outgoing.recv() => {
                    if frame.is_none() {
                        return;
                    }
                }
            }
        }
    }
    log::debug!("Connection task for {} stopped", config.peer);
}

async fn drive<S>(
    config: &WsTransportConfig,
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    outgoing: &mut mpsc::UnboundedReceiver<RelayFrame>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    connected: &AtomicBool,
) -> Outcome
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let join = RelayFrame::Join {
        room: config.room.clone(),
        peer: config.peer,
    };
    let sent = match join.encode() {
        Ok(bytes) => ws_writer.send(Message::Binary(bytes.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode join frame: {e}");
            false
        }
    };
    if !sent {
        return Outcome::Lost;
    }

    loop {
        tokio::select! {
            msg = ws_reader.next() => {
                let event = match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping malformed relay frame: {e}");
                                continue;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Outcome::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return Outcome::Lost;
                    }
                };

                let delivered = match event {
                    RelayFrame::Welcome { peers } => {
                        connected.store(true, Ordering::Release);
                        log::info!("Joined room {} with {} peers", config.room, peers.len());
                        std::iter::once(TransportEvent::Connected)
                            .chain(peers.into_iter().map(TransportEvent::PeerJoined))
                            .all(|e| events.send(e).is_ok())
                    }
                    RelayFrame::PeerJoined(peer) => events.send(TransportEvent::PeerJoined(peer)).is_ok(),
                    RelayFrame::PeerLeft(peer) => events.send(TransportEvent::PeerLeft(peer)).is_ok(),
                    RelayFrame::Forward { from, payload } => {
                        events.send(TransportEvent::Message { from, bytes: payload }).is_ok()
                    }
                    other => {
                        log::debug!("Ignoring unexpected {other:?}");
                        true
                    }
                };
                if !delivered {
                    return Outcome::Shutdown;
                }
            }

            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    return Outcome::Shutdown;
                };
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode relay frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(Message::Binary(bytes.into())).await {
                    log::warn!("Send failed: {e}");
                    return Outcome::Lost;
                }
            }
        }
    }
}
