//! One editor's participation in a room.
//!
//! The session exclusively owns the replica and the awareness store and is
//! the only place either is mutated. It is a plain synchronous state machine:
//! callers feed it transport events and local edits one at a time (see
//! [`crate::driver`] for the task that does so).
//!
//! ```text
//!  Idle ──connect──► Connecting ──peer joined──► Syncing ──all peers answered──► Live
//!                        ▲                          │                           │
//!                        └──────── transport disconnected ◄─────────────────────┘
//!  any ──close──► Closed
//! ```
//!
//! Catch-up is per peer: each new peer gets our state vector (`SyncStep1`)
//! and answers with whatever we lack (`SyncStep2`), and vice versa.

use duet_core::{Attributes, Change, Document, Edit, StateVector, Update, WireFormat};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::awareness::{
    AwarenessChange, AwarenessStore, AwarenessUpdate, CursorRange, Presence, PresenceField,
    DEFAULT_TIMEOUT,
};
use crate::protocol::{decode_payload, encode_payload, MessageType, SyncMessage};
use crate::transport::{Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Syncing,
    Live,
    Closed,
}

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Opaque room id; sessions in different rooms never interact.
    pub room: String,
    /// Must be fresh for every session, see [`Document::new`].
    pub peer: Uuid,
    pub awareness_timeout: Duration,
    /// How often a live session re-runs catch-up with every peer, so that
    /// updates lost in transit are eventually recovered. A quarter of this
    /// while blocks are waiting for missing dependencies.
    pub resync_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room: "default".to_string(),
            peer: Uuid::new_v4(),
            awareness_timeout: DEFAULT_TIMEOUT,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

impl SessionConfig {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            ..Self::default()
        }
    }
}

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(Uuid),
}

/// Notifications for the layers above the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    DocumentChanged { origin: Origin, changes: Vec<Change> },
    AwarenessChanged(AwarenessChange),
    /// Catch-up with this peer finished.
    PeerSynced(Uuid),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
}

pub struct Session<T: Transport> {
    config: SessionConfig,
    state: SessionState,
    transport: Option<T>,
    doc: Document,
    awareness: AwarenessStore,
    peers: BTreeSet<Uuid>,
    /// Peers we sent a `SyncStep1` to and have not heard back from.
    pending: BTreeSet<Uuid>,
    last_resync: Option<Instant>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl<T: Transport> Session<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        let doc = Document::new(config.peer);
        let awareness = AwarenessStore::with_timeout(config.peer, config.awareness_timeout);
        Self {
            config,
            state: SessionState::Idle,
            transport: Some(transport),
            doc,
            awareness,
            peers: BTreeSet::new(),
            pending: BTreeSet::new(),
            last_resync: None,
            subscribers: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.config.peer
    }

    pub fn room(&self) -> &str {
        &self.config.room
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn awareness(&self) -> &AwarenessStore {
        &self.awareness
    }

    pub fn text(&self) -> String {
        self.doc.text()
    }

    /// Peers currently reachable through the transport.
    pub fn peers(&self) -> impl Iterator<Item = &Uuid> {
        self.peers.iter()
    }

    /// Every live presence, ours included.
    pub fn presence(&self) -> BTreeMap<Uuid, Presence> {
        self.awareness
            .states()
            .into_iter()
            .map(|(peer, p)| (peer, p.clone()))
            .collect()
    }

    /// Receive every event from now on, in order.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Idle => {
                self.set_state(SessionState::Connecting);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------
    // Local operations
    // ---------------------------------------------------------------

    pub fn insert(&mut self, index: usize, text: &str, attributes: Attributes) -> Result<Edit, SessionError> {
        self.ensure_open()?;
        let edit = self.doc.insert(index, text, attributes);
        self.publish_local(&edit);
        Ok(edit)
    }

    pub fn delete(&mut self, range: Range<usize>) -> Result<Edit, SessionError> {
        self.ensure_open()?;
        let edit = self.doc.delete(range);
        self.publish_local(&edit);
        Ok(edit)
    }

    pub fn format(&mut self, range: Range<usize>, attributes: Attributes) -> Result<Edit, SessionError> {
        self.ensure_open()?;
        let edit = self.doc.format(range, attributes);
        self.publish_local(&edit);
        Ok(edit)
    }

    /// Replace the local presence; `None` announces we are away.
    pub fn set_presence(&mut self, presence: Option<Presence>) -> Result<(), SessionError> {
        self.ensure_open()?;
        let update = self.awareness.set_local_state(presence, Instant::now());
        self.publish_awareness(update);
        Ok(())
    }

    pub fn set_cursor(&mut self, cursor: Option<CursorRange>) -> Result<(), SessionError> {
        self.ensure_open()?;
        let update = self
            .awareness
            .set_local_field(PresenceField::Cursor(cursor), Instant::now());
        self.publish_awareness(update);
        Ok(())
    }

    /// Periodic housekeeping: re-run catch-up when due, keep our presence
    /// alive, expire silent peers.
    pub fn tick(&mut self, now: Instant) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.resync_due(now) {
            self.resync(now);
        }
        if self.awareness.needs_renewal(now) {
            if let Some(update) = self.awareness.renew(now) {
                self.broadcast_awareness(None, vec![update]);
            }
        }
        let removed = self.awareness.expire(now);
        if !removed.is_empty() {
            self.emit(SessionEvent::AwarenessChanged(AwarenessChange {
                removed,
                ..AwarenessChange::default()
            }));
        }
    }

    /// Leave the room. Idempotent; the session is unusable afterwards.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.is_online() && self.awareness.local_state().is_some() {
            let update = self.awareness.set_local_state(None, Instant::now());
            self.broadcast_awareness(None, vec![update]);
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.doc = Document::new(self.config.peer);
        self.awareness = AwarenessStore::with_timeout(self.config.peer, self.config.awareness_timeout);
        self.peers.clear();
        self.pending.clear();
        self.set_state(SessionState::Closed);
        self.subscribers.clear();
        log::info!("Session {} left room {}", self.config.peer, self.config.room);
    }

    // ---------------------------------------------------------------
    // Transport events
    // ---------------------------------------------------------------

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.state == SessionState::Closed {
            log::trace!("Ignoring {event:?} on closed session");
            return;
        }
        match event {
            TransportEvent::Connected => {
                if self.state == SessionState::Idle {
                    self.set_state(SessionState::Connecting);
                }
            }
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::PeerJoined(peer) => self.on_peer_joined(peer),
            TransportEvent::PeerLeft(peer) => self.on_peer_left(peer),
            TransportEvent::Message { from, bytes } => self.on_message(from, &bytes),
        }
    }

    fn on_disconnected(&mut self) {
        log::info!("Session {} lost its transport, waiting to reconnect", self.config.peer);
        self.peers.clear();
        self.pending.clear();
        self.set_state(SessionState::Connecting);
    }

    fn on_peer_joined(&mut self, peer: Uuid) {
        if peer == self.config.peer || !self.peers.insert(peer) {
            return;
        }
        log::debug!("Peer {peer} joined room {}", self.config.room);
        if matches!(self.state, SessionState::Idle | SessionState::Connecting | SessionState::Live) {
            self.set_state(SessionState::Syncing);
        }
        self.pending.insert(peer);

        let now = Instant::now();
        self.last_resync = Some(now);
        self.send_step1(peer, self.doc.encode_state_vector());
        // A fresh clock: the peer may still remember our last one from
        // before a disconnect and would reject a resend as stale.
        if let Some(update) = self.awareness.renew(now) {
            self.broadcast_awareness(Some(peer), vec![update]);
        }
    }

    fn send_step1(&mut self, peer: Uuid, state_vector: Vec<u8>) {
        let step1 = SyncMessage::sync_step1(&self.config.room, self.config.peer, peer, state_vector);
        self.send(Some(peer), &step1);
    }

    fn resync_due(&self, now: Instant) -> bool {
        if !self.is_online() || self.peers.is_empty() {
            return false;
        }
        let interval = if self.doc.pending_len() > 0 {
            self.config.resync_interval / 4
        } else {
            self.config.resync_interval
        };
        self.last_resync
            .map_or(true, |at| now.saturating_duration_since(at) >= interval)
    }

    /// Send our state vector to every peer again; each answers with what we
    /// lack. Recovers updates that were dropped on the way.
    fn resync(&mut self, now: Instant) {
        self.last_resync = Some(now);
        log::debug!(
            "Session {} resyncing with {} peers ({} blocks waiting)",
            self.config.peer,
            self.peers.len(),
            self.doc.pending_len()
        );
        let state_vector = self.doc.encode_state_vector();
        let peers: Vec<Uuid> = self.peers.iter().copied().collect();
        for peer in peers {
            self.send_step1(peer, state_vector.clone());
            if !self.is_online() {
                break;
            }
        }
    }

    fn on_peer_left(&mut self, peer: Uuid) {
        self.peers.remove(&peer);
        self.pending.remove(&peer);
        if self.awareness.remove_peer(&peer) {
            self.emit(SessionEvent::AwarenessChanged(AwarenessChange {
                removed: vec![peer],
                ..AwarenessChange::default()
            }));
        }
        self.maybe_live();
    }

    fn on_message(&mut self, from: Uuid, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable message from {from}: {e}");
                return;
            }
        };
        if msg.room != self.config.room {
            log::debug!("Ignoring message for room {} from {from}", msg.room);
            return;
        }
        if msg.from == self.config.peer || !msg.is_addressed_to(self.config.peer) {
            return;
        }
        if msg.from != from {
            log::warn!("Dropping message from {from} claiming to be {}", msg.from);
            return;
        }

        match msg.msg_type {
            MessageType::SyncStep1 => self.on_sync_step1(from, &msg.payload),
            MessageType::SyncStep2 => self.on_sync_step2(from, &msg.payload),
            MessageType::Update => {
                self.apply_remote_update(from, &msg.payload);
            }
            MessageType::Awareness => self.on_awareness(from, &msg.payload),
        }
    }

    fn on_sync_step1(&mut self, from: Uuid, payload: &[u8]) {
        // The join notification may still be on its way.
        if !self.peers.contains(&from) {
            self.on_peer_joined(from);
        }
        let remote = match StateVector::decode(payload) {
            Ok(sv) => sv,
            Err(e) => {
                log::warn!("Dropping state vector from {from}: {e}");
                return;
            }
        };
        let diff = self.doc.diff(&remote);
        log::debug!("Sending {} blocks to {from}", diff.blocks.len());
        let step2 = SyncMessage::sync_step2(&self.config.room, self.config.peer, from, diff.encode());
        self.send(Some(from), &step2);
    }

    fn on_sync_step2(&mut self, from: Uuid, payload: &[u8]) {
        if !self.apply_remote_update(from, payload) {
            return;
        }
        if self.pending.remove(&from) {
            log::debug!("Caught up with {from}");
            self.emit(SessionEvent::PeerSynced(from));
        }
        self.maybe_live();
    }

    /// Returns false if the payload was rejected.
    fn apply_remote_update(&mut self, from: Uuid, payload: &[u8]) -> bool {
        let update = match Update::decode(payload) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping update from {from}: {e}");
                return false;
            }
        };
        let changes = self.doc.apply_update(&update);
        if !changes.is_empty() {
            self.emit(SessionEvent::DocumentChanged {
                origin: Origin::Remote(from),
                changes,
            });
        }
        true
    }

    fn on_awareness(&mut self, from: Uuid, payload: &[u8]) {
        let batch: Vec<AwarenessUpdate> = match decode_payload(payload) {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("Dropping awareness from {from}: {e}");
                return;
            }
        };
        let now = Instant::now();
        let mut change = AwarenessChange::default();
        for update in &batch {
            match self.awareness.apply_remote(update, now) {
                Ok(c) => change.extend(c),
                Err(stale) => log::trace!("{stale}"),
            }
        }
        if !change.is_empty() {
            self.emit(SessionEvent::AwarenessChanged(change));
        }
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn is_online(&self) -> bool {
        matches!(self.state, SessionState::Syncing | SessionState::Live)
    }

    fn maybe_live(&mut self) {
        if self.state == SessionState::Syncing && self.pending.is_empty() {
            self.set_state(SessionState::Live);
        }
    }

    fn publish_local(&mut self, edit: &Edit) {
        if edit.is_empty() {
            return;
        }
        if self.is_online() {
            let msg = SyncMessage::update(&self.config.room, self.config.peer, edit.update.encode());
            self.send(None, &msg);
        }
        self.emit(SessionEvent::DocumentChanged {
            origin: Origin::Local,
            changes: edit.changes.clone(),
        });
    }

    fn publish_awareness(&mut self, update: AwarenessUpdate) {
        let peer = update.peer;
        self.broadcast_awareness(None, vec![update]);
        self.emit(SessionEvent::AwarenessChanged(AwarenessChange {
            updated: vec![peer],
            ..AwarenessChange::default()
        }));
    }

    fn broadcast_awareness(&mut self, to: Option<Uuid>, batch: Vec<AwarenessUpdate>) {
        if !self.is_online() {
            return;
        }
        match encode_payload(&batch) {
            Ok(payload) => {
                let msg = SyncMessage::awareness(&self.config.room, self.config.peer, to, payload);
                self.send(to, &msg);
            }
            Err(e) => log::error!("Failed to encode awareness: {e}"),
        }
    }

    fn send(&mut self, to: Option<Uuid>, msg: &SyncMessage) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.msg_type);
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let result = match to {
            Some(peer) => transport.send(peer, bytes),
            None => transport.broadcast(bytes),
        };
        if let Err(e) = result {
            self.on_send_failed(e);
        }
    }

    fn on_send_failed(&mut self, error: TransportError) {
        log::warn!("Send failed in room {}: {error}", self.config.room);
        // The next Connected/PeerJoined round re-runs catch-up, which
        // carries everything this message would have.
        if self.state != SessionState::Connecting {
            self.on_disconnected();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::debug!("Session {}: {:?} -> {:?}", self.config.peer, self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}
