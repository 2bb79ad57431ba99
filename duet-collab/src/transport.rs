//! The channel a session talks through.
//!
//! A transport only has to broadcast opaque bytes to the current peer set of
//! one room and report membership changes; ordering, reliability and
//! topology are its own business. Inbound traffic arrives as a stream of
//! [`TransportEvent`]s handed to the session alongside the transport.
//!
//! [`LocalHub`] is an in-process implementation: every room is a set of
//! unbounded channels, which makes it the natural transport for tests and
//! for several editors living in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What a transport reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is (again) usable.
    Connected,
    /// The channel dropped; a `Connected` may follow.
    Disconnected,
    PeerJoined(Uuid),
    PeerLeft(Uuid),
    Message { from: Uuid, bytes: Vec<u8> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("transport closed")]
    Closed,
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Outbound half of a peer-discovery channel.
pub trait Transport: Send {
    /// Deliver `bytes` to every other peer of the room.
    fn broadcast(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Deliver `bytes` to one peer. Transports without addressing may
    /// broadcast instead; receivers filter on the envelope.
    fn send(&mut self, peer: Uuid, bytes: Vec<u8>) -> Result<(), TransportError> {
        let _ = peer;
        self.broadcast(bytes)
    }

    /// Leave the room and release the channel. Idempotent.
    fn close(&mut self);
}

// ---------------------------------------------------------------
// In-process hub
// ---------------------------------------------------------------

struct Member {
    events: mpsc::UnboundedSender<TransportEvent>,
    online: bool,
}

type Rooms = HashMap<String, HashMap<Uuid, Member>>;

/// Room-scoped in-memory fan-out.
///
/// Cloning the hub shares the rooms.
#[derive(Clone, Default)]
pub struct LocalHub {
    rooms: Arc<Mutex<Rooms>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join `room` as `peer`.
    ///
    /// The new member first sees `Connected`, then one `PeerJoined` per peer
    /// already online; those peers see `PeerJoined(peer)`.
    pub fn join(
        &self,
        room: &str,
        peer: Uuid,
    ) -> (LocalTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut rooms = self.lock();
            let members = rooms.entry(room.to_string()).or_default();
            members.insert(
                peer,
                Member {
                    events: tx,
                    online: false,
                },
            );
            bring_online(members, peer);
        }
        log::debug!("Peer {peer} joined local room {room}");

        let transport = LocalTransport {
            hub: self.clone(),
            room: room.to_string(),
            peer,
            closed: false,
        };
        (transport, rx)
    }

    /// Simulate a network drop of `peer`: it sees `Disconnected`, the others
    /// see it leave. Its traffic fails until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self, room: &str, peer: Uuid) {
        let mut rooms = self.lock();
        let Some(members) = rooms.get_mut(room) else {
            return;
        };
        let Some(member) = members.get_mut(&peer) else {
            return;
        };
        if !member.online {
            return;
        }
        member.online = false;
        let _ = member.events.send(TransportEvent::Disconnected);
        notify_others(members, peer, TransportEvent::PeerLeft(peer));
    }

    /// Bring a disconnected peer back, replaying the join notifications.
    pub fn reconnect(&self, room: &str, peer: Uuid) {
        let mut rooms = self.lock();
        if let Some(members) = rooms.get_mut(room) {
            if members.get(&peer).is_some_and(|m| !m.online) {
                bring_online(members, peer);
            }
        }
    }

    /// Online peers in `room`.
    pub fn peer_count(&self, room: &str) -> usize {
        self.lock()
            .get(room)
            .map_or(0, |members| members.values().filter(|m| m.online).count())
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    fn deliver(&self, room: &str, from: Uuid, to: Option<Uuid>, bytes: Vec<u8>) -> Result<(), TransportError> {
        let rooms = self.lock();
        let members = rooms.get(room).ok_or(TransportError::Closed)?;
        match members.get(&from) {
            None => return Err(TransportError::Closed),
            Some(sender) if !sender.online => return Err(TransportError::Disconnected),
            Some(_) => {}
        }

        for (id, member) in members {
            if *id == from || !member.online || to.is_some_and(|to| to != *id) {
                continue;
            }
            let _ = member.events.send(TransportEvent::Message {
                from,
                bytes: bytes.clone(),
            });
        }
        Ok(())
    }

    fn leave(&self, room: &str, peer: Uuid) {
        let mut rooms = self.lock();
        let Some(members) = rooms.get_mut(room) else {
            return;
        };
        if let Some(member) = members.remove(&peer) {
            if member.online {
                notify_others(members, peer, TransportEvent::PeerLeft(peer));
            }
        }
        if members.is_empty() {
            rooms.remove(room);
        }
        log::debug!("Peer {peer} left local room {room}");
    }
}

fn bring_online(members: &mut HashMap<Uuid, Member>, peer: Uuid) {
    let others: Vec<Uuid> = members
        .iter()
        .filter(|(id, m)| **id != peer && m.online)
        .map(|(id, _)| *id)
        .collect();
    if let Some(member) = members.get_mut(&peer) {
        member.online = true;
        let _ = member.events.send(TransportEvent::Connected);
        for other in &others {
            let _ = member.events.send(TransportEvent::PeerJoined(*other));
        }
    }
    notify_others(members, peer, TransportEvent::PeerJoined(peer));
}

fn notify_others(members: &HashMap<Uuid, Member>, peer: Uuid, event: TransportEvent) {
    for (id, member) in members {
        if *id != peer && member.online {
            let _ = member.events.send(event.clone());
        }
    }
}

/// One peer's handle on a [`LocalHub`] room. Leaves the room on drop.
pub struct LocalTransport {
    hub: LocalHub,
    room: String,
    peer: Uuid,
    closed: bool,
}

impl LocalTransport {
    pub fn peer_id(&self) -> Uuid {
        self.peer
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}

impl Transport for LocalTransport {
    fn broadcast(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.hub.deliver(&self.room, self.peer, None, bytes)
    }

    fn send(&mut self, peer: Uuid, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.hub.deliver(&self.room, self.peer, Some(peer), bytes)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.hub.leave(&self.room, self.peer);
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_join_announces_both_ways() {
        let hub = LocalHub::new();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let (_ta, mut ra) = hub.join("room", a);
        assert_eq!(drain(&mut ra), vec![TransportEvent::Connected]);

        let (_tb, mut rb) = hub.join("room", b);
        assert_eq!(drain(&mut rb), vec![TransportEvent::Connected, TransportEvent::PeerJoined(a)]);
        assert_eq!(drain(&mut ra), vec![TransportEvent::PeerJoined(b)]);
        assert_eq!(hub.peer_count("room"), 2);
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let hub = LocalHub::new();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let (mut ta, mut ra) = hub.join("room", a);
        let (_tb, mut rb) = hub.join("room", b);
        drain(&mut ra);
        drain(&mut rb);

        ta.broadcast(vec![1, 2, 3]).unwrap();
        assert!(drain(&mut ra).is_empty());
        assert_eq!(drain(&mut rb), vec![TransportEvent::Message { from: a, bytes: vec![1, 2, 3] }]);
    }

    #[test]
    fn test_targeted_send() {
        let hub = LocalHub::new();
        let (a, b, c) = (Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3));
        let (mut ta, _ra) = hub.join("room", a);
        let (_tb, mut rb) = hub.join("room", b);
        let (_tc, mut rc) = hub.join("room", c);
        drain(&mut rb);
        drain(&mut rc);

        ta.send(c, vec![9]).unwrap();
        assert!(drain(&mut rb).is_empty());
        assert_eq!(drain(&mut rc).len(), 1);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let hub = LocalHub::new();
        let (mut ta, _ra) = hub.join("one", Uuid::from_u128(1));
        let (_tb, mut rb) = hub.join("two", Uuid::from_u128(2));
        drain(&mut rb);

        ta.broadcast(vec![1]).unwrap();
        assert!(drain(&mut rb).is_empty());
        assert_eq!(hub.room_count(), 2);
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let hub = LocalHub::new();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let (mut ta, mut ra) = hub.join("room", a);
        let (_tb, mut rb) = hub.join("room", b);
        drain(&mut ra);
        drain(&mut rb);

        hub.disconnect("room", a);
        assert_eq!(drain(&mut ra), vec![TransportEvent::Disconnected]);
        assert_eq!(drain(&mut rb), vec![TransportEvent::PeerLeft(a)]);
        assert_eq!(ta.broadcast(vec![1]), Err(TransportError::Disconnected));

        hub.reconnect("room", a);
        assert_eq!(drain(&mut ra), vec![TransportEvent::Connected, TransportEvent::PeerJoined(b)]);
        assert_eq!(drain(&mut rb), vec![TransportEvent::PeerJoined(a)]);
        assert!(ta.broadcast(vec![1]).is_ok());
    }

    #[test]
    fn test_close_is_idempotent_and_leaves_room() {
        let hub = LocalHub::new();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let (mut ta, _ra) = hub.join("room", a);
        let (_tb, mut rb) = hub.join("room", b);
        drain(&mut rb);

        ta.close();
        ta.close();
        assert_eq!(drain(&mut rb), vec![TransportEvent::PeerLeft(a)]);
        assert_eq!(ta.broadcast(vec![1]), Err(TransportError::Closed));
        assert_eq!(hub.peer_count("room"), 1);
    }

    #[test]
    fn test_drop_leaves_room() {
        let hub = LocalHub::new();
        {
            let _t = hub.join("room", Uuid::from_u128(1));
        }
        assert_eq!(hub.room_count(), 0);
    }
}
