//! Envelope for everything a session puts on the wire.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ┌──────────┬──────────┬───────────┬─────────────┬──────────┐
//! │ msg_type │ room     │ from      │ to          │ payload  │
//! │ 1 byte   │ string   │ 16 bytes  │ 0 / 1+16 B  │ variable │
//! └──────────┴──────────┴───────────┴─────────────┴──────────┘
//! ```
//!
//! The payload is opaque here: an encoded `StateVector` or `Update` from
//! `duet-core`, or a batch of awareness updates.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Largest envelope or frame accepted from the network.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; the receiver answers with what it lacks
    SyncStep1 = 1,
    /// Answer to a `SyncStep1`: the update the requester is missing
    SyncStep2 = 2,
    /// Incremental update produced by a local edit
    Update = 3,
    /// Batch of awareness (presence) updates
    Awareness = 4,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub room: String,
    pub from: Uuid,
    /// Intended recipient. Everybody else drops the message; the transport
    /// may well deliver it to the whole room.
    pub to: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn sync_step1(room: &str, from: Uuid, to: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, room, from, Some(to), state_vector)
    }

    pub fn sync_step2(room: &str, from: Uuid, to: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, room, from, Some(to), diff)
    }

    pub fn update(room: &str, from: Uuid, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, room, from, None, update)
    }

    pub fn awareness(room: &str, from: Uuid, to: Option<Uuid>, batch: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, room, from, to, batch)
    }

    fn new(msg_type: MessageType, room: &str, from: Uuid, to: Option<Uuid>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            room: room.to_string(),
            from,
            to,
            payload,
        }
    }

    /// Whether `peer` should act on this message.
    pub fn is_addressed_to(&self, peer: Uuid) -> bool {
        self.to.map_or(true, |to| to == peer)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }
}

/// bincode-encode any wire value.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// bincode-decode a wire value, rejecting oversize prefixes and trailing bytes.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_MESSAGE_BYTES>();
    let (value, read) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes(bytes.len() - read));
    }
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
