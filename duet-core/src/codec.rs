//! Binary encoding for updates and state vectors.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │ tag     │ bincode body (standard cfg)  │
//! │ 1 byte  │ variable                     │
//! └─────────┴──────────────────────────────┘
//! ```
//!
//! The tag keeps an update from being mistaken for a state vector (and vice
//! versa). Decoding is total: any byte string either yields a value that
//! passes structural validation or a [`DecodeError`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::state_vector::StateVector;
use crate::update::Update;

/// Upper bound on the bytes a single decode may claim.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

pub const UPDATE_TAG: u8 = 0x01;
pub const STATE_VECTOR_TAG: u8 = 0x02;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,
    #[error("Unexpected payload tag {found:#04x} (expected {expected:#04x})")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("Invalid update: {0}")]
    Invalid(String),
}

/// Values that travel between replicas as opaque bytes.
pub trait WireFormat: Sized {
    const TAG: u8;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;
}

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_PAYLOAD_BYTES>()
}

pub(crate) fn encode_tagged<T: Serialize>(tag: u8, value: &T) -> Vec<u8> {
    let mut out = vec![tag];
    // Writing into a Vec cannot fail; an error here means a serde impl bug.
    if let Err(e) = bincode::serde::encode_into_std_write(value, &mut out, config()) {
        log::error!("Failed to encode payload with tag {tag:#04x}: {e}");
        out.truncate(1);
    }
    out
}

pub(crate) fn decode_tagged<T: DeserializeOwned>(tag: u8, bytes: &[u8]) -> Result<T, DecodeError> {
    let (&found, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if found != tag {
        return Err(DecodeError::UnexpectedTag { expected: tag, found });
    }
    let (value, read): (T, usize) = bincode::serde::decode_from_slice(body, config())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if read != body.len() {
        return Err(DecodeError::TrailingBytes(body.len() - read));
    }
    Ok(value)
}

impl WireFormat for Update {
    const TAG: u8 = UPDATE_TAG;

    fn encode(&self) -> Vec<u8> {
        encode_tagged(Self::TAG, self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let update: Update = decode_tagged(Self::TAG, bytes)?;
        update.validate().map_err(DecodeError::Invalid)?;
        Ok(update)
    }
}

impl WireFormat for StateVector {
    const TAG: u8 = STATE_VECTOR_TAG;

    fn encode(&self) -> Vec<u8> {
        encode_tagged(Self::TAG, self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_tagged(Self::TAG, bytes)
    }
}
