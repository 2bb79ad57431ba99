//! # duet-collab: Networked collaboration for Duet documents
//!
//! Connects [`duet_core::Document`] replicas through a room-scoped relay and
//! shares per-peer presence (names, colours, cursors) alongside the text.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   SyncMessage    ┌───────────┐   SyncMessage    ┌──────────────┐
//! │ Session      │ ◄──────────────► │ Relay     │ ◄──────────────► │ Session      │
//! │ Document     │   (WebSocket)    │ (rooms,   │   (WebSocket)    │ Document     │
//! │ Awareness    │                  │  fan-out) │                  │ Awareness    │
//! └──────┬───────┘                  └───────────┘                  └──────────────┘
//!        │ SessionEvent
//!        ▼
//! ┌──────────────┐
//! │EditorBinding │ ──► Widget
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded [`SyncMessage`] envelopes
//! - [`awareness`]: ephemeral per-peer presence with expiry
//! - [`transport`]: the [`Transport`] seam and an in-process [`LocalHub`]
//! - [`session`]: catch-up handshake and live update exchange
//! - [`driver`]: runs a session on a tokio task behind a [`SessionHandle`]
//! - [`binding`]: keeps an editor widget and a session in step
//! - [`relay`]: WebSocket relay server
//! - [`ws`]: WebSocket client transport

pub mod awareness;
pub mod binding;
pub mod driver;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transport;
pub mod ws;

pub use awareness::{
    peer_color, AwarenessChange, AwarenessStore, AwarenessUpdate, CursorRange, Presence,
    PresenceField, StaleAwarenessUpdate,
};
pub use binding::{
    presence_list, remote_cursors, EditSource, EditorBinding, RemoteCursor, Selection, Widget,
    WidgetEdit,
};
pub use driver::{spawn_session, SessionHandle};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use relay::{RelayConfig, RelayError, RelayFrame, RelayServer, RelayStats};
pub use session::{
    Origin, Session, SessionConfig, SessionError, SessionEvent, SessionState,
    DEFAULT_RESYNC_INTERVAL,
};
pub use transport::{LocalHub, LocalTransport, Transport, TransportError, TransportEvent};
pub use ws::{WsTransport, WsTransportConfig};
