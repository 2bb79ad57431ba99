//! # duet-core: Replicated rich-text document for Duet
//!
//! A conflict-free text type that converges on every replica regardless of
//! the order, duplication or delay of the updates it receives.
//!
//! ## Architecture
//!
//! ```text
//!  local edit ──► Document::insert/delete/format ──► Edit { Update, Changes }
//!                                                        │
//!                                              WireFormat::encode
//!                                                        │ bytes
//!                                                        ▼
//!  remote ◄── Document::apply_update ◄── WireFormat::decode
//!
//!  catch-up:  StateVector (what I have) ──► Document::diff (what you lack)
//! ```
//!
//! ## Modules
//!
//! - [`doc`]: the replicated document and its integration algorithm
//! - [`update`]: blocks (characters, format operations) and updates
//! - [`state_vector`] / [`delete_set`]: sync bookkeeping
//! - [`codec`]: tagged bincode encoding for the wire
//! - [`attributes`]: rich-text attribute values
//! - [`position`]: cursor anchors that survive concurrent edits

pub mod attributes;
pub mod codec;
pub mod delete_set;
pub mod doc;
pub mod id;
pub mod position;
pub mod state_vector;
pub mod update;

pub use attributes::{attributes, AttrValue, Attributes};
pub use codec::{DecodeError, WireFormat};
pub use delete_set::{DeleteRange, DeleteSet};
pub use doc::{Change, Document, Edit, TextRun};
pub use id::ItemId;
pub use position::RelativePosition;
pub use state_vector::StateVector;
pub use update::{Block, Format, Item, Update};
