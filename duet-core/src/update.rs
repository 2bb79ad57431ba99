//! Replayable document deltas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::attributes::Attributes;
use crate::delete_set::DeleteSet;
use crate::id::ItemId;

/// One inserted character.
///
/// `origin` is the item immediately to the left when the character was
/// typed, `right_origin` the item immediately to the right. Both may be
/// tombstones by the time a remote replica integrates the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub origin: Option<ItemId>,
    pub right_origin: Option<ItemId>,
    pub content: char,
    pub attributes: Attributes,
}

/// A formatting operation over a set of items.
///
/// Each `(target, key)` pair is resolved last-writer-wins by
/// `(lamport, id.peer)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub id: ItemId,
    pub lamport: u64,
    pub targets: Vec<ItemId>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    Item(Item),
    Format(Format),
}

impl Block {
    pub fn id(&self) -> ItemId {
        match self {
            Block::Item(item) => item.id,
            Block::Format(format) => format.id,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Block::Item(item) => {
                if item.origin == Some(item.id) || item.right_origin == Some(item.id) {
                    return Err(format!("item {} references itself", item.id));
                }
                if item.origin.is_some() && item.origin == item.right_origin {
                    return Err(format!("item {} has identical origins", item.id));
                }
            }
            Block::Format(format) => {
                if format.targets.is_empty() {
                    return Err(format!("format {} has no targets", format.id));
                }
                if format.targets.contains(&format.id) {
                    return Err(format!("format {} targets itself", format.id));
                }
            }
        }
        Ok(())
    }
}

/// A self-contained delta: new blocks plus the sender's delete set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub blocks: Vec<Block>,
    pub delete_set: DeleteSet,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.delete_set.is_empty()
    }

    /// Combine several updates into one, dropping duplicate blocks.
    pub fn merge<'a, I>(updates: I) -> Update
    where
        I: IntoIterator<Item = &'a Update>,
    {
        let mut blocks = BTreeMap::new();
        let mut delete_set = DeleteSet::new();
        for update in updates {
            for block in &update.blocks {
                blocks.entry(block.id()).or_insert_with(|| block.clone());
            }
            delete_set.merge(&update.delete_set);
        }
        Update {
            blocks: blocks.into_values().collect(),
            delete_set,
        }
    }

    /// Structural checks run on every decoded update.
    pub fn validate(&self) -> Result<(), String> {
        for block in &self.blocks {
            block.validate()?;
        }
        self.delete_set.validate()
    }
}
