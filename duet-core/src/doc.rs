//! Replicated rich-text document.
//!
//! Text is stored as a sequence of single-character items in document order,
//! tombstones included. Each item remembers its left and right neighbours at
//! the moment it was typed (`origin` / `right_origin`); a remote replica
//! re-derives the insertion point from those anchors instead of from an
//! index, which makes integration order-independent:
//!
//! ```text
//!   origin                         right_origin
//!     │   ┌── concurrent inserts ──┐   │
//!     ▼   ▼                        ▼   ▼
//!   [ a ][ x1 ][ x2 ][ y1 ] ...  [ b ]
//!         └─ ordered by (origin position, peer id) ─┘
//! ```
//!
//! Blocks whose dependencies have not arrived yet are buffered in a pending
//! queue, so the state vector only ever describes contiguous prefixes.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use uuid::Uuid;

use crate::attributes::{without_nulls, AttrValue, Attributes};
use crate::codec::{DecodeError, WireFormat};
use crate::delete_set::DeleteSet;
use crate::id::ItemId;
use crate::position::RelativePosition;
use crate::state_vector::StateVector;
use crate::update::{Block, Format, Item, Update};

/// A visible edit caused by a local operation or by integrating an update.
///
/// Indices count Unicode scalar values. Within one list each change is
/// relative to the text produced by applying the previous ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Insert {
        index: usize,
        text: String,
        attributes: Attributes,
    },
    Delete {
        index: usize,
        len: usize,
    },
    /// `attributes` holds the effective new values; `Null` means removed.
    Format {
        index: usize,
        len: usize,
        attributes: Attributes,
    },
}

/// Result of a local operation: the update to broadcast and what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Edit {
    pub update: Update,
    pub changes: Vec<Change>,
}

impl Edit {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty()
    }
}

/// Maximal run of visible text sharing one attribute set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone)]
struct Mark {
    stamp: (u64, Uuid),
    value: AttrValue,
}

#[derive(Debug, Clone)]
struct Entry {
    item: Item,
    deleted: bool,
    marks: BTreeMap<String, Mark>,
}

impl Entry {
    fn new(item: Item, deleted: bool) -> Self {
        Self {
            item,
            deleted,
            marks: BTreeMap::new(),
        }
    }

    fn attributes(&self) -> Attributes {
        let mut attrs = self.item.attributes.clone();
        for (key, mark) in &self.marks {
            if mark.value.is_null() {
                attrs.remove(key);
            } else {
                attrs.insert(key.clone(), mark.value.clone());
            }
        }
        attrs
    }
}

enum Readiness {
    Ready,
    Waiting,
    Integrated,
    Invalid(String),
}

/// Coalesces consecutive compatible changes.
#[derive(Default)]
struct ChangeLog {
    changes: Vec<Change>,
    /// Char length of the trailing `Insert`, if any.
    tail_insert_len: usize,
}

impl ChangeLog {
    fn push(&mut self, change: Change) {
        if let Some(last) = self.changes.last_mut() {
            match (last, &change) {
                (
                    Change::Insert { index, text, attributes },
                    Change::Insert { index: i, text: t, attributes: a },
                ) if *i == *index + self.tail_insert_len && attributes == a => {
                    text.push_str(t);
                    self.tail_insert_len += t.chars().count();
                    return;
                }
                (Change::Delete { index, len }, Change::Delete { index: i, len: l }) => {
                    if *i == *index {
                        *len += l;
                        return;
                    }
                    if *i + *l == *index {
                        *index = *i;
                        *len += l;
                        return;
                    }
                }
                (
                    Change::Format { index, len, attributes },
                    Change::Format { index: i, len: l, attributes: a },
                ) if *i == *index + *len && attributes == a => {
                    *len += l;
                    return;
                }
                _ => {}
            }
        }
        if let Change::Insert { text, .. } = &change {
            self.tail_insert_len = text.chars().count();
        }
        self.changes.push(change);
    }

    fn into_vec(self) -> Vec<Change> {
        self.changes
    }
}

/// A replica of the shared text.
#[derive(Debug, Clone)]
pub struct Document {
    peer: Uuid,
    /// Item ids in document order, tombstones included.
    order: Vec<ItemId>,
    entries: HashMap<ItemId, Entry>,
    formats: HashMap<ItemId, Format>,
    state: StateVector,
    deleted: DeleteSet,
    pending: Vec<Block>,
    lamport: u64,
    visible_len: usize,
    /// Last position looked up or written; typing is mostly sequential.
    hint: Cell<usize>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

impl Document {
    /// Create an empty replica owned by `peer`.
    ///
    /// A peer id must never be reused by a fresh replica of the same room:
    /// its clocks restart at zero and would collide with blocks other
    /// replicas already hold.
    pub fn new(peer: Uuid) -> Self {
        Self {
            peer,
            order: Vec::new(),
            entries: HashMap::new(),
            formats: HashMap::new(),
            state: StateVector::new(),
            deleted: DeleteSet::new(),
            pending: Vec::new(),
            lamport: 0,
            visible_len: 0,
            hint: Cell::new(0),
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer
    }

    /// Visible length in chars.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    pub fn text(&self) -> String {
        self.visible_entries().map(|e| e.item.content).collect()
    }

    /// Visible text grouped into runs of equal attributes.
    pub fn contents(&self) -> Vec<TextRun> {
        let mut runs: Vec<TextRun> = Vec::new();
        for entry in self.visible_entries() {
            let attributes = entry.attributes();
            match runs.last_mut() {
                Some(run) if run.attributes == attributes => run.text.push(entry.item.content),
                _ => runs.push(TextRun {
                    text: entry.item.content.to_string(),
                    attributes,
                }),
            }
        }
        runs
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.deleted
    }

    /// Blocks received but not yet integrable.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state.encode()
    }

    // ---------------------------------------------------------------
    // Local operations
    // ---------------------------------------------------------------

    /// Insert `text` at visible `index` (clamped to the current length).
    pub fn insert(&mut self, index: usize, text: &str, attributes: Attributes) -> Edit {
        let index = index.min(self.visible_len);
        if text.is_empty() {
            return Edit::default();
        }
        let attributes = without_nulls(&attributes);

        let raw = if index == 0 {
            0
        } else {
            self.raw_index_of_visible(index - 1)
                .map_or(self.order.len(), |p| p + 1)
        };
        let mut origin = raw.checked_sub(1).and_then(|p| self.order.get(p).copied());
        let right_origin = self.order.get(raw).copied();

        let mut ids = Vec::with_capacity(text.len());
        let mut blocks = Vec::with_capacity(text.len());
        for content in text.chars() {
            let id = ItemId::new(self.peer, self.state.advance(self.peer));
            let item = Item {
                id,
                origin,
                right_origin,
                content,
                attributes: attributes.clone(),
            };
            self.entries.insert(id, Entry::new(item.clone(), false));
            blocks.push(Block::Item(item));
            ids.push(id);
            origin = Some(id);
        }
        let count = ids.len();
        self.order.splice(raw..raw, ids);
        self.hint.set(raw + count - 1);
        self.visible_len += count;

        Edit {
            update: Update {
                blocks,
                delete_set: DeleteSet::new(),
            },
            changes: vec![Change::Insert {
                index,
                text: text.to_string(),
                attributes,
            }],
        }
    }

    /// Delete the visible chars in `range` (clamped).
    pub fn delete(&mut self, range: Range<usize>) -> Edit {
        let (start, end) = self.clamp(range);
        if start >= end {
            return Edit::default();
        }
        let mut delete_set = DeleteSet::new();
        for id in self.visible_ids(start..end) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.deleted = true;
            }
            delete_set.insert(id);
        }
        self.deleted.merge(&delete_set);
        self.visible_len -= end - start;

        Edit {
            update: Update {
                blocks: Vec::new(),
                delete_set,
            },
            changes: vec![Change::Delete {
                index: start,
                len: end - start,
            }],
        }
    }

    /// Apply `attributes` to the visible chars in `range` (clamped).
    /// A `Null` value clears that attribute.
    pub fn format(&mut self, range: Range<usize>, attributes: Attributes) -> Edit {
        let (start, end) = self.clamp(range);
        if start >= end || attributes.is_empty() {
            return Edit::default();
        }
        self.lamport += 1;
        let format = Format {
            id: ItemId::new(self.peer, self.state.get(&self.peer)),
            lamport: self.lamport,
            targets: self.visible_ids(start..end),
            attributes,
        };
        let mut log = ChangeLog::default();
        self.integrate_format(format.clone(), &mut log);

        Edit {
            update: Update {
                blocks: vec![Block::Format(format)],
                delete_set: DeleteSet::new(),
            },
            changes: log.into_vec(),
        }
    }

    // ---------------------------------------------------------------
    // Remote integration
    // ---------------------------------------------------------------

    /// Merge a remote update. Safe to call with duplicates, overlapping
    /// updates and updates whose dependencies are still missing.
    ///
    /// An update with a block anchored on a format block is rejected as a
    /// whole and nothing is applied. The one case caught only later is a
    /// block whose format dependency arrives in a subsequent update: that
    /// block alone is dropped when the format integrates.
    pub fn apply_update(&mut self, update: &Update) -> Vec<Change> {
        if let Err(reason) = self.check_anchors(update) {
            log::warn!("Rejecting update: {reason}");
            return Vec::new();
        }
        self.merge_update(update)
    }

    /// Decode and merge an encoded update. Nothing is applied on error.
    pub fn apply_update_bytes(&mut self, bytes: &[u8]) -> Result<Vec<Change>, DecodeError> {
        let update = Update::decode(bytes)?;
        self.check_anchors(&update).map_err(DecodeError::Invalid)?;
        Ok(self.merge_update(&update))
    }

    /// Everything this replica holds that `remote` lacks.
    pub fn diff(&self, remote: &StateVector) -> Update {
        let mut blocks: Vec<Block> = self
            .entries
            .values()
            .filter(|e| !remote.contains(&e.item.id))
            .map(|e| Block::Item(e.item.clone()))
            .chain(
                self.formats
                    .values()
                    .filter(|f| !remote.contains(&f.id))
                    .map(|f| Block::Format(f.clone())),
            )
            .collect();
        blocks.sort_by_key(Block::id);

        Update {
            blocks,
            delete_set: self.deleted.clone(),
        }
    }

    /// `diff` against an encoded state vector, encoded.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let remote = StateVector::decode(state_vector)?;
        Ok(self.diff(&remote).encode())
    }

    /// Full snapshot of this replica as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.diff(&StateVector::new()).encode()
    }

    // ---------------------------------------------------------------
    // Positions
    // ---------------------------------------------------------------

    pub fn relative_position(&self, index: usize) -> RelativePosition {
        if index >= self.visible_len {
            return RelativePosition::End;
        }
        self.raw_index_of_visible(index)
            .and_then(|raw| self.order.get(raw))
            .map_or(RelativePosition::End, |id| RelativePosition::Before(*id))
    }

    /// Resolve a relative position; `None` if its anchor is unknown here.
    pub fn absolute_position(&self, position: &RelativePosition) -> Option<usize> {
        match position {
            RelativePosition::End => Some(self.visible_len),
            RelativePosition::Before(id) => self.index_of(id).map(|raw| self.visible_before(raw)),
        }
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn merge_update(&mut self, update: &Update) -> Vec<Change> {
        let mut log = ChangeLog::default();

        for block in &update.blocks {
            let id = block.id();
            if self.state.contains(&id) || self.pending.iter().any(|b| b.id() == id) {
                continue;
            }
            self.pending.push(block.clone());
        }
        self.integrate_pending(&mut log);
        self.integrate_delete_set(&update.delete_set, &mut log);

        log.into_vec()
    }

    /// Items may only be anchored on items, and formats may only target them.
    fn check_anchors(&self, update: &Update) -> Result<(), String> {
        let incoming: HashSet<ItemId> = update
            .blocks
            .iter()
            .filter_map(|b| match b {
                Block::Format(f) => Some(f.id),
                Block::Item(_) => None,
            })
            .collect();
        let is_format = |id: &ItemId| {
            incoming.contains(id)
                || self.formats.contains_key(id)
                || self
                    .pending
                    .iter()
                    .any(|b| matches!(b, Block::Format(f) if f.id == *id))
        };

        for block in &update.blocks {
            let deps: Vec<&ItemId> = match block {
                Block::Item(item) => item.origin.iter().chain(item.right_origin.iter()).collect(),
                Block::Format(format) => format.targets.iter().collect(),
            };
            if let Some(dep) = deps.into_iter().find(|d| is_format(*d)) {
                return Err(format!("block {} depends on format block {dep}", block.id()));
            }
        }
        Ok(())
    }

    /// Tombstone the items a remote delete set names. Only clocks this
    /// replica holds are visited; the rest is remembered for later arrivals.
    fn integrate_delete_set(&mut self, remote: &DeleteSet, log: &mut ChangeLog) {
        let mut targets = Vec::new();
        for (peer, ranges) in remote.iter() {
            let held = self.state.get(peer);
            for range in ranges {
                let end = range.end().min(held);
                if range.start >= end || self.deleted.contains_range(peer, range.start, end) {
                    continue;
                }
                targets.extend((range.start..end).map(|clock| ItemId::new(*peer, clock)));
            }
        }
        for id in targets {
            self.delete_remote(id, log);
        }
        self.deleted.merge(remote);
    }

    fn integrate_pending(&mut self, log: &mut ChangeLog) {
        loop {
            let mut queue = std::mem::take(&mut self.pending);
            queue.sort_by_key(Block::id);

            let mut progressed = false;
            let mut waiting = Vec::new();
            for block in queue {
                match self.readiness(&block) {
                    Readiness::Ready => {
                        match block {
                            Block::Item(item) => self.integrate_item(item, log),
                            Block::Format(format) => self.integrate_format(format, log),
                        }
                        progressed = true;
                    }
                    Readiness::Waiting => waiting.push(block),
                    Readiness::Integrated => {}
                    Readiness::Invalid(reason) => {
                        log::warn!("Dropping block {}: {reason}", block.id());
                    }
                }
            }
            self.pending = waiting;

            if !progressed || self.pending.is_empty() {
                break;
            }
        }
        if !self.pending.is_empty() {
            log::debug!("{} blocks waiting for dependencies", self.pending.len());
        }
    }

    fn readiness(&self, block: &Block) -> Readiness {
        let id = block.id();
        let expected = self.state.get(&id.peer);
        if id.clock < expected {
            return Readiness::Integrated;
        }
        if id.clock > expected {
            return Readiness::Waiting;
        }

        let deps: Vec<ItemId> = match block {
            Block::Item(item) => [item.origin, item.right_origin].into_iter().flatten().collect(),
            Block::Format(format) => format.targets.clone(),
        };
        for dep in deps {
            if self.entries.contains_key(&dep) {
                continue;
            }
            if self.state.contains(&dep) {
                return Readiness::Invalid(format!("depends on non-text block {dep}"));
            }
            return Readiness::Waiting;
        }
        Readiness::Ready
    }

    fn integrate_item(&mut self, item: Item, log: &mut ChangeLog) {
        let left = item.origin.and_then(|o| self.index_of(&o));
        let right = item
            .right_origin
            .and_then(|r| self.index_of(&r))
            .unwrap_or(self.order.len());

        let mut scan = left.map_or(0, |l| l + 1);
        let mut insert_at = scan;
        let mut conflicting: HashSet<ItemId> = HashSet::new();
        let mut before_origin: HashSet<ItemId> = HashSet::new();

        while scan < right {
            let o_id = self.order[scan];
            let Some(o) = self.entries.get(&o_id).map(|e| &e.item) else {
                break;
            };
            before_origin.insert(o_id);
            conflicting.insert(o_id);

            if o.origin == item.origin {
                if o_id.peer < item.id.peer {
                    insert_at = scan + 1;
                    conflicting.clear();
                } else if o.right_origin == item.right_origin {
                    break;
                }
            } else if let Some(o_origin) = o.origin.filter(|oo| before_origin.contains(oo)) {
                if !conflicting.contains(&o_origin) {
                    insert_at = scan + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
            scan += 1;
        }

        let id = item.id;
        let deleted = self.deleted.contains(&id);
        let content = item.content;
        let attributes = without_nulls(&item.attributes);

        self.order.insert(insert_at, id);
        self.entries.insert(id, Entry::new(item, deleted));
        self.state.set_max(id.peer, id.clock + 1);
        self.hint.set(insert_at);

        if !deleted {
            self.visible_len += 1;
            log.push(Change::Insert {
                index: self.visible_before(insert_at),
                text: content.to_string(),
                attributes,
            });
        }
    }

    fn integrate_format(&mut self, format: Format, log: &mut ChangeLog) {
        self.lamport = self.lamport.max(format.lamport);
        let stamp = (format.lamport, format.id.peer);

        for target in &format.targets {
            let changed = {
                let Some(entry) = self.entries.get_mut(target) else {
                    continue;
                };
                let before = entry.attributes();
                for (key, value) in &format.attributes {
                    let newer = entry.marks.get(key).map_or(true, |m| stamp > m.stamp);
                    if newer {
                        entry.marks.insert(
                            key.clone(),
                            Mark {
                                stamp,
                                value: value.clone(),
                            },
                        );
                    }
                }
                if entry.deleted {
                    continue;
                }
                let after = entry.attributes();
                let delta: Attributes = format
                    .attributes
                    .keys()
                    .filter(|k| before.get(*k) != after.get(*k))
                    .map(|k| (k.clone(), after.get(k).cloned().unwrap_or(AttrValue::Null)))
                    .collect();
                delta
            };
            if changed.is_empty() {
                continue;
            }
            if let Some(raw) = self.index_of(target) {
                log.push(Change::Format {
                    index: self.visible_before(raw),
                    len: 1,
                    attributes: changed,
                });
            }
        }

        self.state.set_max(format.id.peer, format.id.clock + 1);
        self.formats.insert(format.id, format);
    }

    fn delete_remote(&mut self, id: ItemId, log: &mut ChangeLog) {
        if !self.is_visible(&id) {
            return;
        }
        let Some(raw) = self.index_of(&id) else {
            return;
        };
        let index = self.visible_before(raw);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.deleted = true;
            self.visible_len -= 1;
            log.push(Change::Delete { index, len: 1 });
        }
    }

    fn clamp(&self, range: Range<usize>) -> (usize, usize) {
        let start = range.start.min(self.visible_len);
        let end = range.end.min(self.visible_len);
        (start, end)
    }

    fn visible_entries(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| !e.deleted)
    }

    fn is_visible(&self, id: &ItemId) -> bool {
        self.entries.get(id).is_some_and(|e| !e.deleted)
    }

    fn index_of(&self, id: &ItemId) -> Option<usize> {
        let hint = self.hint.get();
        for candidate in [hint, hint + 1] {
            if self.order.get(candidate) == Some(id) {
                self.hint.set(candidate);
                return Some(candidate);
            }
        }
        let pos = self.order.iter().position(|o| o == id)?;
        self.hint.set(pos);
        Some(pos)
    }

    /// Number of visible items before raw position `raw`.
    fn visible_before(&self, raw: usize) -> usize {
        self.order[..raw.min(self.order.len())]
            .iter()
            .filter(|id| self.is_visible(id))
            .count()
    }

    /// Raw position of the `index`-th visible item.
    fn raw_index_of_visible(&self, index: usize) -> Option<usize> {
        self.order
            .iter()
            .enumerate()
            .filter(|(_, id)| self.is_visible(id))
            .nth(index)
            .map(|(raw, _)| raw)
    }

    fn visible_ids(&self, range: Range<usize>) -> Vec<ItemId> {
        self.order
            .iter()
            .filter(|id| self.is_visible(id))
            .skip(range.start)
            .take(range.end.saturating_sub(range.start))
            .copied()
            .collect()
    }
}
