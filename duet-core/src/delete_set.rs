//! Compact record of tombstoned items.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::id::ItemId;

/// A run of consecutive clocks from one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRange {
    pub start: u64,
    pub len: u64,
}

impl DeleteRange {
    /// One past the last clock.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }
}

/// Tombstoned item ids, stored as sorted, coalesced ranges per peer.
///
/// Deletions carry no clock of their own, so every diff ships the whole set.
/// Merging is a set union and therefore idempotent and commutative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSet(BTreeMap<Uuid, Vec<DeleteRange>>);

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: ItemId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.insert_range(id.peer, id.clock, 1);
        true
    }

    pub fn insert_range(&mut self, peer: Uuid, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let ranges = self.0.entry(peer).or_default();
        ranges.push(DeleteRange { start, len });
        normalize(ranges);
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        let Some(ranges) = self.0.get(&id.peer) else {
            return false;
        };
        let idx = ranges.partition_point(|r| r.start <= id.clock);
        idx > 0 && id.clock < ranges[idx - 1].end()
    }

    pub fn merge(&mut self, other: &DeleteSet) {
        for (peer, ranges) in &other.0 {
            let mine = self.0.entry(*peer).or_default();
            mine.extend(ranges.iter().filter(|r| r.len > 0).copied());
            normalize(mine);
        }
    }

    /// Whether every clock in `start..end` from `peer` is present.
    pub fn contains_range(&self, peer: &Uuid, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        let ranges = self.ranges(peer);
        let idx = ranges.partition_point(|r| r.start <= start);
        idx > 0 && end <= ranges[idx - 1].end()
    }

    /// Ranges per peer, ordered by peer. Ranges can be far larger than
    /// anything a replica holds; never expand them blindly.
    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &[DeleteRange])> + '_ {
        self.0.iter().map(|(peer, ranges)| (peer, ranges.as_slice()))
    }

    pub fn ranges(&self, peer: &Uuid) -> &[DeleteRange] {
        self.0.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of deleted ids.
    pub fn len(&self) -> u64 {
        self.0
            .values()
            .flatten()
            .fold(0u64, |total, r| total.saturating_add(r.len))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        for (peer, ranges) in &self.0 {
            for r in ranges {
                if r.len == 0 {
                    return Err(format!("empty delete range for peer {peer}"));
                }
                if r.start.checked_add(r.len).is_none() {
                    return Err(format!("delete range overflows for peer {peer}"));
                }
            }
        }
        Ok(())
    }
}

fn normalize(ranges: &mut Vec<DeleteRange>) {
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<DeleteRange> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if r.start <= last.end() => {
                let end = last.end().max(r.end());
                last.len = end - last.start;
            }
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}
