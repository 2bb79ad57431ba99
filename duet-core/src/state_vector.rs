//! Per-peer summary of integrated blocks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::id::ItemId;

/// Maps each peer to the next clock we expect from it.
///
/// A replica only integrates a peer's blocks in clock order, so an entry of
/// `n` means blocks `0..n` of that peer are all present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<Uuid, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for `peer` (0 if the peer is unknown).
    pub fn get(&self, peer: &Uuid) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    /// Raise the entry for `peer` to `clock`. Never lowers an entry.
    pub fn set_max(&mut self, peer: Uuid, clock: u64) {
        let entry = self.0.entry(peer).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether the block `id` is covered by this vector.
    pub fn contains(&self, id: &ItemId) -> bool {
        id.clock < self.get(&id.peer)
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &StateVector) {
        for (peer, clock) in other.iter() {
            self.set_max(*peer, clock);
        }
    }

    /// True if every block covered by `other` is covered by `self`.
    pub fn covers(&self, other: &StateVector) -> bool {
        other.iter().all(|(peer, clock)| self.get(peer) >= clock)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, u64)> {
        self.0.iter().map(|(peer, clock)| (peer, *clock))
    }

    /// Number of peers with at least one integrated block.
    pub fn len(&self) -> usize {
        self.0.values().filter(|c| **c > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of blocks summarized.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub(crate) fn advance(&mut self, peer: Uuid) -> u64 {
        let entry = self.0.entry(peer).or_insert(0);
        let clock = *entry;
        *entry += 1;
        clock
    }
}

impl FromIterator<(Uuid, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (Uuid, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (peer, clock) in iter {
            sv.set_max(peer, clock);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_vector() {
        let sv = StateVector::new();
        assert!(sv.is_empty());
        assert_eq!(sv.get(&Uuid::new_v4()), 0);
        assert!(!sv.contains(&ItemId::new(Uuid::new_v4(), 0)));
    }

    #[test]
    fn test_advance_and_contains() {
        let peer = Uuid::new_v4();
        let mut sv = StateVector::new();

        assert_eq!(sv.advance(peer), 0);
        assert_eq!(sv.advance(peer), 1);
        assert_eq!(sv.get(&peer), 2);
        assert!(sv.contains(&ItemId::new(peer, 1)));
        assert!(!sv.contains(&ItemId::new(peer, 2)));
    }

    #[test]
    fn test_set_max_never_lowers() {
        let peer = Uuid::new_v4();
        let mut sv = StateVector::new();
        sv.set_max(peer, 5);
        sv.set_max(peer, 3);
        assert_eq!(sv.get(&peer), 5);
    }

    #[test]
    fn test_merge_and_covers() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let left: StateVector = [(a, 3), (b, 1)].into_iter().collect();
        let right: StateVector = [(a, 1), (b, 4)].into_iter().collect();

        assert!(!left.covers(&right));
        let mut merged = left.clone();
        merged.merge(&right);
        assert_eq!(merged.get(&a), 3);
        assert_eq!(merged.get(&b), 4);
        assert!(merged.covers(&left));
        assert!(merged.covers(&right));
        assert_eq!(merged.total(), 7);
    }
}
