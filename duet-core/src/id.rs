use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique identifier of a block.
///
/// `peer` is the replica that created the block, `clock` its position in
/// that replica's own sequence of blocks (0, 1, 2, …). Ordering is
/// `(peer, clock)`, which is also the tie-break order for concurrent inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    pub peer: Uuid,
    pub clock: u64,
}

impl ItemId {
    pub fn new(peer: Uuid, clock: u64) -> Self {
        Self { peer, clock }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_peer_then_clock() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        assert!(ItemId::new(low, 99) < ItemId::new(high, 0));
        assert!(ItemId::new(low, 1) < ItemId::new(low, 2));
    }

    #[test]
    fn test_display() {
        let id = ItemId::new(Uuid::nil(), 7);
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000000:7");
    }
}
