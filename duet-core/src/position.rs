use serde::{Deserialize, Serialize};

use crate::id::ItemId;

/// A cursor anchor that survives concurrent edits.
///
/// `Before(id)` sits immediately left of item `id`, even after `id` has been
/// deleted; `End` always resolves to the end of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelativePosition {
    Before(ItemId),
    End,
}
