use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// The order a read produces rows in.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Sorting {
    /// No ordering guarantee; shards are interleaved for fairness.
    Unordered,
    Ascending,
    Descending,
}

impl Sorting {
    pub fn is_ordered(self) -> bool {
        !matches!(self, Sorting::Unordered)
    }

    pub fn is_descending(self) -> bool {
        matches!(self, Sorting::Descending)
    }

    /// Orient a raw ascending comparison to this sort direction.
    ///
    /// For `Unordered` the ascending order is used; callers that care
    /// should not be comparing in the first place.
    pub fn orient(self, ordering: Ordering) -> Ordering {
        match self {
            Sorting::Descending => ordering.reverse(),
            _ => ordering,
        }
    }
}
