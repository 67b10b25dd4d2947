use std::time::Instant;

/// Logical page number. Pages below zero appear once sustained prepends move the base page back.
pub type PageNumber = i64;

/// Point in time used for touch recency, wired snapshots and stale-write checks.
pub type Timestamp = Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FetchState {
    /// The page holds provider placeholders and a fetch is in flight.
    Placeholders,
    Fetched,
}

/// A change to the logical sequence, in the shape list controls expect.
#[derive(Clone, Debug)]
pub enum CollectionChange<T> {
    Add {
        items: Vec<T>,
        index: usize,
    },
    /// `item` is `None` when the removed slot was never materialized.
    Remove {
        item: Option<T>,
        index: usize,
    },
    Replace {
        old: Option<T>,
        new: T,
        index: usize,
    },
    Move {
        item: T,
        old_index: usize,
        new_index: usize,
    },
    Reset,
}

impl<T> CollectionChange<T> {
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset)
    }
}

/// Raised when the known item count changes.
///
/// `count` is `None` when the count became unknown and will be fetched again on next access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CountChanged {
    pub count: Option<usize>,
    pub needs_reset: bool,
}
