use crate::{FetchState, PageDelta, PageNumber};

/// A lightweight, serializable view of one resident page.
///
/// With `feature = "serde"`, this type implements `Serialize`/`Deserialize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageSnapshot {
    pub number: PageNumber,
    pub state: FetchState,
    pub len: usize,
    pub items_per_page: usize,
}

/// A snapshot of the cache bookkeeping of a [`crate::PaginationManager`].
///
/// Useful for diagnostics and for asserting cache shape in tests without reaching into the
/// manager's lock. Pages and in-flight requests are sorted by page number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PagerSnapshot {
    pub base_page: PageNumber,
    pub page_size: usize,
    pub count: usize,
    pub has_got_count: bool,
    pub pages: Vec<PageSnapshot>,
    pub deltas: Vec<PageDelta>,
    pub in_flight: Vec<PageNumber>,
}

impl PagerSnapshot {
    pub fn page(&self, number: PageNumber) -> Option<&PageSnapshot> {
        self.pages.iter().find(|p| p.number == number)
    }

    /// Number of items held across resident pages.
    pub fn resident_items(&self) -> usize {
        self.pages.iter().map(|p| p.len).sum()
    }
}
