use std::collections::BTreeSet;
use std::time::Instant;

use crate::{FetchState, PageNumber, PagedItem, Timestamp};

/// Decides whether a write stamped `updated_at` may overwrite a page wired at `wired_at`.
pub trait PageExpiryComparer: Send + Sync {
    fn is_update_valid(&self, wired_at: Option<Timestamp>, updated_at: Option<Timestamp>) -> bool;
}

/// Rejects writes stamped before the fetch that produced the current page contents.
///
/// Unstamped writes and pages that were never wired always accept.
#[derive(Clone, Copy, Debug, Default)]
pub struct WiredTimeComparer;

impl PageExpiryComparer for WiredTimeComparer {
    fn is_update_valid(&self, wired_at: Option<Timestamp>, updated_at: Option<Timestamp>) -> bool {
        match (wired_at, updated_at) {
            (Some(wired), Some(updated)) => updated >= wired,
            _ => true,
        }
    }
}

/// A contiguous slice of the logical sequence held in memory.
#[derive(Clone, Debug)]
pub struct Page<T> {
    number: PageNumber,
    items: Vec<T>,
    items_per_page: usize,
    state: FetchState,
    last_touch: Timestamp,
    wired_at: Option<Timestamp>,
    replace_needed: BTreeSet<usize>,
}

impl<T: PagedItem> Page<T> {
    pub fn new(number: PageNumber, items_per_page: usize) -> Self {
        Self {
            number,
            items: Vec::with_capacity(items_per_page),
            items_per_page,
            state: FetchState::Fetched,
            last_touch: Instant::now(),
            wired_at: None,
            replace_needed: BTreeSet::new(),
        }
    }

    pub fn number(&self) -> PageNumber {
        self.number
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Capacity this page was wired with, adjusted by in-page inserts and removals.
    pub fn items_per_page(&self) -> usize {
        self.items_per_page
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn last_touch(&self) -> Timestamp {
        self.last_touch
    }

    pub fn wired_at(&self) -> Option<Timestamp> {
        self.wired_at
    }

    /// A page whose fetch is outstanding must stay resident: its result has nowhere else to land.
    pub fn can_reclaim(&self) -> bool {
        self.state != FetchState::Placeholders
    }

    pub fn is_replace_needed(&self, offset: usize) -> bool {
        self.replace_needed.contains(&offset)
    }

    pub fn touch(&mut self) {
        self.last_touch = Instant::now();
    }

    pub(crate) fn set_placeholders(&mut self, placeholders: Vec<T>) {
        self.items = placeholders;
        self.state = FetchState::Placeholders;
        self.replace_needed.clear();
    }

    pub(crate) fn set_fetched(&mut self, items: Vec<T>, wired_at: Timestamp) {
        self.items = items;
        self.mark_fetched(wired_at);
    }

    pub(crate) fn mark_fetched(&mut self, wired_at: Timestamp) {
        self.state = FetchState::Fetched;
        self.wired_at = Some(wired_at);
        self.replace_needed.clear();
    }

    pub(crate) fn set_wired_at(&mut self, wired_at: Option<Timestamp>) {
        self.wired_at = wired_at;
    }

    fn is_safe_to_update(
        &self,
        comparer: Option<&dyn PageExpiryComparer>,
        updated_at: Option<Timestamp>,
    ) -> bool {
        comparer.is_none_or(|c| c.is_update_valid(self.wired_at, updated_at))
    }

    /// Adds `item` at the tail. Returns `None` when the write is stale.
    pub fn append(
        &mut self,
        item: T,
        updated_at: Option<Timestamp>,
        comparer: Option<&dyn PageExpiryComparer>,
    ) -> Option<usize> {
        if !self.is_safe_to_update(comparer, updated_at) {
            return None;
        }
        self.items.push(item);
        self.touch();
        Some(self.items.len() - 1)
    }

    /// Reads the item at `offset`. While placeholders are showing, remembers that whoever reads
    /// the slot is holding a placeholder that must be replaced once real data arrives.
    pub fn get_at(&mut self, offset: usize) -> Option<T> {
        let item = self.items.get(offset).cloned()?;
        if self.state == FetchState::Placeholders {
            self.replace_needed.insert(offset);
        }
        self.touch();
        Some(item)
    }

    /// Reads without touching or recording a pending replacement.
    pub fn peek(&self, offset: usize) -> Option<&T> {
        self.items.get(offset)
    }

    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.items.iter().position(|it| it.same_item(item))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Inserts at `offset`, or appends when `offset` is past the end. Returns `false` when stale.
    pub fn insert_at(
        &mut self,
        offset: usize,
        item: T,
        updated_at: Option<Timestamp>,
        comparer: Option<&dyn PageExpiryComparer>,
    ) -> bool {
        if !self.is_safe_to_update(comparer, updated_at) {
            return false;
        }
        if offset < self.items.len() {
            self.items.insert(offset, item);
            self.replace_needed = shift_offsets(&self.replace_needed, offset, 1);
        } else {
            self.items.push(item);
        }
        self.items_per_page += 1;
        self.touch();
        true
    }

    /// Removes and returns the item at `offset`. Returns `None` when stale or out of range.
    pub fn remove_at(
        &mut self,
        offset: usize,
        updated_at: Option<Timestamp>,
        comparer: Option<&dyn PageExpiryComparer>,
    ) -> Option<T> {
        if offset >= self.items.len() || !self.is_safe_to_update(comparer, updated_at) {
            return None;
        }
        let removed = self.items.remove(offset);
        self.replace_needed.remove(&offset);
        self.replace_needed = shift_offsets(&self.replace_needed, offset, -1);
        self.items_per_page = self.items_per_page.saturating_sub(1);
        self.touch();
        Some(removed)
    }

    /// Overwrites the item at `offset` and returns the previous value.
    /// Returns `None` when stale or out of range.
    pub fn replace_at(
        &mut self,
        offset: usize,
        item: T,
        updated_at: Option<Timestamp>,
        comparer: Option<&dyn PageExpiryComparer>,
    ) -> Option<T> {
        if offset >= self.items.len() || !self.is_safe_to_update(comparer, updated_at) {
            return None;
        }
        let old = std::mem::replace(&mut self.items[offset], item);
        self.touch();
        Some(old)
    }

    /// Moves up to `count` items off the front of the page.
    pub(crate) fn drain_front(&mut self, count: usize) -> Vec<T> {
        let n = count.min(self.items.len());
        let moved: Vec<T> = self.items.drain(..n).collect();
        self.replace_needed = shift_offsets(&self.replace_needed, 0, -(n as i64));
        self.items_per_page = self.items_per_page.saturating_sub(n);
        moved
    }
}

fn shift_offsets(set: &BTreeSet<usize>, from: usize, by: i64) -> BTreeSet<usize> {
    set.iter()
        .filter_map(|&o| {
            if o < from {
                Some(o)
            } else {
                usize::try_from(o as i64 + by).ok()
            }
        })
        .collect()
}
