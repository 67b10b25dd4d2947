use crate::{Page, PageNumber, PagedItem};

/// Eviction policy and page factory for a pagination manager.
///
/// All methods are called with the manager lock held; implementations must not call back into
/// the manager.
pub trait PageReclaimer<T: PagedItem>: Send {
    /// Picks up to `count_needed` pages to evict from `candidates`.
    ///
    /// The manager never offers the base page, and ignores any returned page that cannot be
    /// reclaimed.
    fn reclaim_pages(
        &mut self,
        candidates: &[&Page<T>],
        count_needed: usize,
        section_context: &str,
    ) -> Vec<PageNumber>;

    fn on_page_touched(&mut self, _page: &Page<T>) {}

    fn on_page_released(&mut self, _page: Page<T>) {}

    fn make_page(&mut self, number: PageNumber, items_per_page: usize) -> Page<T> {
        Page::new(number, items_per_page)
    }
}

/// Evicts the least recently touched pages first.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReclaimOnTouched {
    released: u64,
}

impl ReclaimOnTouched {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages released since creation.
    pub fn released(&self) -> u64 {
        self.released
    }
}

impl<T: PagedItem> PageReclaimer<T> for ReclaimOnTouched {
    fn reclaim_pages(
        &mut self,
        candidates: &[&Page<T>],
        count_needed: usize,
        _section_context: &str,
    ) -> Vec<PageNumber> {
        let mut reclaimable: Vec<&Page<T>> = candidates
            .iter()
            .copied()
            .filter(|p| p.can_reclaim())
            .collect();
        reclaimable.sort_by_key(|p| (p.last_touch(), p.number()));
        reclaimable
            .into_iter()
            .take(count_needed)
            .map(|p| p.number())
            .collect()
    }

    fn on_page_released(&mut self, page: Page<T>) {
        self.released += 1;
        vtrace!(page = page.number(), "ReclaimOnTouched: released");
        drop(page);
    }
}
