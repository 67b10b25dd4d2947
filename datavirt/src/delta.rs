use std::collections::BTreeMap;

use crate::PageNumber;

/// How far one page's effective length deviates from the nominal page size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageDelta {
    pub page: PageNumber,
    pub delta: i64,
}

/// Per-page size adjustments left behind by inserts and removals.
///
/// Page `p` holds `page_size + delta(p)` items. A page without an entry has the nominal size;
/// a zero delta is never stored. Only pages at or after the base page carry meaningful deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaLedger {
    deltas: BTreeMap<PageNumber, i64>,
}

impl DeltaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        self.deltas.contains_key(&page)
    }

    pub fn get(&self, page: PageNumber) -> i64 {
        self.deltas.get(&page).copied().unwrap_or(0)
    }

    /// Adds `change` to the delta of `page` and returns the new delta.
    pub fn adjust(&mut self, page: PageNumber, change: i64) -> i64 {
        let next = self.get(page) + change;
        if next == 0 {
            self.deltas.remove(&page);
        } else {
            self.deltas.insert(page, next);
        }
        next
    }

    pub fn remove(&mut self, page: PageNumber) -> Option<i64> {
        self.deltas.remove(&page)
    }

    pub fn clear(&mut self) {
        self.deltas.clear();
    }

    /// Sum of the deltas of pages in `from..to`.
    pub fn sum_between(&self, from: PageNumber, to: PageNumber) -> i64 {
        if from >= to {
            return 0;
        }
        self.deltas.range(from..to).map(|(_, d)| *d).sum()
    }

    /// Summed absolute delta across the ledger.
    pub fn distance(&self) -> u64 {
        self.deltas.values().map(|d| d.unsigned_abs()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = PageDelta> + '_ {
        self.deltas
            .iter()
            .map(|(&page, &delta)| PageDelta { page, delta })
    }

    /// Effective capacity of `page`.
    pub fn page_capacity(&self, page: PageNumber, page_size: usize) -> i64 {
        page_size as i64 + self.get(page)
    }

    /// Logical index of the first item of `page`.
    pub fn page_start(&self, page: PageNumber, base_page: PageNumber, page_size: usize) -> i64 {
        (page - base_page) * page_size as i64 + self.sum_between(base_page, page)
    }

    /// Translates a logical index into `(page, offset)`.
    ///
    /// Starts from the nominal position, then walks over short pages and compensates for the
    /// deltas of every earlier page. Runs of pages without a delta are skipped whole once the
    /// remaining distance exceeds `page_size * jump_threshold`.
    pub fn locate(
        &self,
        index: usize,
        base_page: PageNumber,
        page_size: usize,
        jump_threshold: usize,
    ) -> (PageNumber, usize) {
        let ps = page_size.max(1) as i64;
        let index = index as i64;
        let mut page = index / ps + base_page;
        let mut offset = index % ps;

        if self.deltas.is_empty() {
            return (page, offset as usize);
        }

        let walker = Walker {
            ledger: self,
            page_size: ps,
            jump_at: ps.saturating_mul(jump_threshold.max(1) as i64),
        };

        let adjustment = self.sum_between(base_page, page);

        let here = self.get(page);
        if here < 0 && offset >= ps + here {
            let overflow = offset - (ps + here - 1);
            offset -= overflow;
            (page, offset) = walker.forward(page, offset, overflow);
        }

        if adjustment > 0 {
            (page, offset) = walker.backward(page, offset, adjustment);
        } else if adjustment < 0 {
            (page, offset) = walker.forward(page, offset, -adjustment);
        }

        (page, offset.max(0) as usize)
    }
}

struct Walker<'a> {
    ledger: &'a DeltaLedger,
    page_size: i64,
    jump_at: i64,
}

impl Walker<'_> {
    fn items(&self, page: PageNumber) -> i64 {
        self.page_size + self.ledger.get(page)
    }

    fn forward(&self, mut page: PageNumber, mut offset: i64, mut amount: i64) -> (PageNumber, i64) {
        let ps = self.page_size;
        loop {
            if amount > self.jump_at {
                // Pages from `page` up to the next page with a delta all hold `ps` items.
                let run = match self.ledger.deltas.range(page..).next() {
                    Some((&next, _)) => next - page,
                    None => i64::MAX,
                };
                let jump = (amount / ps).min(run);
                if jump > 0 {
                    page += jump;
                    amount -= jump * ps;
                    continue;
                }
            }

            let items = self.items(page);
            if offset + amount < items {
                return (page, offset + amount);
            }
            amount -= items - offset;
            offset = 0;
            page += 1;
        }
    }

    fn backward(
        &self,
        mut page: PageNumber,
        mut offset: i64,
        mut amount: i64,
    ) -> (PageNumber, i64) {
        let ps = self.page_size;
        loop {
            if amount > self.jump_at && (0..ps).contains(&offset) {
                // Pages strictly between the previous delta page and `page` hold `ps` items.
                let run = match self.ledger.deltas.range(..page).next_back() {
                    Some((&prev, _)) => page - prev - 1,
                    None => i64::MAX,
                };
                let jump = (amount / ps).min(run);
                if jump > 0 {
                    page -= jump;
                    amount -= jump * ps;
                    continue;
                }
            }

            if offset >= amount {
                return (page, offset - amount);
            }
            amount -= offset + 1;
            page -= 1;
            offset = self.items(page) - 1;
        }
    }
}
