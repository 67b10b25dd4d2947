/// Bound for values held in the page cache.
///
/// Besides being cheap to clone and shareable across threads, a cached item must say how two
/// items are compared for `index_of`/`contains`/remove-by-item, and whether a placeholder can
/// absorb fetched data without being swapped out.
pub trait PagedItem: Clone + Send + Sync + 'static {
    /// When `true`, a placeholder that was handed out while its page was loading stays in the page
    /// and the fetched value is folded into it on the UI thread via [`PagedItem::fill_placeholder`].
    ///
    /// When `false`, the page slot is overwritten and a `Replace` change is raised instead.
    const FILLS_IN_PLACE: bool = false;

    fn same_item(&self, other: &Self) -> bool;

    /// Copies the payload of `fetched` into this placeholder.
    fn fill_placeholder(&self, _fetched: &Self) {}
}

macro_rules! impl_paged_item_by_eq {
    ($($ty:ty),* $(,)?) => {
        $(
            impl PagedItem for $ty {
                fn same_item(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_paged_item_by_eq!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, bool, char, String,
);

impl PagedItem for std::sync::Arc<str> {
    fn same_item(&self, other: &Self) -> bool {
        self == other
    }
}
