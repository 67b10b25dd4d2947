use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::{
    CollectionChange, CountChanged, EventEmitter, PageNumber, PagedItem, Result, Timestamp,
};

/// A change pushed by an observable source. See [`PagedSource::observe`].
#[derive(Clone, Debug)]
pub enum SourceChange<T> {
    /// Items appended at the end of the source.
    Added(Vec<T>),
    Replaced { index: usize, item: T },
    Removed,
    Moved,
    Reset,
}

/// Sink installed by a pagination manager on an observable source.
pub type SourceSink<T> = Arc<dyn Fn(SourceChange<T>) + Send + Sync>;

/// A synchronous, page-addressable data source.
pub trait PagedSource<T>: Send + Sync {
    fn count(&self) -> Result<usize>;

    /// Returns exactly `count` items starting at `offset`.
    fn items_at(&self, offset: usize, count: usize) -> Result<Vec<T>>;

    fn index_of(&self, _item: &T) -> Result<Option<usize>> {
        Ok(None)
    }

    fn contains(&self, item: &T) -> Result<bool> {
        Ok(self.index_of(item)?.is_some())
    }

    /// Called after the cache was reset. `None` means the count is unknown.
    fn on_reset(&self, _count: Option<usize>) {}

    fn before_reset(&self) {}

    fn editable(&self) -> Option<&dyn EditableSource<T>> {
        None
    }

    /// Installs `sink` if the source reports its own changes. Returns whether it will.
    ///
    /// Edits made through the pagination manager must not be echoed back through the sink.
    fn observe(&self, _sink: SourceSink<T>) -> bool {
        false
    }
}

/// An asynchronous, page-addressable data source.
pub trait AsyncPagedSource<T>: Send + Sync {
    fn count(&self) -> BoxFuture<'static, Result<usize>>;

    /// Resolves to exactly `count` items starting at `offset`.
    fn items_at(&self, offset: usize, count: usize) -> BoxFuture<'static, Result<Vec<T>>>;

    /// Stand-in shown for logical `index` (slot `offset` of `page`) until real data arrives.
    fn placeholder(&self, index: usize, page: PageNumber, offset: usize) -> T;

    fn index_of(&self, item: &T) -> BoxFuture<'static, Result<Option<usize>>>;

    fn contains(&self, item: &T) -> BoxFuture<'static, Result<bool>> {
        self.index_of(item)
            .map(|found| found.map(|index| index.is_some()))
            .boxed()
    }

    fn on_reset(&self, _count: Option<usize>) {}

    fn before_reset(&self) {}

    fn editable(&self) -> Option<&dyn EditableSource<T>> {
        None
    }

    fn observe(&self, _sink: SourceSink<T>) -> bool {
        false
    }
}

/// Persistence hooks a source implements to accept edits made through the cache.
///
/// Each hook runs after the cache itself was updated.
pub trait EditableSource<T>: Send + Sync {
    fn on_append(&self, item: &T, updated_at: Option<Timestamp>) -> Result<()>;

    fn on_insert(&self, index: usize, item: &T, updated_at: Option<Timestamp>) -> Result<()>;

    fn on_replace(
        &self,
        index: usize,
        old: Option<&T>,
        new: &T,
        updated_at: Option<Timestamp>,
    ) -> Result<()>;

    /// `item` is the removed value when its page was resident. Returns the removed value as known
    /// to the source, if any.
    fn on_remove(
        &self,
        index: usize,
        item: Option<&T>,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<T>>;
}

/// Event hub exposed by item sources that notify their consumers.
pub struct SourceEvents<T> {
    pub collection_changed: EventEmitter<CollectionChange<T>>,
    pub count_changed: EventEmitter<CountChanged>,
}

impl<T> SourceEvents<T> {
    pub fn new() -> Self {
        Self {
            collection_changed: EventEmitter::new(),
            count_changed: EventEmitter::new(),
        }
    }
}

impl<T> Default for SourceEvents<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SourceEvents<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceEvents")
            .field("collection_changed", &self.collection_changed)
            .field("count_changed", &self.count_changed)
            .finish()
    }
}

/// Index-addressable items, as consumed by a virtualizing collection.
pub trait ItemSource<T>: Send + Sync {
    fn get_at(&self, index: usize) -> Result<T>;

    /// With `async_ok`, an unknown count may be fetched in the background; the cached value
    /// (possibly 0) is returned meanwhile and a `CountChanged` follows.
    fn count(&self, async_ok: bool) -> Result<usize>;

    /// Fetches the current count from the backing source, bypassing the cache.
    fn count_async(&self) -> BoxFuture<'static, Result<usize>>;

    fn index_of(&self, item: &T) -> Result<Option<usize>>;

    fn contains(&self, item: &T) -> Result<bool>;

    fn on_reset(&self, count: Option<usize>);

    fn before_reset(&self) {}

    fn editable(&self) -> Option<&dyn EditableItemSource<T>> {
        None
    }

    fn events(&self) -> Option<&SourceEvents<T>> {
        None
    }

    /// Whether every edit is already announced through [`Self::events`], so consumers must not
    /// raise their own.
    fn emits_changes(&self) -> bool {
        false
    }
}

/// Index- and item-based editing of an item source.
pub trait EditableItemSource<T>: Send + Sync {
    /// Appends at the end and returns the new index.
    fn append(&self, item: T, updated_at: Option<Timestamp>) -> Result<usize>;

    fn insert(&self, index: usize, item: T, updated_at: Option<Timestamp>) -> Result<()>;

    /// Replaces the item at `index` and returns the previous one when it was known.
    fn replace_at(&self, index: usize, item: T, updated_at: Option<Timestamp>)
    -> Result<Option<T>>;

    /// Replaces `old` with `new` wherever `old` is found; returns its index.
    fn replace_item(&self, old: &T, new: T, updated_at: Option<Timestamp>)
    -> Result<Option<usize>>;

    /// Removes the item at `index`, returning it when it was resident.
    fn remove_at(&self, index: usize, updated_at: Option<Timestamp>) -> Result<Option<T>>;

    /// Removes `item`, returning the index it occupied.
    fn remove_item(&self, item: &T, updated_at: Option<Timestamp>) -> Result<Option<usize>>;
}

/// Index-addressable items served asynchronously.
pub trait AsyncItemSource<T>: Send + Sync {
    fn get_at(&self, index: usize) -> BoxFuture<'static, Result<T>>;

    fn count(&self) -> BoxFuture<'static, Result<usize>>;

    fn placeholder(&self, index: usize) -> T;

    fn index_of(&self, item: &T) -> BoxFuture<'static, Result<Option<usize>>>;

    fn on_reset(&self, _count: Option<usize>) {}
}

/// A service the scheduler periodically asks to release memory.
pub trait ReclaimableService: Send + Sync {
    fn run_claim(&self, section_context: &str);
}

type CountFn = Box<dyn Fn() -> Result<usize> + Send + Sync>;
type ItemsFn<T> = Box<dyn Fn(usize, usize) -> Result<Vec<T>> + Send + Sync>;
type IndexOfFn<T> = Box<dyn Fn(&T) -> Result<Option<usize>> + Send + Sync>;
type ResetFn = Box<dyn Fn(Option<usize>) + Send + Sync>;

/// A synchronous source assembled from closures.
pub struct FnPagedSource<T> {
    count: CountFn,
    items_at: ItemsFn<T>,
    index_of: Option<IndexOfFn<T>>,
    on_reset: Option<ResetFn>,
}

impl<T> FnPagedSource<T> {
    pub fn new(
        count: impl Fn() -> Result<usize> + Send + Sync + 'static,
        items_at: impl Fn(usize, usize) -> Result<Vec<T>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            count: Box::new(count),
            items_at: Box::new(items_at),
            index_of: None,
            on_reset: None,
        }
    }

    pub fn with_index_of(
        mut self,
        index_of: impl Fn(&T) -> Result<Option<usize>> + Send + Sync + 'static,
    ) -> Self {
        self.index_of = Some(Box::new(index_of));
        self
    }

    pub fn with_on_reset(mut self, on_reset: impl Fn(Option<usize>) + Send + Sync + 'static) -> Self {
        self.on_reset = Some(Box::new(on_reset));
        self
    }
}

impl<T: Send + Sync> PagedSource<T> for FnPagedSource<T> {
    fn count(&self) -> Result<usize> {
        (self.count)()
    }

    fn items_at(&self, offset: usize, count: usize) -> Result<Vec<T>> {
        (self.items_at)(offset, count)
    }

    fn index_of(&self, item: &T) -> Result<Option<usize>> {
        match &self.index_of {
            Some(f) => f(item),
            None => Ok(None),
        }
    }

    fn on_reset(&self, count: Option<usize>) {
        if let Some(f) = &self.on_reset {
            f(count);
        }
    }
}

impl<T> fmt::Debug for FnPagedSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPagedSource").finish_non_exhaustive()
    }
}

type PlaceholderFn<T> = Arc<dyn Fn(usize, PageNumber, usize) -> T + Send + Sync>;

/// Serves a synchronous source through the asynchronous interface.
///
/// Each call runs the synchronous method when the returned future is first polled.
pub struct SyncAsAsync<T> {
    inner: Arc<dyn PagedSource<T>>,
    placeholder: PlaceholderFn<T>,
}

impl<T> SyncAsAsync<T> {
    pub fn new(
        inner: Arc<dyn PagedSource<T>>,
        placeholder: impl Fn(usize, PageNumber, usize) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            placeholder: Arc::new(placeholder),
        }
    }
}

impl<T: PagedItem> AsyncPagedSource<T> for SyncAsAsync<T> {
    fn count(&self) -> BoxFuture<'static, Result<usize>> {
        let inner = Arc::clone(&self.inner);
        async move { inner.count() }.boxed()
    }

    fn items_at(&self, offset: usize, count: usize) -> BoxFuture<'static, Result<Vec<T>>> {
        let inner = Arc::clone(&self.inner);
        async move { inner.items_at(offset, count) }.boxed()
    }

    fn placeholder(&self, index: usize, page: PageNumber, offset: usize) -> T {
        (self.placeholder)(index, page, offset)
    }

    fn index_of(&self, item: &T) -> BoxFuture<'static, Result<Option<usize>>> {
        let inner = Arc::clone(&self.inner);
        let item = item.clone();
        async move { inner.index_of(&item) }.boxed()
    }

    fn contains(&self, item: &T) -> BoxFuture<'static, Result<bool>> {
        let inner = Arc::clone(&self.inner);
        let item = item.clone();
        async move { inner.contains(&item) }.boxed()
    }

    fn on_reset(&self, count: Option<usize>) {
        self.inner.on_reset(count);
    }

    fn before_reset(&self) {
        self.inner.before_reset();
    }

    fn editable(&self) -> Option<&dyn EditableSource<T>> {
        self.inner.editable()
    }

    fn observe(&self, sink: SourceSink<T>) -> bool {
        self.inner.observe(sink)
    }
}

/// Serves an asynchronous source through the synchronous interface by blocking on each call.
///
/// Must not be used from inside an async task.
pub struct AsyncAsSync<T> {
    inner: Arc<dyn AsyncPagedSource<T>>,
}

impl<T> AsyncAsSync<T> {
    pub fn new(inner: Arc<dyn AsyncPagedSource<T>>) -> Self {
        Self { inner }
    }
}

impl<T: PagedItem> PagedSource<T> for AsyncAsSync<T> {
    fn count(&self) -> Result<usize> {
        futures::executor::block_on(self.inner.count())
    }

    fn items_at(&self, offset: usize, count: usize) -> Result<Vec<T>> {
        futures::executor::block_on(self.inner.items_at(offset, count))
    }

    fn index_of(&self, item: &T) -> Result<Option<usize>> {
        futures::executor::block_on(self.inner.index_of(item))
    }

    fn contains(&self, item: &T) -> Result<bool> {
        futures::executor::block_on(self.inner.contains(item))
    }

    fn on_reset(&self, count: Option<usize>) {
        self.inner.on_reset(count);
    }

    fn before_reset(&self) {
        self.inner.before_reset();
    }

    fn editable(&self) -> Option<&dyn EditableSource<T>> {
        self.inner.editable()
    }

    fn observe(&self, sink: SourceSink<T>) -> bool {
        self.inner.observe(sink)
    }
}
