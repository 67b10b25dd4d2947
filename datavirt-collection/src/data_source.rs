use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use datavirt::{
    AsyncPagedSource, Error, PageNumber, PageSource, PagerConfig, PaginationManager, Result,
    VirtualizationContext,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::{DataItem, VirtualizingCollection};

type FilterFn<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;
type OrderFn<M> = Arc<dyn Fn(&M, &M) -> CmpOrdering + Send + Sync>;

/// Filter and sort order a [`ModelStore`] applies to every read.
///
/// Two queries are the same when they share the same closures, so replacing a query with a clone
/// of itself is not a change.
pub struct Query<M> {
    filter: Option<FilterFn<M>>,
    order: Option<OrderFn<M>>,
}

impl<M> Query<M> {
    pub fn new() -> Self {
        Self {
            filter: None,
            order: None,
        }
    }

    pub fn filter(mut self, filter: impl Fn(&M) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn order_by(mut self, order: impl Fn(&M, &M) -> CmpOrdering + Send + Sync + 'static) -> Self {
        self.order = Some(Arc::new(order));
        self
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    pub fn is_ordered(&self) -> bool {
        self.order.is_some()
    }

    pub fn matches(&self, model: &M) -> bool {
        self.filter.as_ref().is_none_or(|f| f(model))
    }

    pub fn compare(&self, a: &M, b: &M) -> CmpOrdering {
        self.order.as_ref().map_or(CmpOrdering::Equal, |o| o(a, b))
    }

    /// The same ordering with the filter removed.
    pub fn without_filter(&self) -> Self {
        Self {
            filter: None,
            order: self.order.clone(),
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        fn same<F: ?Sized>(a: &Option<Arc<F>>, b: &Option<Arc<F>>) -> bool {
            match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
        }
        same(&self.filter, &other.filter) && same(&self.order, &other.order)
    }
}

impl<M> Clone for Query<M> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            order: self.order.clone(),
        }
    }
}

impl<M> Default for Query<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for Query<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("filtered", &self.has_filter())
            .field("ordered", &self.is_ordered())
            .finish()
    }
}

/// Model persistence behind a [`DataSource`]: a database, a remote API or an in-memory table.
///
/// Every read honours the given query. `models_at` must return exactly `count` models.
pub trait ModelStore<M>: Send + Sync {
    fn count(&self, query: &Query<M>) -> BoxFuture<'static, Result<usize>>;

    fn models_at(
        &self,
        offset: usize,
        count: usize,
        query: &Query<M>,
    ) -> BoxFuture<'static, Result<Vec<M>>>;

    /// Position of `model` in the filtered, ordered sequence.
    fn index_of(&self, model: &M, query: &Query<M>) -> BoxFuture<'static, Result<Option<usize>>>;

    /// Model shown for `index` until its page is fetched.
    fn placeholder(&self, index: usize, page: PageNumber, offset: usize) -> M;

    /// Persists a new model. Returns whether it was stored.
    fn create(&self, model: M) -> BoxFuture<'static, Result<bool>>;

    /// Deletes a model. Returns whether it was removed.
    fn delete(&self, model: &M) -> BoxFuture<'static, Result<bool>>;

    fn on_reset(&self, _count: Option<usize>) {}
}

struct Shared<M> {
    store: Arc<dyn ModelStore<M>>,
    query: RwLock<Query<M>>,
    operations: AtomicUsize,
    initialised: AtomicBool,
}

impl<M> Shared<M> {
    fn query(&self) -> Query<M> {
        self.query.read().clone()
    }
}

/// Counts a store operation as active until dropped.
struct Operation<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> Operation<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serves a model store to the page cache, wrapping every model in a [`DataItem`].
struct StoreAdapter<M> {
    shared: Arc<Shared<M>>,
}

impl<M: Clone + Send + Sync + 'static> AsyncPagedSource<DataItem<M>> for StoreAdapter<M> {
    fn count(&self) -> BoxFuture<'static, Result<usize>> {
        let shared = Arc::clone(&self.shared);
        async move {
            let _op = Operation::start(&shared.operations);
            let query = shared.query();
            let count = shared.store.count(&query).await?;
            shared.initialised.store(true, Ordering::Release);
            Ok(count)
        }
        .boxed()
    }

    fn items_at(&self, offset: usize, count: usize) -> BoxFuture<'static, Result<Vec<DataItem<M>>>> {
        let shared = Arc::clone(&self.shared);
        async move {
            let _op = Operation::start(&shared.operations);
            let query = shared.query();
            let models = shared.store.models_at(offset, count, &query).await?;
            if models.len() != count {
                return Err(Error::ProviderContract {
                    offset,
                    expected: count,
                    actual: models.len(),
                });
            }
            Ok(models.into_iter().map(DataItem::new).collect())
        }
        .boxed()
    }

    fn placeholder(&self, index: usize, page: PageNumber, offset: usize) -> DataItem<M> {
        DataItem::placeholder(self.shared.store.placeholder(index, page, offset))
    }

    fn index_of(&self, item: &DataItem<M>) -> BoxFuture<'static, Result<Option<usize>>> {
        let query = self.shared.query();
        self.shared.store.index_of(&item.item(), &query)
    }

    fn on_reset(&self, count: Option<usize>) {
        self.shared.store.on_reset(count);
    }
}

/// A model store exposed as a virtualizing collection of [`DataItem`]s.
///
/// Reads go through a page cache over the store; `create` and `delete` persist through the store
/// and then patch the cache so the collection stays consistent without a full refetch.
pub struct DataSource<M: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<M>>,
    pager: Arc<PaginationManager<DataItem<M>>>,
    collection: Arc<VirtualizingCollection<DataItem<M>>>,
}

impl<M: Clone + Send + Sync + 'static> DataSource<M> {
    pub fn new(
        ctx: Arc<VirtualizationContext>,
        store: impl ModelStore<M> + 'static,
        config: PagerConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            store: Arc::new(store),
            query: RwLock::new(Query::new()),
            operations: AtomicUsize::new(0),
            initialised: AtomicBool::new(false),
        });
        let adapter = StoreAdapter {
            shared: Arc::clone(&shared),
        };
        let pager = PaginationManager::new(ctx, PageSource::from_async(adapter), config)?;
        let collection = VirtualizingCollection::over_pager(Arc::clone(&pager));
        Ok(Self {
            shared,
            pager,
            collection,
        })
    }

    pub fn collection(&self) -> &Arc<VirtualizingCollection<DataItem<M>>> {
        &self.collection
    }

    pub fn pager(&self) -> &Arc<PaginationManager<DataItem<M>>> {
        &self.pager
    }

    /// Whether a store operation is in progress.
    pub fn is_active(&self) -> bool {
        self.shared.operations.load(Ordering::Acquire) > 0
    }

    /// Whether the count has been read from the store at least once.
    pub fn is_initialised(&self) -> bool {
        self.shared.initialised.load(Ordering::Acquire)
    }

    pub fn query(&self) -> Query<M> {
        self.shared.query()
    }

    /// Replaces the query. With `invalidate`, the cache is dropped so the next read refetches.
    pub fn set_query(&self, query: Query<M>, invalidate: bool) {
        {
            let mut current = self.shared.query.write();
            if current.same_as(&query) {
                return;
            }
            *current = query;
        }
        cdebug!(invalidate, "DataSource::set_query");
        if invalidate {
            self.invalidate();
        }
    }

    /// Drops every cached page and forgets the count.
    pub fn invalidate(&self) {
        self.collection.clear();
    }

    pub async fn count(&self) -> Result<usize> {
        let _op = Operation::start(&self.shared.operations);
        let query = self.shared.query();
        self.shared.store.count(&query).await
    }

    /// Reads models directly from the store, bypassing the cache.
    pub async fn models_at(&self, offset: usize, count: usize) -> Result<Vec<M>> {
        let _op = Operation::start(&self.shared.operations);
        let query = self.shared.query();
        self.shared.store.models_at(offset, count, &query).await
    }

    pub async fn index_of(&self, model: &M) -> Result<Option<usize>> {
        let query = self.shared.query();
        self.shared.store.index_of(model, &query).await
    }

    /// Persists `model` and shows it in the collection at its position in the store.
    ///
    /// An active filter is cleared first so the new model is visible. Returns `None` when the
    /// store declined the model.
    pub async fn create(&self, model: M) -> Result<Option<DataItem<M>>> {
        let _op = Operation::start(&self.shared.operations);
        if self.shared.query.read().has_filter() {
            let cleared = self.shared.query().without_filter();
            self.set_query(cleared, true);
        }
        if !self.shared.store.create(model.clone()).await? {
            return Ok(None);
        }
        let item = DataItem::new(model.clone());
        // With an unknown count the next read fetches everything fresh.
        if self.pager.has_got_count() {
            let index = self.index_of(&model).await?;
            match index {
                Some(index) if index < self.pager.cached_count() => {
                    self.collection.insert(index, item.clone())?;
                }
                _ => {
                    self.collection.push(item.clone())?;
                }
            }
        }
        ctrace!("DataSource::create");
        Ok(Some(item))
    }

    /// Deletes the model behind `item` from the store and removes it from the collection.
    pub async fn delete(&self, item: &DataItem<M>) -> Result<bool> {
        let _op = Operation::start(&self.shared.operations);
        let model = item.item();
        let index = match self.pager.resident_index_of(item) {
            Some(index) => Some(index),
            None => self.index_of(&model).await?,
        };
        if !self.shared.store.delete(&model).await? {
            return Ok(false);
        }
        if let Some(index) = index {
            if self.pager.has_got_count() && index < self.pager.cached_count() {
                self.collection.remove_at(index)?;
            }
        }
        ctrace!(index = ?index, "DataSource::delete");
        Ok(true)
    }
}

impl<M: Clone + Send + Sync + 'static> fmt::Debug for DataSource<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("active", &self.is_active())
            .field("initialised", &self.is_initialised())
            .field("query", &*self.shared.query.read())
            .field("pager", &self.pager)
            .finish_non_exhaustive()
    }
}
