use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::scheduler::ReclaimPages;
use crate::state::{PageSnapshot, PagerSnapshot};
use crate::{
    AsyncPagedSource, CancelToken, CollectionChange, CountChanged, DeltaLedger, EditableItemSource,
    EditableSource, Error, FetchState, ItemSource, Page, PageDelta, PageExpiryComparer, PageNumber,
    PageReclaimer, PagedItem, PagedSource, PagerConfig, ReclaimOnTouched, ReclaimableService,
    Result, SourceChange, SourceEvents, SourceSink, Timestamp, VirtualizationContext,
};

/// The backing source of a pagination manager: synchronous or asynchronous, never both.
pub enum PageSource<T> {
    Sync(Arc<dyn PagedSource<T>>),
    Async(Arc<dyn AsyncPagedSource<T>>),
}

impl<T> PageSource<T> {
    pub fn from_sync(source: impl PagedSource<T> + 'static) -> Self {
        Self::Sync(Arc::new(source))
    }

    pub fn from_async(source: impl AsyncPagedSource<T> + 'static) -> Self {
        Self::Async(Arc::new(source))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    fn editable(&self) -> Option<&dyn EditableSource<T>> {
        match self {
            Self::Sync(s) => s.editable(),
            Self::Async(s) => s.editable(),
        }
    }

    fn observe(&self, sink: SourceSink<T>) -> bool {
        match self {
            Self::Sync(s) => s.observe(sink),
            Self::Async(s) => s.observe(sink),
        }
    }

    fn on_reset(&self, count: Option<usize>) {
        match self {
            Self::Sync(s) => s.on_reset(count),
            Self::Async(s) => s.on_reset(count),
        }
    }

    fn before_reset(&self) {
        match self {
            Self::Sync(s) => s.before_reset(),
            Self::Async(s) => s.before_reset(),
        }
    }

    fn count_blocking(&self) -> Result<usize> {
        match self {
            Self::Sync(s) => s.count(),
            Self::Async(s) => futures::executor::block_on(s.count()),
        }
    }
}

impl<T> Clone for PageSource<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(s) => Self::Sync(Arc::clone(s)),
            Self::Async(s) => Self::Async(Arc::clone(s)),
        }
    }
}

impl<T> fmt::Debug for PageSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("PageSource::Sync(..)"),
            Self::Async(_) => f.write_str("PageSource::Async(..)"),
        }
    }
}

/// Folds a fetched value into a placeholder that is already on screen.
#[derive(Clone, Debug)]
pub struct PlaceholderReplace<T> {
    pub placeholder: T,
    pub fetched: T,
}

impl<T: PagedItem> PlaceholderReplace<T> {
    pub fn apply(&self) {
        self.placeholder.fill_placeholder(&self.fetched);
    }
}

#[derive(Debug)]
struct FetchPlan {
    page: PageNumber,
    start: usize,
    size: usize,
    token: CancelToken,
}

enum FetchApply<T> {
    Applied {
        fills: Vec<PlaceholderReplace<T>>,
        changes: Vec<CollectionChange<T>>,
    },
    Skipped,
    Refetch(FetchPlan),
}

enum Write<T> {
    Applied(T),
    Stale,
}

struct PagerState<T: PagedItem> {
    pages: BTreeMap<PageNumber, Page<T>>,
    deltas: DeltaLedger,
    base_page: PageNumber,
    page_size: usize,
    requests: HashMap<PageNumber, CancelToken>,
    count_request: Option<CancelToken>,
    local_count: usize,
    has_got_count: bool,
    reclaimer: Box<dyn PageReclaimer<T>>,
}

impl<T: PagedItem> PagerState<T> {
    fn locate(&self, index: usize, jump_threshold: usize) -> (PageNumber, usize) {
        self.deltas
            .locate(index, self.base_page, self.page_size, jump_threshold)
    }

    fn page_start(&self, page: PageNumber) -> usize {
        self.deltas
            .page_start(page, self.base_page, self.page_size)
            .max(0) as usize
    }

    /// Number of items `page` holds given the ledger and the known count.
    fn page_len(&self, page: PageNumber, start: usize) -> usize {
        let capacity = self.deltas.page_capacity(page, self.page_size);
        let remaining = self.local_count as i64 - start as i64;
        capacity.min(remaining).max(0) as usize
    }

    fn touch(&mut self, page: PageNumber) {
        if let Some(p) = self.pages.get(&page) {
            self.reclaimer.on_page_touched(p);
        }
    }

    fn release_page(&mut self, page: PageNumber) {
        if let Some(p) = self.pages.remove(&page) {
            self.reclaimer.on_page_released(p);
        }
    }

    fn start_page_request(&mut self, page: PageNumber) -> CancelToken {
        let token = CancelToken::new();
        if let Some(prev) = self.requests.insert(page, token.clone()) {
            prev.cancel();
        }
        token
    }

    fn cancel_page_request(&mut self, page: PageNumber) {
        if let Some(token) = self.requests.remove(&page) {
            token.cancel();
        }
        self.release_if_loading(page);
    }

    fn remove_page_request(&mut self, page: PageNumber, token: &CancelToken) {
        if self.requests.get(&page).is_some_and(|t| t.same_as(token)) {
            self.requests.remove(&page);
        }
    }

    /// Clears the request of a fetch that will never apply. A page left holding placeholders
    /// with nothing in flight is released so the next access wires it again.
    fn abandon_request(&mut self, page: PageNumber, token: &CancelToken) {
        self.remove_page_request(page, token);
        self.release_if_loading(page);
    }

    fn release_if_loading(&mut self, page: PageNumber) {
        let stranded = !self.requests.contains_key(&page)
            && self
                .pages
                .get(&page)
                .is_some_and(|p| p.state() == FetchState::Placeholders);
        if stranded {
            self.release_page(page);
        }
    }

    fn cancel_all_requests(&mut self) {
        let pages: Vec<PageNumber> = self.requests.keys().copied().collect();
        for (_, token) in self.requests.drain() {
            token.cancel();
        }
        for page in pages {
            self.release_if_loading(page);
        }
    }

    fn drop_all_deltas_and_pages(&mut self) {
        self.deltas.clear();
        let numbers: Vec<PageNumber> = self.pages.keys().copied().collect();
        for number in numbers {
            self.release_page(number);
        }
        self.base_page = 0;
        self.cancel_all_requests();
    }

    /// First resident occurrence of `item`, scanning pages in logical order.
    fn find_resident(&self, item: &T) -> Option<(PageNumber, usize)> {
        self.pages
            .iter()
            .find_map(|(&number, p)| p.index_of(item).map(|offset| (number, offset)))
    }
}

/// Builder for [`PaginationManager`].
pub struct PagerBuilder<T: PagedItem> {
    ctx: Arc<VirtualizationContext>,
    source: PageSource<T>,
    config: PagerConfig,
    reclaimer: Option<Box<dyn PageReclaimer<T>>>,
    comparer: Option<Arc<dyn PageExpiryComparer>>,
    register_reclaim: bool,
}

impl<T: PagedItem> PagerBuilder<T> {
    pub fn config(mut self, config: PagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reclaimer(mut self, reclaimer: impl PageReclaimer<T> + 'static) -> Self {
        self.reclaimer = Some(Box::new(reclaimer));
        self
    }

    pub fn expiry_comparer(mut self, comparer: impl PageExpiryComparer + 'static) -> Self {
        self.comparer = Some(Arc::new(comparer));
        self
    }

    /// Whether to queue a periodic [`ReclaimPages`] action on the context scheduler.
    /// Enabled by default.
    pub fn register_reclaim(mut self, register: bool) -> Self {
        self.register_reclaim = register;
        self
    }

    pub fn build(self) -> Result<Arc<PaginationManager<T>>> {
        self.config.validate()?;
        let Self {
            ctx,
            source,
            config,
            reclaimer,
            comparer,
            register_reclaim,
        } = self;

        let reclaimer = reclaimer.unwrap_or_else(|| Box::new(ReclaimOnTouched::new()));
        let page_size = config.page_size;

        let pager = Arc::new_cyclic(|me: &Weak<PaginationManager<T>>| {
            let sink_target = me.clone();
            let sink: SourceSink<T> = Arc::new(move |change| {
                if let Some(pager) = sink_target.upgrade() {
                    pager.on_source_changed(change);
                }
            });
            let observable = source.observe(sink);

            PaginationManager {
                me: me.clone(),
                ctx,
                source,
                config,
                comparer,
                observable,
                state: Mutex::new(PagerState {
                    pages: BTreeMap::new(),
                    deltas: DeltaLedger::new(),
                    base_page: 0,
                    page_size,
                    requests: HashMap::new(),
                    count_request: None,
                    local_count: 0,
                    has_got_count: false,
                    reclaimer,
                }),
                tasks: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                events: SourceEvents::new(),
            }
        });

        if register_reclaim {
            let weak = Arc::downgrade(&pager);
            let target: Weak<dyn ReclaimableService> = weak;
            pager.ctx.add_action(Arc::new(ReclaimPages::new(
                target,
                pager.config.section_context.clone(),
                pager.config.reclaim_interval,
            )));
        }

        vdebug!(
            page_size,
            max_pages = pager.config.max_pages,
            is_async = pager.source.is_async(),
            observable = pager.observable,
            "PaginationManager::build"
        );
        Ok(pager)
    }
}

/// The page cache.
///
/// Owns the page map, the delta ledger, the base page, the outstanding fetch tokens and the
/// count, all behind one lock. Index translation, page wiring and every edit happen under that
/// lock; provider futures are awaited outside of it.
pub struct PaginationManager<T: PagedItem> {
    me: Weak<Self>,
    ctx: Arc<VirtualizationContext>,
    source: PageSource<T>,
    config: PagerConfig,
    comparer: Option<Arc<dyn PageExpiryComparer>>,
    observable: bool,
    state: Mutex<PagerState<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    failures: Mutex<Vec<Error>>,
    events: SourceEvents<T>,
}

impl<T: PagedItem> PaginationManager<T> {
    pub fn builder(ctx: Arc<VirtualizationContext>, source: PageSource<T>) -> PagerBuilder<T> {
        PagerBuilder {
            ctx,
            source,
            config: PagerConfig::default(),
            reclaimer: None,
            comparer: None,
            register_reclaim: true,
        }
    }

    pub fn new(
        ctx: Arc<VirtualizationContext>,
        source: PageSource<T>,
        config: PagerConfig,
    ) -> Result<Arc<Self>> {
        Self::builder(ctx, source).config(config).build()
    }

    pub fn context(&self) -> &Arc<VirtualizationContext> {
        &self.ctx
    }

    pub fn config(&self) -> &PagerConfig {
        &self.config
    }

    pub fn events(&self) -> &SourceEvents<T> {
        &self.events
    }

    /// Whether the backing source pushes its own changes into the cache.
    pub fn is_observable(&self) -> bool {
        self.observable
    }

    pub fn page_size(&self) -> usize {
        self.state.lock().page_size
    }

    /// Changes the page size. Every page and delta is dropped.
    pub fn set_page_size(&self, page_size: usize) -> Result<()> {
        if page_size == 0 {
            return Err(Error::InvalidConfig("page_size must be at least 1".into()));
        }
        let mut st = self.state.lock();
        if st.page_size != page_size {
            st.drop_all_deltas_and_pages();
            st.page_size = page_size;
            vdebug!(page_size, "PaginationManager::set_page_size");
        }
        Ok(())
    }

    pub fn base_page(&self) -> PageNumber {
        self.state.lock().base_page
    }

    pub fn has_got_count(&self) -> bool {
        self.state.lock().has_got_count
    }

    /// Cached count, without touching the source.
    pub fn cached_count(&self) -> usize {
        self.state.lock().local_count
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn page_state(&self, page: PageNumber) -> Option<FetchState> {
        self.state.lock().pages.get(&page).map(|p| p.state())
    }

    pub fn deltas(&self) -> Vec<PageDelta> {
        self.state.lock().deltas.iter().collect()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Translates a logical index into `(page, offset)` under the current ledger.
    pub fn calculate_from_index(&self, index: usize) -> (PageNumber, usize) {
        let st = self.state.lock();
        st.locate(index, self.config.step_to_jump_threshold)
    }

    pub fn snapshot(&self) -> PagerSnapshot {
        let st = self.state.lock();
        let mut pages: Vec<PageSnapshot> = st
            .pages
            .values()
            .map(|p| PageSnapshot {
                number: p.number(),
                state: p.state(),
                len: p.len(),
                items_per_page: p.items_per_page(),
            })
            .collect();
        pages.sort_by_key(|p| p.number);
        let mut in_flight: Vec<PageNumber> = st.requests.keys().copied().collect();
        in_flight.sort_unstable();
        PagerSnapshot {
            base_page: st.base_page,
            page_size: st.page_size,
            count: st.local_count,
            has_got_count: st.has_got_count,
            pages,
            deltas: st.deltas.iter().collect(),
            in_flight,
        }
    }

    /// Returns the known count, fetching it when unknown.
    ///
    /// With `async_ok` and an asynchronous source, an unknown count is requested in the background:
    /// the cached value is returned meanwhile and a `CountChanged` is raised on the UI thread once
    /// it arrives.
    pub fn count(&self, async_ok: bool) -> Result<usize> {
        {
            let mut st = self.state.lock();
            if st.has_got_count {
                return Ok(st.local_count);
            }
            if async_ok && self.source.is_async() {
                if st.count_request.is_none() {
                    let token = CancelToken::new();
                    st.count_request = Some(token.clone());
                    self.spawn_count(token);
                }
                return Ok(st.local_count);
            }
        }
        self.ensure_count()?;
        Ok(self.state.lock().local_count)
    }

    /// Fetches the count synchronously when unknown. Returns whether a fetch happened.
    fn ensure_count(&self) -> Result<bool> {
        if self.state.lock().has_got_count {
            return Ok(false);
        }
        let count = self.source.count_blocking()?;
        let mut st = self.state.lock();
        if st.has_got_count {
            return Ok(false);
        }
        st.local_count = count;
        st.has_got_count = true;
        if let Some(token) = st.count_request.take() {
            token.cancel();
        }
        vdebug!(count, "PaginationManager: count fetched");
        Ok(true)
    }

    fn spawn_count(&self, token: CancelToken) {
        let (Some(me), PageSource::Async(source)) = (self.me.upgrade(), &self.source) else {
            return;
        };
        let fut = source.count();
        let handle = self.ctx.spawn(async move {
            let result = fut.await;
            if let Err(err) = me.complete_count(token, result).await {
                vwarn!(error = %err, "PaginationManager: count fetch failed");
                me.failures.lock().push(err);
            }
        });
        self.track(handle);
    }

    async fn complete_count(&self, token: CancelToken, result: Result<usize>) -> Result<()> {
        let count = match result {
            Ok(count) => count,
            Err(err) => {
                let mut st = self.state.lock();
                if st.count_request.as_ref().is_some_and(|t| t.same_as(&token)) {
                    st.count_request = None;
                }
                return Err(err);
            }
        };
        if !self.apply_count(&token, count) {
            return Ok(());
        }
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        self.ctx
            .run_on_ui(move || {
                me.events.count_changed.emit(&CountChanged {
                    count: Some(count),
                    needs_reset: true,
                });
            })
            .await;
        Ok(())
    }

    fn apply_count(&self, token: &CancelToken, count: usize) -> bool {
        let mut st = self.state.lock();
        if token.is_cancelled() {
            return false;
        }
        if st.count_request.as_ref().is_some_and(|t| t.same_as(token)) {
            st.count_request = None;
        }
        st.local_count = count;
        st.has_got_count = true;
        vdebug!(count, "PaginationManager: count arrived");
        true
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Waits for every in-flight fetch and count request, including ones they trigger.
    ///
    /// Returns the first provider failure recorded since the last call.
    pub async fn settle(&self) -> Result<()> {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(_err) = handle.await {
                    vwarn!(error = %_err, "PaginationManager: background task aborted");
                }
            }
        }
        match self.failures.lock().drain(..).next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns the item at `index`, wiring its page first if needed.
    ///
    /// With an asynchronous source an unwired page is filled with placeholders and fetched in the
    /// background; the placeholder is returned immediately.
    pub fn get_at(&self, index: usize) -> Result<T> {
        self.ensure_count()?;
        let threshold = self.config.step_to_jump_threshold;
        let (item, plan, page, offset) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if index >= st.local_count {
                return Err(Error::IndexOutOfRange {
                    index,
                    count: st.local_count,
                });
            }
            let (page, offset) = st.locate(index, threshold);
            let plan = if st.pages.contains_key(&page) {
                None
            } else {
                self.wire_page(st, page)?
            };
            let item = st.pages.get_mut(&page).and_then(|p| p.get_at(offset));
            st.touch(page);
            (item, plan, page, offset)
        };

        if let Some(plan) = plan {
            self.spawn_fetch(plan);
        }

        match item {
            Some(item) => Ok(item),
            None => {
                vwarn!(index, page, offset, "PaginationManager: slot missing; resetting");
                self.on_reset(None);
                Err(Error::Inconsistent { page, offset })
            }
        }
    }

    fn wire_page(&self, st: &mut PagerState<T>, page: PageNumber) -> Result<Option<FetchPlan>> {
        let start = st.page_start(page);
        let size = st.page_len(page, start);
        match &self.source {
            PageSource::Sync(source) => {
                let items = source.items_at(start, size)?;
                if items.len() != size {
                    vwarn!(page, expected = size, actual = items.len(), "provider contract violated");
                    return Err(Error::ProviderContract {
                        offset: start,
                        expected: size,
                        actual: items.len(),
                    });
                }
                let mut p = st.reclaimer.make_page(page, size);
                p.set_fetched(items, Instant::now());
                st.pages.insert(page, p);
                vtrace!(page, start, size, "PaginationManager: page wired");
                Ok(None)
            }
            PageSource::Async(source) => {
                let placeholders: Vec<T> = (0..size)
                    .map(|offset| source.placeholder(start + offset, page, offset))
                    .collect();
                let mut p = st.reclaimer.make_page(page, size);
                p.set_placeholders(placeholders);
                st.pages.insert(page, p);
                let token = st.start_page_request(page);
                vtrace!(page, start, size, "PaginationManager: placeholders wired");
                Ok(Some(FetchPlan {
                    page,
                    start,
                    size,
                    token,
                }))
            }
        }
    }

    fn spawn_fetch(&self, plan: FetchPlan) {
        let (Some(me), PageSource::Async(source)) = (self.me.upgrade(), &self.source) else {
            return;
        };
        vdebug!(page = plan.page, start = plan.start, size = plan.size, "fetch: start");
        let fut = source.items_at(plan.start, plan.size);
        let handle = self.ctx.spawn(async move {
            let result = fut.await;
            if let Err(err) = me.complete_fetch(plan, result).await {
                vwarn!(error = %err, "fetch: failed");
                me.failures.lock().push(err);
            }
        });
        self.track(handle);
    }

    async fn complete_fetch(&self, plan: FetchPlan, result: Result<Vec<T>>) -> Result<()> {
        let page = plan.page;
        let token = plan.token.clone();
        let items = match result {
            Ok(items) => items,
            Err(err) => {
                self.state.lock().abandon_request(page, &token);
                return Err(err);
            }
        };
        if items.len() != plan.size {
            self.state.lock().abandon_request(page, &token);
            vwarn!(page, expected = plan.size, actual = items.len(), "provider contract violated");
            return Err(Error::ProviderContract {
                offset: plan.start,
                expected: plan.size,
                actual: items.len(),
            });
        }

        match self.apply_fetch(&plan, items) {
            FetchApply::Skipped => {
                vdebug!(page, "fetch: cancelled");
                Ok(())
            }
            FetchApply::Refetch(next) => {
                vdebug!(page, size = next.size, "fetch: page changed while loading; refetching");
                self.spawn_fetch(next);
                Ok(())
            }
            FetchApply::Applied { fills, changes } => {
                if !fills.is_empty() || !changes.is_empty() {
                    if let Some(me) = self.me.upgrade() {
                        let ui_token = token.clone();
                        self.ctx
                            .run_on_ui(move || {
                                if ui_token.is_cancelled() {
                                    return;
                                }
                                for fill in &fills {
                                    fill.apply();
                                }
                                for change in &changes {
                                    me.events.collection_changed.emit(change);
                                }
                            })
                            .await;
                    }
                }
                self.state.lock().remove_page_request(page, &token);
                vdebug!(page, "fetch: applied");
                Ok(())
            }
        }
    }

    fn apply_fetch(&self, plan: &FetchPlan, items: Vec<T>) -> FetchApply<T> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let page = plan.page;
        if plan.token.is_cancelled() {
            st.abandon_request(page, &plan.token);
            return FetchApply::Skipped;
        }
        let first_index = st.page_start(page);
        let Some(p) = st.pages.get_mut(&page) else {
            st.remove_page_request(page, &plan.token);
            return FetchApply::Skipped;
        };
        if p.len() != plan.size {
            return FetchApply::Refetch(FetchPlan {
                page,
                start: first_index,
                size: p.len(),
                token: plan.token.clone(),
            });
        }

        let now = Instant::now();
        p.set_wired_at(Some(now));
        let mut fills = Vec::new();
        let mut changes = Vec::new();
        let mut cancelled = false;
        for (offset, item) in items.into_iter().enumerate() {
            if plan.token.is_cancelled() {
                cancelled = true;
                break;
            }
            if !p.is_replace_needed(offset) {
                p.replace_at(offset, item, None, None);
                continue;
            }
            if T::FILLS_IN_PLACE {
                if let Some(placeholder) = p.peek(offset).cloned() {
                    fills.push(PlaceholderReplace {
                        placeholder,
                        fetched: item,
                    });
                }
            } else {
                let old = p.replace_at(offset, item.clone(), None, None);
                changes.push(CollectionChange::Replace {
                    old,
                    new: item,
                    index: first_index + offset,
                });
            }
        }
        if cancelled {
            st.abandon_request(page, &plan.token);
            return FetchApply::Skipped;
        }
        p.mark_fetched(now);
        FetchApply::Applied { fills, changes }
    }

    /// Cancels the in-flight fetch of `page`, if any.
    pub fn cancel_page_request(&self, page: PageNumber) {
        self.state.lock().cancel_page_request(page);
    }

    pub fn cancel_all_requests(&self) {
        let mut st = self.state.lock();
        st.cancel_all_requests();
        if let Some(token) = st.count_request.take() {
            token.cancel();
        }
    }

    /// Drops every page and delta; the next access re-fetches from the source.
    pub fn drop_all_deltas_and_pages(&self) {
        self.state.lock().drop_all_deltas_and_pages();
    }

    /// Evicts pages until at most `max_pages` remain, never the base page nor a loading page.
    pub fn run_claim(&self, section_context: &str) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let needed = st.pages.len().saturating_sub(self.config.max_pages);
        if needed == 0 {
            return;
        }
        let base = st.base_page;
        let victims = {
            let candidates: Vec<&Page<T>> = st
                .pages
                .values()
                .filter(|p| p.number() != base && p.can_reclaim())
                .collect();
            st.reclaimer
                .reclaim_pages(&candidates, needed, section_context)
        };

        let mut released = 0usize;
        for number in victims {
            if released == needed {
                break;
            }
            if number == base || !st.pages.get(&number).is_some_and(|p| p.can_reclaim()) {
                continue;
            }
            st.release_page(number);
            released += 1;
        }
        vdebug!(needed, released, resident = st.pages.len(), "PaginationManager::run_claim");
    }

    pub fn before_reset(&self) {
        self.source.before_reset();
    }

    /// Cancels all fetches and drops the cache. `None` marks the count unknown so the next read
    /// fetches it again.
    pub fn on_reset(&self, count: Option<usize>) {
        {
            let mut st = self.state.lock();
            st.drop_all_deltas_and_pages();
            if let Some(token) = st.count_request.take() {
                token.cancel();
            }
            match count {
                Some(count) => {
                    st.local_count = count;
                    st.has_got_count = true;
                }
                None => {
                    st.local_count = 0;
                    st.has_got_count = false;
                }
            }
        }
        vdebug!(count = ?count, "PaginationManager::on_reset");
        self.source.on_reset(count);
        self.events.count_changed.emit(&CountChanged {
            count,
            needs_reset: true,
        });
    }

    fn adjust_delta(&self, st: &mut PagerState<T>, page: PageNumber, change: i64) {
        if !st.deltas.contains(page)
            && self
                .config
                .max_deltas
                .is_some_and(|max| st.deltas.len() >= max)
        {
            vdebug!(page, "PaginationManager: delta ledger full; dropping cache");
            st.drop_all_deltas_and_pages();
            return;
        }
        st.deltas.adjust(page, change);
        if self
            .config
            .max_distance
            .is_some_and(|max| st.deltas.distance() > max as u64)
        {
            vdebug!(page, "PaginationManager: delta distance exceeded; dropping cache");
            st.drop_all_deltas_and_pages();
        }
    }

    /// Moves a page worth of items off the front of the base page into a new preceding page.
    fn rebalance_base(&self, st: &mut PagerState<T>) {
        let base = st.base_page;
        let ps = st.page_size;
        let front_number = base - 1;
        st.release_page(front_number);

        match st.pages.get(&base).map(|p| p.state()) {
            Some(FetchState::Fetched) => {
                let (moved, wired_at) = match st.pages.get_mut(&base) {
                    Some(p) => (p.drain_front(ps), p.wired_at()),
                    None => (Vec::new(), None),
                };
                let mut front = st.reclaimer.make_page(front_number, ps);
                front.set_fetched(moved, Instant::now());
                front.set_wired_at(wired_at);
                st.pages.insert(front_number, front);
            }
            Some(FetchState::Placeholders) => {
                st.cancel_page_request(base);
                st.release_page(base);
            }
            None => {}
        }

        st.deltas.adjust(base, -(ps as i64));
        st.base_page = front_number;
        vdebug!(base_page = front_number, "PaginationManager: base page rebalanced");
    }

    fn remove_located(
        &self,
        st: &mut PagerState<T>,
        page: PageNumber,
        offset: usize,
        updated_at: Option<Timestamp>,
    ) -> Write<Option<T>> {
        let removed = match st.pages.get_mut(&page) {
            Some(p) => match p.remove_at(offset, updated_at, self.comparer.as_deref()) {
                Some(item) => Some(item),
                None => return Write::Stale,
            },
            None => None,
        };
        st.touch(page);
        self.adjust_delta(st, page, -1);

        if page == st.base_page && st.deltas.page_capacity(page, st.page_size) <= 0 {
            st.deltas.remove(page);
            st.cancel_page_request(page);
            st.release_page(page);
            st.base_page += 1;
            vdebug!(base_page = st.base_page, "PaginationManager: base page emptied");
        }
        st.local_count = st.local_count.saturating_sub(1);
        Write::Applied(removed)
    }

    fn append_internal(
        &self,
        item: T,
        updated_at: Option<Timestamp>,
        already_in_source: bool,
        create_page: bool,
    ) -> Result<Option<usize>> {
        let fresh = self.ensure_count()?;
        let threshold = self.config.step_to_jump_threshold;
        let index = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if fresh && already_in_source {
                st.local_count = st.local_count.saturating_sub(1);
            }
            let index = st.local_count;
            let (page, offset) = st.locate(index, threshold);
            let page_size = st.page_size;
            let tail_len = st.pages.get(&page).map(|p| p.len());
            match tail_len {
                Some(len) if len == offset => {
                    let appended = st.pages.get_mut(&page).and_then(|p| {
                        p.append(item.clone(), updated_at, self.comparer.as_deref())
                    });
                    if appended.is_none() {
                        vdebug!(page, "PaginationManager: stale append dropped");
                        return Ok(None);
                    }
                    st.touch(page);
                }
                Some(_) => {
                    st.cancel_page_request(page);
                    st.release_page(page);
                }
                None if create_page && offset == 0 => {
                    let mut p = st.reclaimer.make_page(page, page_size);
                    p.set_fetched(vec![item.clone()], Instant::now());
                    st.pages.insert(page, p);
                }
                None => {}
            }
            st.local_count += 1;
            index
        };

        if !already_in_source {
            if let Some(editable) = self.source.editable() {
                editable.on_append(&item, updated_at)?;
            }
        }
        self.events.collection_changed.emit(&CollectionChange::Add {
            items: vec![item],
            index,
        });
        Ok(Some(index))
    }

    /// Appends at the end. Returns the new index, or `None` when the write was stale.
    pub fn append(&self, item: T, updated_at: Option<Timestamp>) -> Result<Option<usize>> {
        self.append_internal(item, updated_at, false, false)
    }

    pub fn insert(&self, index: usize, item: T, updated_at: Option<Timestamp>) -> Result<()> {
        self.ensure_count()?;
        let threshold = self.config.step_to_jump_threshold;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if index > st.local_count {
                return Err(Error::IndexOutOfRange {
                    index,
                    count: st.local_count,
                });
            }
            let (page, offset) = st.locate(index, threshold);
            if let Some(p) = st.pages.get_mut(&page) {
                if !p.insert_at(offset, item.clone(), updated_at, self.comparer.as_deref()) {
                    vdebug!(page, offset, "PaginationManager: stale insert dropped");
                    return Ok(());
                }
            }
            st.touch(page);
            self.adjust_delta(st, page, 1);

            let limit = 2 * st.page_size as i64;
            if page == st.base_page && st.deltas.get(page) >= limit {
                self.rebalance_base(st);
            }
            st.local_count += 1;
        }

        if let Some(editable) = self.source.editable() {
            editable.on_insert(index, &item, updated_at)?;
        }
        self.events.collection_changed.emit(&CollectionChange::Add {
            items: vec![item],
            index,
        });
        Ok(())
    }

    /// Removes the item at `index`. Returns it when its page was resident (or the source knew it).
    pub fn remove_at(&self, index: usize, updated_at: Option<Timestamp>) -> Result<Option<T>> {
        self.ensure_count()?;
        let threshold = self.config.step_to_jump_threshold;
        let write = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if index >= st.local_count {
                return Err(Error::IndexOutOfRange {
                    index,
                    count: st.local_count,
                });
            }
            let (page, offset) = st.locate(index, threshold);
            self.remove_located(st, page, offset, updated_at)
        };
        match write {
            Write::Stale => {
                vdebug!(index, "PaginationManager: stale remove dropped");
                Ok(None)
            }
            Write::Applied(removed) => self.finish_remove(index, removed, updated_at),
        }
    }

    fn finish_remove(
        &self,
        index: usize,
        removed: Option<T>,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<T>> {
        let removed = match self.source.editable() {
            Some(editable) => {
                let from_source = editable.on_remove(index, removed.as_ref(), updated_at)?;
                removed.or(from_source)
            }
            None => removed,
        };
        self.events.collection_changed.emit(&CollectionChange::Remove {
            item: removed.clone(),
            index,
        });
        Ok(removed)
    }

    /// Removes `item`, returning the index it occupied.
    pub fn remove_item(&self, item: &T, updated_at: Option<Timestamp>) -> Result<Option<usize>> {
        self.ensure_count()?;
        let resident = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            match st.find_resident(item) {
                Some((page, offset)) => {
                    let index = st.page_start(page) + offset;
                    Some((index, self.remove_located(st, page, offset, updated_at)))
                }
                None => None,
            }
        };

        match resident {
            Some((_, Write::Stale)) => Ok(None),
            Some((index, Write::Applied(removed))) => {
                self.finish_remove(index, removed, updated_at)?;
                Ok(Some(index))
            }
            None => match self.source_index_of(item)? {
                Some(index) => {
                    self.remove_at(index, updated_at)?;
                    Ok(Some(index))
                }
                None => Ok(None),
            },
        }
    }

    /// Replaces the item at `index`, returning the previous value when it is known.
    ///
    /// When the page is not resident the previous value is read from a synchronous source; an
    /// asynchronous source is never blocked on for it.
    pub fn replace_at(
        &self,
        index: usize,
        item: T,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<T>> {
        self.ensure_count()?;
        let threshold = self.config.step_to_jump_threshold;
        let resident = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if index >= st.local_count {
                return Err(Error::IndexOutOfRange {
                    index,
                    count: st.local_count,
                });
            }
            let (page, offset) = st.locate(index, threshold);
            let outcome = st.pages.get_mut(&page).map(|p| {
                match p.replace_at(offset, item.clone(), updated_at, self.comparer.as_deref()) {
                    Some(old) => Write::Applied(old),
                    None => Write::Stale,
                }
            });
            st.touch(page);
            outcome
        };

        let old = match resident {
            Some(Write::Stale) => {
                vdebug!(index, "PaginationManager: stale replace dropped");
                return Ok(None);
            }
            Some(Write::Applied(old)) => Some(old),
            None => match &self.source {
                PageSource::Sync(source) => source.items_at(index, 1)?.into_iter().next(),
                PageSource::Async(_) => None,
            },
        };

        if let Some(editable) = self.source.editable() {
            editable.on_replace(index, old.as_ref(), &item, updated_at)?;
        }
        self.events.collection_changed.emit(&CollectionChange::Replace {
            old: old.clone(),
            new: item,
            index,
        });
        Ok(old)
    }

    /// Replaces `old` with `new`, returning the index of the replaced item.
    pub fn replace_item(
        &self,
        old: &T,
        new: T,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<usize>> {
        match self.index_of(old)? {
            Some(index) => {
                self.replace_at(index, new, updated_at)?;
                Ok(Some(index))
            }
            None => Ok(None),
        }
    }

    /// Index of `item` if it sits in a resident page. Never consults the source.
    pub fn resident_index_of(&self, item: &T) -> Option<usize> {
        let st = self.state.lock();
        st.find_resident(item)
            .map(|(page, offset)| st.page_start(page) + offset)
    }

    fn source_index_of(&self, item: &T) -> Result<Option<usize>> {
        match &self.source {
            PageSource::Sync(source) => source.index_of(item),
            PageSource::Async(source) => futures::executor::block_on(source.index_of(item)),
        }
    }

    /// Index of `item`: resident pages first, then the source.
    pub fn index_of(&self, item: &T) -> Result<Option<usize>> {
        match self.resident_index_of(item) {
            Some(index) => Ok(Some(index)),
            None => self.source_index_of(item),
        }
    }

    pub fn contains(&self, item: &T) -> Result<bool> {
        if self.resident_index_of(item).is_some() {
            return Ok(true);
        }
        match &self.source {
            PageSource::Sync(source) => source.contains(item),
            PageSource::Async(source) => futures::executor::block_on(source.contains(item)),
        }
    }

    fn on_source_changed(&self, change: SourceChange<T>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let done = self
            .ctx
            .run_on_ui(move || me.apply_source_change(change));
        self.ctx.spawn(done);
    }

    fn apply_source_change(&self, change: SourceChange<T>) {
        match change {
            SourceChange::Added(items) => {
                for item in items {
                    if let Err(_err) = self.append_internal(item, None, true, true) {
                        vwarn!(error = %_err, "PaginationManager: source append failed");
                    }
                }
            }
            SourceChange::Replaced { index, item } => {
                let threshold = self.config.step_to_jump_threshold;
                let old = {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    let (page, offset) = st.locate(index, threshold);
                    st.pages
                        .get_mut(&page)
                        .and_then(|p| p.replace_at(offset, item.clone(), None, None))
                };
                self.events.collection_changed.emit(&CollectionChange::Replace {
                    old,
                    new: item,
                    index,
                });
            }
            SourceChange::Removed | SourceChange::Moved | SourceChange::Reset => {
                {
                    let mut st = self.state.lock();
                    st.drop_all_deltas_and_pages();
                    if let Some(token) = st.count_request.take() {
                        token.cancel();
                    }
                    st.local_count = 0;
                    st.has_got_count = false;
                }
                self.events
                    .collection_changed
                    .emit(&CollectionChange::Reset);
                self.events.count_changed.emit(&CountChanged {
                    count: None,
                    needs_reset: false,
                });
            }
        }
    }
}

impl<T: PagedItem> ItemSource<T> for PaginationManager<T> {
    fn get_at(&self, index: usize) -> Result<T> {
        PaginationManager::get_at(self, index)
    }

    fn count(&self, async_ok: bool) -> Result<usize> {
        PaginationManager::count(self, async_ok)
    }

    fn count_async(&self) -> BoxFuture<'static, Result<usize>> {
        match &self.source {
            PageSource::Sync(source) => futures::future::ready(source.count()).boxed(),
            PageSource::Async(source) => source.count(),
        }
    }

    fn index_of(&self, item: &T) -> Result<Option<usize>> {
        PaginationManager::index_of(self, item)
    }

    fn contains(&self, item: &T) -> Result<bool> {
        PaginationManager::contains(self, item)
    }

    fn on_reset(&self, count: Option<usize>) {
        PaginationManager::on_reset(self, count);
    }

    fn before_reset(&self) {
        PaginationManager::before_reset(self);
    }

    fn editable(&self) -> Option<&dyn EditableItemSource<T>> {
        Some(self)
    }

    fn events(&self) -> Option<&SourceEvents<T>> {
        Some(&self.events)
    }

    fn emits_changes(&self) -> bool {
        true
    }
}

impl<T: PagedItem> EditableItemSource<T> for PaginationManager<T> {
    fn append(&self, item: T, updated_at: Option<Timestamp>) -> Result<usize> {
        match PaginationManager::append(self, item, updated_at)? {
            Some(index) => Ok(index),
            None => Ok(self.cached_count().saturating_sub(1)),
        }
    }

    fn insert(&self, index: usize, item: T, updated_at: Option<Timestamp>) -> Result<()> {
        PaginationManager::insert(self, index, item, updated_at)
    }

    fn replace_at(
        &self,
        index: usize,
        item: T,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<T>> {
        PaginationManager::replace_at(self, index, item, updated_at)
    }

    fn replace_item(
        &self,
        old: &T,
        new: T,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<usize>> {
        PaginationManager::replace_item(self, old, new, updated_at)
    }

    fn remove_at(&self, index: usize, updated_at: Option<Timestamp>) -> Result<Option<T>> {
        PaginationManager::remove_at(self, index, updated_at)
    }

    fn remove_item(&self, item: &T, updated_at: Option<Timestamp>) -> Result<Option<usize>> {
        PaginationManager::remove_item(self, item, updated_at)
    }
}

impl<T: PagedItem> ReclaimableService for PaginationManager<T> {
    fn run_claim(&self, section_context: &str) {
        PaginationManager::run_claim(self, section_context);
    }
}

impl<T: PagedItem> Drop for PaginationManager<T> {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        st.cancel_all_requests();
        if let Some(token) = st.count_request.take() {
            token.cancel();
        }
    }
}

impl<T: PagedItem> fmt::Debug for PaginationManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("PaginationManager")
            .field("source", &self.source)
            .field("base_page", &st.base_page)
            .field("page_size", &st.page_size)
            .field("count", &st.local_count)
            .field("has_got_count", &st.has_got_count)
            .field("pages", &st.pages.len())
            .field("deltas", &st.deltas.len())
            .field("in_flight", &st.requests.len())
            .finish()
    }
}
