use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use datavirt::{
    AsyncItemSource, CancelToken, CollectionChange, CountChanged, EditableItemSource, Error,
    EventEmitter, ItemSource, PagedItem, PaginationManager, Result, SubscriptionId, ThreadModel,
    Timestamp, VirtualizationAction, VirtualizationContext,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// What a [`VirtualizingCollection`] reads from.
pub enum Provider<T> {
    Sync(Arc<dyn ItemSource<T>>),
    /// Reads hand out placeholders and raise `Replace` once the real item arrives.
    Async(Arc<dyn AsyncItemSource<T>>),
}

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(s) => Self::Sync(Arc::clone(s)),
            Self::Async(s) => Self::Async(Arc::clone(s)),
        }
    }
}

impl<T> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Provider::Sync"),
            Self::Async(_) => f.write_str("Provider::Async"),
        }
    }
}

/// An observable, index-addressable list over a provider that only materializes what is read.
///
/// Provider events are relayed to this collection's subscribers. When the provider already
/// announces its own edits (see [`ItemSource::emits_changes`]), edits made here raise nothing
/// extra; otherwise the collection raises them itself.
///
/// While bulk mode is held, every change notification is suppressed; releasing the outermost
/// [`BulkMode`] guard raises a single `Reset` followed by a single count notification.
pub struct VirtualizingCollection<T: PagedItem> {
    me: Weak<Self>,
    ctx: Arc<VirtualizationContext>,
    provider: Provider<T>,
    relay: Vec<Relay>,
    bulk: AtomicUsize,
    reset_token: Mutex<Option<CancelToken>>,
    async_count: Mutex<Option<usize>>,
    count_pending: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    collection_changed: EventEmitter<CollectionChange<T>>,
    count_changed: EventEmitter<CountChanged>,
}

enum Relay {
    Collection(SubscriptionId),
    Count(SubscriptionId),
}

impl<T: PagedItem> VirtualizingCollection<T> {
    pub fn new(ctx: Arc<VirtualizationContext>, source: Arc<dyn ItemSource<T>>) -> Arc<Self> {
        Self::with_provider(ctx, Provider::Sync(source))
    }

    pub fn with_async(
        ctx: Arc<VirtualizationContext>,
        source: Arc<dyn AsyncItemSource<T>>,
    ) -> Arc<Self> {
        Self::with_provider(ctx, Provider::Async(source))
    }

    /// A collection reading through `pager`, on the pager's context.
    pub fn over_pager(pager: Arc<PaginationManager<T>>) -> Arc<Self> {
        let ctx = Arc::clone(pager.context());
        Self::new(ctx, pager)
    }

    pub fn with_provider(ctx: Arc<VirtualizationContext>, provider: Provider<T>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let mut relay = Vec::new();
            let events = match &provider {
                Provider::Sync(source) => source.events(),
                Provider::Async(_) => None,
            };
            if let Some(events) = events {
                let weak = me.clone();
                relay.push(Relay::Collection(events.collection_changed.subscribe(
                    move |change: &CollectionChange<T>| {
                        if let Some(collection) = weak.upgrade() {
                            collection.on_provider_changed(change);
                        }
                    },
                )));
                let weak = me.clone();
                relay.push(Relay::Count(events.count_changed.subscribe(
                    move |event: &CountChanged| {
                        if let Some(collection) = weak.upgrade() {
                            collection.on_provider_count_changed(event);
                        }
                    },
                )));
            }
            Self {
                me: me.clone(),
                ctx,
                provider,
                relay,
                bulk: AtomicUsize::new(0),
                reset_token: Mutex::new(None),
                async_count: Mutex::new(None),
                count_pending: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                collection_changed: EventEmitter::new(),
                count_changed: EventEmitter::new(),
            }
        })
    }

    pub fn context(&self) -> &Arc<VirtualizationContext> {
        &self.ctx
    }

    pub fn provider(&self) -> &Provider<T> {
        &self.provider
    }

    pub fn subscribe_collection_changed(
        &self,
        listener: impl Fn(&CollectionChange<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.collection_changed.subscribe(listener)
    }

    pub fn unsubscribe_collection_changed(&self, id: SubscriptionId) -> bool {
        self.collection_changed.unsubscribe(id)
    }

    pub fn subscribe_count_changed(
        &self,
        listener: impl Fn(&CountChanged) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.count_changed.subscribe(listener)
    }

    pub fn unsubscribe_count_changed(&self, id: SubscriptionId) -> bool {
        self.count_changed.unsubscribe(id)
    }

    /// Returns the item at `index`.
    ///
    /// With an asynchronous provider this is the provider's placeholder; a `Replace` follows on
    /// the UI thread once the real item is fetched.
    pub fn get(&self, index: usize) -> Result<T> {
        match &self.provider {
            Provider::Sync(source) => source.get_at(index),
            Provider::Async(source) => {
                let placeholder = source.placeholder(index);
                self.spawn_async_get(source, index, placeholder.clone());
                Ok(placeholder)
            }
        }
    }

    /// The known count. An unknown count is fetched in the background and `0` returned meanwhile.
    pub fn len(&self) -> Result<usize> {
        match &self.provider {
            Provider::Sync(source) => source.count(true),
            Provider::Async(source) => {
                if let Some(count) = *self.async_count.lock() {
                    return Ok(count);
                }
                self.spawn_async_count(source);
                Ok(0)
            }
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn index_of(&self, item: &T) -> Result<Option<usize>> {
        match &self.provider {
            Provider::Sync(source) => source.index_of(item),
            Provider::Async(source) => futures::executor::block_on(source.index_of(item)),
        }
    }

    pub fn contains(&self, item: &T) -> Result<bool> {
        match &self.provider {
            Provider::Sync(source) => source.contains(item),
            Provider::Async(_) => Ok(self.index_of(item)?.is_some()),
        }
    }

    /// Iterates over the known count at the time of the call.
    pub fn iter(&self) -> Result<Iter<'_, T>> {
        Ok(Iter {
            collection: self,
            next: 0,
            len: self.len()?,
        })
    }

    /// Waits for background reads started by this collection.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }
    }

    pub fn push(&self, item: T) -> Result<usize> {
        self.push_stamped(item, None)
    }

    pub fn push_stamped(&self, item: T, updated_at: Option<Timestamp>) -> Result<usize> {
        let index = self.editor()?.append(item.clone(), updated_at)?;
        self.announce(CollectionChange::Add {
            items: vec![item],
            index,
        });
        Ok(index)
    }

    /// Appends every item inside one bulk section. Returns the index of the last one.
    pub fn add_range(
        &self,
        items: impl IntoIterator<Item = T>,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<usize>> {
        let _bulk = self.enter_bulk_mode();
        let mut last = None;
        for item in items {
            last = Some(self.push_stamped(item, updated_at)?);
        }
        Ok(last)
    }

    pub fn insert(&self, index: usize, item: T) -> Result<()> {
        self.insert_stamped(index, item, None)
    }

    pub fn insert_stamped(
        &self,
        index: usize,
        item: T,
        updated_at: Option<Timestamp>,
    ) -> Result<()> {
        self.editor()?.insert(index, item.clone(), updated_at)?;
        self.announce(CollectionChange::Add {
            items: vec![item],
            index,
        });
        Ok(())
    }

    /// Replaces the item at `index`, returning the previous one when it was known.
    pub fn set(&self, index: usize, item: T) -> Result<Option<T>> {
        self.replace_at(index, item, None)
    }

    pub fn replace_at(
        &self,
        index: usize,
        item: T,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<T>> {
        let old = self.editor()?.replace_at(index, item.clone(), updated_at)?;
        self.announce(CollectionChange::Replace {
            old: old.clone(),
            new: item,
            index,
        });
        Ok(old)
    }

    /// Replaces `old` with `new` wherever `old` is found.
    pub fn replace(&self, old: &T, new: T) -> Result<Option<usize>> {
        let index = self.editor()?.replace_item(old, new.clone(), None)?;
        if let Some(index) = index {
            self.announce(CollectionChange::Replace {
                old: Some(old.clone()),
                new,
                index,
            });
        }
        Ok(index)
    }

    pub fn remove_at(&self, index: usize) -> Result<Option<T>> {
        self.remove_at_stamped(index, None)
    }

    pub fn remove_at_stamped(
        &self,
        index: usize,
        updated_at: Option<Timestamp>,
    ) -> Result<Option<T>> {
        let removed = self.editor()?.remove_at(index, updated_at)?;
        self.announce(CollectionChange::Remove {
            item: removed.clone(),
            index,
        });
        Ok(removed)
    }

    /// Removes `item`. Returns whether it was found.
    pub fn remove(&self, item: &T) -> Result<bool> {
        let index = self.editor()?.remove_item(item, None)?;
        if let Some(index) = index {
            self.announce(CollectionChange::Remove {
                item: Some(item.clone()),
                index,
            });
        }
        Ok(index.is_some())
    }

    /// Moves the item at `old_index` to `new_index`.
    ///
    /// A provider that announces its own edits (such as a [`PaginationManager`]) reports the move
    /// as a `Remove` followed by an `Add`; otherwise a single `Move` is raised.
    pub fn move_item(&self, old_index: usize, new_index: usize) -> Result<()> {
        let editor = self.editor()?;
        let item = self.get(old_index)?;
        editor.remove_at(old_index, None)?;
        editor.insert(new_index, item.clone(), None)?;
        if !self.emits_changes() {
            self.raise(CollectionChange::Move {
                item,
                old_index,
                new_index,
            });
        }
        Ok(())
    }

    /// Drops every cached page and forgets the count; the next read fetches it again.
    pub fn clear(&self) {
        match &self.provider {
            Provider::Sync(source) => {
                source.before_reset();
                source.on_reset(None);
            }
            Provider::Async(source) => {
                *self.async_count.lock() = None;
                source.on_reset(None);
            }
        }
        if !self.has_provider_events() {
            self.raise(CollectionChange::Reset);
            self.touch_count(None);
        }
    }

    /// Refetches the count and resets the provider with it.
    ///
    /// A newer reset supersedes this one, which then fails with [`Error::Cancelled`] without
    /// touching the provider.
    pub async fn reset_async(&self) -> Result<()> {
        let token = CancelToken::new();
        if let Some(previous) = self.reset_token.lock().replace(token.clone()) {
            previous.cancel();
        }
        let outcome = self.run_reset(&token).await;
        let mut slot = self.reset_token.lock();
        if slot.as_ref().is_some_and(|current| current.same_as(&token)) {
            *slot = None;
        }
        outcome
    }

    /// Blocking form of [`Self::reset_async`]. Must not be called from inside an async task.
    pub fn reset(&self) -> Result<()> {
        futures::executor::block_on(self.reset_async())
    }

    async fn run_reset(&self, token: &CancelToken) -> Result<()> {
        let count = match &self.provider {
            Provider::Sync(source) => {
                source.before_reset();
                source.count_async().await?
            }
            Provider::Async(source) => source.count().await?,
        };
        if token.is_cancelled() {
            cdebug!("VirtualizingCollection::reset superseded");
            return Err(Error::Cancelled);
        }
        let Some(me) = self.me.upgrade() else {
            return Err(Error::Cancelled);
        };
        self.ctx
            .run_on_ui(move || me.apply_reset(count))
            .await;
        Ok(())
    }

    fn apply_reset(&self, count: usize) {
        ctrace!(count, "VirtualizingCollection::apply_reset");
        match &self.provider {
            Provider::Sync(source) => source.on_reset(Some(count)),
            Provider::Async(source) => {
                *self.async_count.lock() = Some(count);
                source.on_reset(Some(count));
            }
        }
        if !self.has_provider_events() {
            self.raise(CollectionChange::Reset);
            self.touch_count(Some(count));
        }
    }

    /// Suppresses change notifications until the returned guard (and any nested one) is dropped.
    pub fn enter_bulk_mode(&self) -> BulkMode<'_, T> {
        self.bulk.fetch_add(1, Ordering::AcqRel);
        BulkMode { collection: self }
    }

    pub fn is_bulk_mode(&self) -> bool {
        self.bulk.load(Ordering::Acquire) > 0
    }

    fn release_bulk_mode(&self) {
        let previous = self
            .bulk
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            cdebug!("VirtualizingCollection: bulk mode released");
            self.raise(CollectionChange::Reset);
            self.touch_count(self.known_count());
        }
    }

    /// Queues a UI-thread `Reset` notification on the context scheduler.
    pub fn schedule_reset_notification(&self) {
        self.ctx
            .add_action(Arc::new(ExecuteReset::new(self.me.clone())));
    }

    fn raise(&self, change: CollectionChange<T>) {
        if self.is_bulk_mode() {
            return;
        }
        self.collection_changed.emit(&change);
    }

    fn touch_count(&self, count: Option<usize>) {
        if self.is_bulk_mode() {
            return;
        }
        self.count_changed.emit(&CountChanged {
            count,
            needs_reset: false,
        });
    }

    fn announce(&self, change: CollectionChange<T>) {
        if self.emits_changes() {
            return;
        }
        self.raise(change);
        self.touch_count(self.known_count());
    }

    fn on_provider_changed(&self, change: &CollectionChange<T>) {
        let touches_count = matches!(
            change,
            CollectionChange::Add { .. } | CollectionChange::Remove { .. }
        );
        self.raise(change.clone());
        if touches_count {
            self.touch_count(self.known_count());
        }
    }

    fn on_provider_count_changed(&self, event: &CountChanged) {
        if event.needs_reset {
            self.raise(CollectionChange::Reset);
        }
        self.touch_count(event.count);
    }

    fn known_count(&self) -> Option<usize> {
        match &self.provider {
            Provider::Sync(source) => source.count(true).ok(),
            Provider::Async(_) => *self.async_count.lock(),
        }
    }

    fn emits_changes(&self) -> bool {
        match &self.provider {
            Provider::Sync(source) => source.emits_changes(),
            Provider::Async(_) => false,
        }
    }

    fn has_provider_events(&self) -> bool {
        !self.relay.is_empty()
    }

    fn editor(&self) -> Result<&dyn EditableItemSource<T>> {
        match &self.provider {
            Provider::Sync(source) => source.editable().ok_or(Error::NotEditable),
            Provider::Async(_) => Err(Error::NotEditable),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn spawn_async_count(&self, source: &Arc<dyn AsyncItemSource<T>>) {
        if self.count_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let fetch = source.count();
        let weak = self.me.clone();
        let ctx = Arc::clone(&self.ctx);
        self.track(self.ctx.spawn(async move {
            let outcome = fetch.await;
            let Some(me) = weak.upgrade() else {
                return;
            };
            me.count_pending.store(false, Ordering::Release);
            match outcome {
                Ok(count) => {
                    *me.async_count.lock() = Some(count);
                    ctx.run_on_ui(move || {
                        me.raise(CollectionChange::Reset);
                        me.touch_count(Some(count));
                    })
                    .await;
                }
                Err(_err) => {
                    cdebug!(error = %_err, "VirtualizingCollection: count failed");
                }
            }
        }));
    }

    fn spawn_async_get(&self, source: &Arc<dyn AsyncItemSource<T>>, index: usize, placeholder: T) {
        let fetch = source.get_at(index);
        let weak = self.me.clone();
        let ctx = Arc::clone(&self.ctx);
        self.track(self.ctx.spawn(async move {
            match fetch.await {
                Ok(item) => {
                    let Some(me) = weak.upgrade() else {
                        return;
                    };
                    ctx.run_on_ui(move || {
                        me.raise(CollectionChange::Replace {
                            old: Some(placeholder),
                            new: item,
                            index,
                        });
                    })
                    .await;
                }
                Err(_err) => {
                    cdebug!(index, error = %_err, "VirtualizingCollection: read failed");
                }
            }
        }));
    }
}

impl<T: PagedItem> Drop for VirtualizingCollection<T> {
    fn drop(&mut self) {
        let Provider::Sync(source) = &self.provider else {
            return;
        };
        if let Some(events) = source.events() {
            for relay in &self.relay {
                match relay {
                    Relay::Collection(id) => {
                        events.collection_changed.unsubscribe(*id);
                    }
                    Relay::Count(id) => {
                        events.count_changed.unsubscribe(*id);
                    }
                }
            }
        }
    }
}

impl<T: PagedItem> fmt::Debug for VirtualizingCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualizingCollection")
            .field("provider", &self.provider)
            .field("bulk", &self.bulk.load(Ordering::Relaxed))
            .field("collection_changed", &self.collection_changed)
            .field("count_changed", &self.count_changed)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`VirtualizingCollection::enter_bulk_mode`].
#[must_use = "bulk mode ends when the guard is dropped"]
pub struct BulkMode<'a, T: PagedItem> {
    collection: &'a VirtualizingCollection<T>,
}

impl<T: PagedItem> Drop for BulkMode<'_, T> {
    fn drop(&mut self) {
        self.collection.release_bulk_mode();
    }
}

impl<T: PagedItem> fmt::Debug for BulkMode<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkMode").finish_non_exhaustive()
    }
}

/// Iterator returned by [`VirtualizingCollection::iter`].
pub struct Iter<'a, T: PagedItem> {
    collection: &'a VirtualizingCollection<T>,
    next: usize,
    len: usize,
}

impl<T: PagedItem> Iterator for Iter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.collection.get(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.next;
        (remaining, Some(remaining))
    }
}

impl<T: PagedItem> ExactSizeIterator for Iter<'_, T> {}

/// One-shot UI action raising `Reset` on a collection, if it is still alive.
pub struct ExecuteReset<T: PagedItem> {
    target: Weak<VirtualizingCollection<T>>,
}

impl<T: PagedItem> ExecuteReset<T> {
    pub fn new(target: Weak<VirtualizingCollection<T>>) -> Self {
        Self { target }
    }
}

impl<T: PagedItem> VirtualizationAction for ExecuteReset<T> {
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::UiThread
    }

    fn do_action(&self) {
        if let Some(collection) = self.target.upgrade() {
            collection.raise(CollectionChange::Reset);
        }
    }

    fn name(&self) -> &'static str {
        "execute-reset"
    }
}

impl<T: PagedItem> fmt::Debug for ExecuteReset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteReset")
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}
