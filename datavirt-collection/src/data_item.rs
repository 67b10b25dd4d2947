use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use datavirt::{EventEmitter, PagedItem, SubscriptionId};
use parking_lot::RwLock;

/// The property of a [`DataItem`] that changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ItemProperty {
    Item,
    IsLoading,
}

struct Inner<M> {
    item: RwLock<M>,
    loading: AtomicBool,
    observers: EventEmitter<ItemProperty>,
}

/// A shared, observable wrapper around a model.
///
/// Clones are handles to the same wrapper; identity (not model equality) is what the page cache
/// uses to find an item. A wrapper created as a placeholder reports `is_loading() == true` until
/// [`DataItem::complete`] folds the fetched model into it, which happens at most once.
pub struct DataItem<M> {
    inner: Arc<Inner<M>>,
}

impl<M> DataItem<M> {
    fn with_state(item: M, loading: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                item: RwLock::new(item),
                loading: AtomicBool::new(loading),
                observers: EventEmitter::new(),
            }),
        }
    }

    /// A materialized item.
    pub fn new(item: M) -> Self {
        Self::with_state(item, false)
    }

    /// A stand-in shown while the real model is being fetched.
    pub fn placeholder(item: M) -> Self {
        Self::with_state(item, true)
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::Acquire)
    }

    pub fn with_item<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(&self.inner.item.read())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&ItemProperty) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.observers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    /// Replaces the model and notifies [`ItemProperty::Item`].
    pub fn set_item(&self, item: M) {
        *self.inner.item.write() = item;
        self.inner.observers.emit(&ItemProperty::Item);
    }

    /// Folds a fetched model into a placeholder and clears the loading flag.
    ///
    /// Returns `false` (and changes nothing) when the item is not loading.
    pub fn complete(&self, item: M) -> bool {
        {
            let mut slot = self.inner.item.write();
            if !self.inner.loading.load(Ordering::Acquire) {
                return false;
            }
            *slot = item;
            self.inner.loading.store(false, Ordering::Release);
        }
        self.inner.observers.emit(&ItemProperty::Item);
        self.inner.observers.emit(&ItemProperty::IsLoading);
        true
    }
}

impl<M: Clone> DataItem<M> {
    pub fn item(&self) -> M {
        self.inner.item.read().clone()
    }

    /// Unwraps the model, cloning it when other handles are still alive.
    pub fn into_inner(self) -> M {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.item.into_inner(),
            Err(shared) => shared.item.read().clone(),
        }
    }
}

impl<M> Clone for DataItem<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for DataItem<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataItem")
            .field("item", &*self.inner.item.read())
            .field("is_loading", &self.is_loading())
            .finish()
    }
}

impl<M: Clone + Send + Sync + 'static> PagedItem for DataItem<M> {
    const FILLS_IN_PLACE: bool = true;

    fn same_item(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }

    fn fill_placeholder(&self, fetched: &Self) {
        if self.complete(fetched.item()) {
            ctrace!("DataItem: placeholder filled");
        }
    }
}
