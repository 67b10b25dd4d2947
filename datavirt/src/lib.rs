//! A page-granular data virtualization engine.
//!
//! For the list-facing collection and the model/store data source, see the
//! `datavirt-collection` crate.
//!
//! This crate keeps only the pages a view is looking at in memory, while still answering
//! index-based reads and edits over the whole logical sequence:
//! - a page cache with placeholder-then-fill async loading and per-page cancellation
//! - a delta ledger that keeps index translation exact across inserts and removals made
//!   through the cache, without refetching
//! - pluggable eviction (least recently touched by default) driven by a deferred action
//!   scheduler
//!
//! It is UI-agnostic. A host is expected to provide:
//! - a UI-thread executor (see [`ContextBuilder::ui_executor`])
//! - a tokio runtime handle for background fetches
//! - a page-addressable source ([`PagedSource`] or [`AsyncPagedSource`])
#![forbid(unsafe_code)]

#[macro_use]
mod macros;

mod context;
mod delta;
mod emitter;
mod error;
mod item;
mod options;
mod page;
mod pager;
mod reclaimer;
mod scheduler;
mod source;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use context::{CancelToken, ContextBuilder, UiExecutor, UiTask, VirtualizationContext};
pub use delta::{DeltaLedger, PageDelta};
pub use emitter::{EventEmitter, Listener, SubscriptionId};
pub use error::{BoxError, Error, Result};
pub use item::PagedItem;
pub use options::PagerConfig;
pub use page::{Page, PageExpiryComparer, WiredTimeComparer};
pub use pager::{PageSource, PagerBuilder, PaginationManager, PlaceholderReplace};
pub use reclaimer::{PageReclaimer, ReclaimOnTouched};
pub use scheduler::{
    ActionScheduler, ActionWrapper, ReclaimPages, RepeatingSchedule, ThreadModel,
    VirtualizationAction,
};
pub use source::{
    AsyncAsSync, AsyncItemSource, AsyncPagedSource, EditableItemSource, EditableSource,
    FnPagedSource, ItemSource, PagedSource, ReclaimableService, SourceChange, SourceEvents,
    SourceSink, SyncAsAsync,
};
pub use state::{PageSnapshot, PagerSnapshot};
pub use types::{CollectionChange, CountChanged, FetchState, PageNumber, Timestamp};
