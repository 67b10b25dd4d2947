//! List-facing pieces built on the `datavirt` page cache.
//!
//! The `datavirt` crate owns the paging math and fetch protocol. This crate provides what a list
//! or grid control binds to:
//!
//! - [`VirtualizingCollection`]: an observable, index-addressable list with bulk mode and reset
//! - [`DataItem`]: a shared model wrapper that reports when its placeholder has been filled
//! - [`DataSource`]: a model store exposed as a virtualizing collection of `DataItem`s
//!
//! This crate is framework-agnostic; UI-thread affinity comes from the
//! [`datavirt::VirtualizationContext`] the host builds.
#![forbid(unsafe_code)]

#[macro_use]
mod macros;

mod collection;
mod data_item;
mod data_source;


pub use collection::{BulkMode, ExecuteReset, Iter, Provider, VirtualizingCollection};
pub use data_item::{DataItem, ItemProperty};
pub use data_source::{DataSource, ModelStore, Query};
