use std::time::Duration;

use crate::{Error, Result};

/// Configuration for a [`crate::PaginationManager`].
///
/// With `feature = "serde"`, this type implements `Serialize`/`Deserialize`, so a host can keep
/// cache tuning in its own settings file.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PagerConfig {
    /// Nominal number of items per page.
    pub page_size: usize,
    /// Page budget. `run_claim` evicts down to this many resident pages.
    pub max_pages: usize,
    /// Maximum number of pages with a pending delta. `None` is unbounded.
    ///
    /// When a new page would exceed the bound, every delta and page is dropped and the cache
    /// re-fetches from the source.
    pub max_deltas: Option<usize>,
    /// Maximum summed absolute delta across the ledger. `None` is unbounded.
    pub max_distance: Option<usize>,
    /// Index translation jumps whole pages once the remaining distance exceeds
    /// `page_size * step_to_jump_threshold`.
    pub step_to_jump_threshold: usize,
    /// Period of the reclamation action registered with the scheduler.
    pub reclaim_interval: Duration,
    /// Free-form label handed to the reclaimer with each claim.
    pub section_context: String,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 100,
            max_deltas: None,
            max_distance: None,
            step_to_jump_threshold: 10,
            reclaim_interval: Duration::from_secs(60),
            section_context: String::new(),
        }
    }
}

impl PagerConfig {
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        Self {
            page_size,
            max_pages,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_max_deltas(mut self, max_deltas: Option<usize>) -> Self {
        self.max_deltas = max_deltas;
        self
    }

    pub fn with_max_distance(mut self, max_distance: Option<usize>) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn with_step_to_jump_threshold(mut self, threshold: usize) -> Self {
        self.step_to_jump_threshold = threshold;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_section_context(mut self, context: impl Into<String>) -> Self {
        self.section_context = context.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidConfig("page_size must be at least 1".into()));
        }
        if self.max_pages == 0 {
            return Err(Error::InvalidConfig("max_pages must be at least 1".into()));
        }
        if self.step_to_jump_threshold == 0 {
            return Err(Error::InvalidConfig(
                "step_to_jump_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
