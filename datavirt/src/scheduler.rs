use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{ReclaimableService, VirtualizationContext};

/// Where an action runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThreadModel {
    UiThread,
    Background,
}

/// Deferred work queued on an [`ActionScheduler`].
pub trait VirtualizationAction: Send + Sync {
    fn thread_model(&self) -> ThreadModel;

    fn do_action(&self);

    /// Repeating actions return `false` until their interval has elapsed.
    fn is_due_to_run(&self, _now: Instant) -> bool {
        true
    }

    /// Whether the action stays queued after running. One-shot actions return `false`.
    fn keep_in_actions_list(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "action"
    }
}

/// Interval bookkeeping for repeating actions.
///
/// A schedule that never ran is due immediately.
#[derive(Debug)]
pub struct RepeatingSchedule {
    interval: Duration,
    repeating: bool,
    last_run: Mutex<Option<Instant>>,
}

impl RepeatingSchedule {
    pub fn new(interval: Duration, repeating: bool) -> Self {
        Self {
            interval,
            repeating,
            last_run: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match *self.last_run.lock() {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    /// Marks a run at `now` if one is due. Returns whether the caller should run.
    pub fn try_begin(&self, now: Instant) -> bool {
        let mut last_run = self.last_run.lock();
        let due = last_run.is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            *last_run = Some(now);
        }
        due
    }

    pub fn mark_run(&self, at: Instant) {
        *self.last_run.lock() = Some(at);
    }

    pub fn last_run(&self) -> Option<Instant> {
        *self.last_run.lock()
    }
}

impl Default for RepeatingSchedule {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), false)
    }
}

/// A one-shot action wrapping a closure.
pub struct ActionWrapper {
    thread_model: ThreadModel,
    action: Box<dyn Fn() + Send + Sync>,
}

impl ActionWrapper {
    pub fn new(thread_model: ThreadModel, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            thread_model,
            action: Box::new(action),
        }
    }

    pub fn on_ui(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self::new(ThreadModel::UiThread, action)
    }

    pub fn in_background(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self::new(ThreadModel::Background, action)
    }
}

impl VirtualizationAction for ActionWrapper {
    fn thread_model(&self) -> ThreadModel {
        self.thread_model
    }

    fn do_action(&self) {
        (self.action)();
    }

    fn name(&self) -> &'static str {
        "wrapper"
    }
}

impl fmt::Debug for ActionWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionWrapper")
            .field("thread_model", &self.thread_model)
            .finish_non_exhaustive()
    }
}

/// Periodically asks a reclaimable service to release pages.
///
/// Holds the service weakly: once the service is dropped the action leaves the queue on its
/// next run.
pub struct ReclaimPages {
    target: Weak<dyn ReclaimableService>,
    section_context: String,
    schedule: RepeatingSchedule,
}

impl ReclaimPages {
    pub fn new(
        target: Weak<dyn ReclaimableService>,
        section_context: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            target,
            section_context: section_context.into(),
            schedule: RepeatingSchedule::new(interval, true),
        }
    }

    pub fn is_target_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}

impl VirtualizationAction for ReclaimPages {
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Background
    }

    fn do_action(&self) {
        if let Some(target) = self.target.upgrade() {
            target.run_claim(&self.section_context);
        }
    }

    fn is_due_to_run(&self, now: Instant) -> bool {
        self.schedule.try_begin(now)
    }

    fn keep_in_actions_list(&self) -> bool {
        self.schedule.is_repeating() && self.is_target_alive()
    }

    fn name(&self) -> &'static str {
        "reclaim-pages"
    }
}

impl fmt::Debug for ReclaimPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimPages")
            .field("alive", &self.is_target_alive())
            .field("section_context", &self.section_context)
            .field("schedule", &self.schedule)
            .finish()
    }
}

/// Queue of deferred UI-thread and background actions.
#[derive(Default)]
pub struct ActionScheduler {
    actions: Mutex<Vec<Arc<dyn VirtualizationAction>>>,
    processing: AtomicBool,
}

impl ActionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_action(&self, action: Arc<dyn VirtualizationAction>) {
        vtrace!(name = action.name(), "ActionScheduler::add_action");
        self.actions.lock().push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Runs every action that is due at `now`.
    ///
    /// UI-thread actions go through the context's UI executor, background actions onto the
    /// blocking pool. Actions that do not ask to stay are removed afterwards. A call made while
    /// another is in progress returns immediately.
    pub fn process_actions(&self, ctx: &VirtualizationContext, now: Instant) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let snapshot: Vec<Arc<dyn VirtualizationAction>> = self.actions.lock().clone();
        for action in snapshot {
            if !action.is_due_to_run(now) {
                continue;
            }

            vtrace!(
                name = action.name(),
                thread_model = ?action.thread_model(),
                "ActionScheduler: dispatch"
            );
            match action.thread_model() {
                ThreadModel::UiThread => {
                    let run = Arc::clone(&action);
                    let done = ctx.run_on_ui(move || run.do_action());
                    ctx.spawn(done);
                }
                ThreadModel::Background => {
                    let run = Arc::clone(&action);
                    ctx.spawn_blocking(move || run.do_action());
                }
            }

            if !action.keep_in_actions_list() {
                self.actions.lock().retain(|a| !Arc::ptr_eq(a, &action));
                vtrace!(name = action.name(), "ActionScheduler: removed");
            }
        }

        self.processing.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ActionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionScheduler")
            .field("actions", &self.len())
            .field("processing", &self.is_processing())
            .finish()
    }
}
