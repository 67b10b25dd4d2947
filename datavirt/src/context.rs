use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::scheduler::{ActionScheduler, VirtualizationAction};
use crate::{Error, Result};

/// A unit of work that must run on the UI thread.
pub type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// Host-supplied function that runs a task on the UI thread.
///
/// The executor must schedule the task eagerly; the returned future only signals completion and
/// may be dropped without losing the task.
pub type UiExecutor = Arc<dyn Fn(UiTask) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared cancellation flag.
///
/// Clones observe the same flag. Tokens are compared by identity so a finished fetch only clears
/// its own entry from the request map.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelToken")
            .field(&self.is_cancelled())
            .finish()
    }
}

/// The coordination point shared by every cache and collection of one host.
///
/// Owns the UI executor, the runtime used for background work and the action scheduler. Pass it
/// explicitly to each pagination manager and collection; independent contexts never interfere.
pub struct VirtualizationContext {
    ui: UiExecutor,
    runtime: Handle,
    scheduler: ActionScheduler,
}

impl VirtualizationContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Runs `f` on the UI thread.
    pub fn run_on_ui(&self, f: impl FnOnce() + Send + 'static) -> BoxFuture<'static, ()> {
        (self.ui)(Box::new(f))
    }

    /// Spawns background work on the context runtime.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(fut)
    }

    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.runtime.spawn_blocking(f)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn scheduler(&self) -> &ActionScheduler {
        &self.scheduler
    }

    pub fn add_action(&self, action: Arc<dyn VirtualizationAction>) {
        self.scheduler.add_action(action);
    }

    /// Runs every due action once. Hosts call this from their own timer (e.g. every 10ms).
    pub fn process_actions(&self) {
        self.scheduler.process_actions(self, Instant::now());
    }

    /// Drives [`Self::process_actions`] from a tokio interval until the context is dropped.
    pub fn start_ticker(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                ctx.process_actions();
            }
        })
    }
}

impl fmt::Debug for VirtualizationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualizationContext")
            .field("pending_actions", &self.scheduler.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`VirtualizationContext`].
#[derive(Default)]
pub struct ContextBuilder {
    ui: Option<UiExecutor>,
    runtime: Option<Handle>,
}

impl ContextBuilder {
    pub fn ui_executor(
        mut self,
        executor: impl Fn(UiTask) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.ui = Some(Arc::new(executor));
        self
    }

    /// Runs UI tasks immediately on the calling thread.
    ///
    /// Suitable for hosts without thread affinity and for tests.
    pub fn inline_ui(self) -> Self {
        self.ui_executor(|task: UiTask| {
            task();
            futures::future::ready(()).boxed()
        })
    }

    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Fails with [`Error::UiExecutorMissing`] when no executor was supplied, and with
    /// [`Error::RuntimeMissing`] when no runtime was given and none is current.
    pub fn build(self) -> Result<Arc<VirtualizationContext>> {
        let ui = self.ui.ok_or(Error::UiExecutorMissing)?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| Error::RuntimeMissing)?,
        };
        vdebug!("VirtualizationContext::build");
        Ok(Arc::new(VirtualizationContext {
            ui,
            runtime,
            scheduler: ActionScheduler::new(),
        }))
    }
}
