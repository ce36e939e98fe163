//! Deferred callbacks.
//!
//! A [`Closure`] pairs a callback with the [`ClosureScheduler`] that decides
//! where it runs. Readiness notifications, shutdown completions and orphan
//! completions are all delivered by scheduling a closure with an [`Error`]
//! (`Error::NONE` on success).

use crate::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

mod exec_ctx;
pub use exec_ctx::ExecCtx;

mod list;
pub use list::ClosureList;


/// Strategy deciding how a closure is executed.
pub trait ClosureScheduler: Send + Sync {
    /// Runs the closure now, on the calling thread.
    fn run(&self, closure: &Arc<Closure>, error: Error);

    /// Queues the closure to run later.
    fn sched(&self, closure: &Arc<Closure>, error: Error);
}

/// Default scheduler: `sched` defers to the calling thread's [`ExecCtx`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecCtxScheduler;

impl ClosureScheduler for ExecCtxScheduler {
    fn run(&self, closure: &Arc<Closure>, error: Error) {
        closure.invoke(error);
    }

    /// Queues on the calling thread's ExecCtx. With no scope open, a
    /// temporary one runs the closure before returning.
    fn sched(&self, closure: &Arc<Closure>, error: Error) {
        let _ctx = ExecCtx::enter();
        crate::context::push_closure(Arc::clone(closure), error);
    }
}

static EXEC_CTX_SCHEDULER: LazyLock<Arc<dyn ClosureScheduler>> =
    LazyLock::new(|| Arc::new(ExecCtxScheduler));

type Callback = Box<dyn Fn(Error) + Send + Sync>;

pub struct Closure {
    callback: Callback,
    scheduler: Arc<dyn ClosureScheduler>,

    // Set while queued, cleared right before the callback runs.
    scheduled: AtomicBool,
}

impl Closure {
    /// Creates a closure scheduled through the thread's execution context.
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        Self::with_scheduler(callback, Arc::clone(&EXEC_CTX_SCHEDULER))
    }

    pub fn with_scheduler<F>(callback: F, scheduler: Arc<dyn ClosureScheduler>) -> Arc<Self>
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        Arc::new(Self {
            callback: Box::new(callback),
            scheduler,
            scheduled: AtomicBool::new(false),
        })
    }

    /// Hands the closure to its scheduler for deferred execution.
    ///
    /// # Panics
    ///
    /// In debug builds, if the closure is already scheduled and has not run.
    #[track_caller]
    pub fn sched(self: &Arc<Self>, error: Error) {
        let was_scheduled = self.scheduled.swap(true, Ordering::AcqRel);
        debug_assert!(!was_scheduled, "closure scheduled twice without running");
        self.scheduler.sched(self, error);
    }

    /// Executes the closure inline through its scheduler.
    pub fn run(self: &Arc<Self>, error: Error) {
        self.scheduler.run(self, error);
    }

    /// Calls the callback. Schedulers use this to execute a closure they
    /// queued.
    pub fn invoke(&self, error: Error) {
        self.scheduled.store(false, Ordering::Release);
        (self.callback)(error);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("scheduled", &self.is_scheduled())
            .finish_non_exhaustive()
    }
}

/// Schedules `closure` if present, otherwise drops `error`.
pub(crate) fn sched_opt(closure: Option<Arc<Closure>>, error: Error) {
    if let Some(closure) = closure {
        closure.sched(error);
    }
}
