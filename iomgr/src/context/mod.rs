use crate::closure::Closure;
use crate::error::Error;
use crate::utils::{PollsetId, WorkerId};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread_local;

/// Per-thread state: the deferred closure queue of the execution context and
/// the pollset/worker the thread is currently polling for.
pub(crate) struct Context {
    queue: RefCell<VecDeque<(Arc<Closure>, Error)>>,
    depth: Cell<usize>,
    pollset: Cell<Option<PollsetId>>,
    worker: Cell<Option<WorkerId>>,
}

thread_local! {
    static CONTEXT: Context = const {
        Context {
            queue: RefCell::new(VecDeque::new()),
            depth: Cell::new(0),
            pollset: Cell::new(None),
            worker: Cell::new(None),
        }
    };
}

#[inline(always)]
fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&Context) -> R,
{
    CONTEXT.with(f)
}

pub(crate) fn push_closure(closure: Arc<Closure>, error: Error) {
    with_context(|ctx| ctx.queue.borrow_mut().push_back((closure, error)));
}

// The borrow ends before the caller runs the closure, so callbacks may
// schedule more work.
pub(crate) fn pop_closure() -> Option<(Arc<Closure>, Error)> {
    with_context(|ctx| ctx.queue.borrow_mut().pop_front())
}

pub(crate) fn enter_exec_ctx() -> usize {
    with_context(|ctx| {
        let depth = ctx.depth.get() + 1;
        ctx.depth.set(depth);
        depth
    })
}

/// Returns the depth left after leaving.
pub(crate) fn exit_exec_ctx() -> usize {
    with_context(|ctx| {
        let depth = ctx.depth.get().saturating_sub(1);
        ctx.depth.set(depth);
        depth
    })
}

pub(crate) fn current_pollset() -> Option<PollsetId> {
    with_context(|ctx| ctx.pollset.get())
}

pub(crate) fn current_worker() -> Option<WorkerId> {
    with_context(|ctx| ctx.worker.get())
}

/// Installs the polling identity of this thread, returning the previous one.
pub(crate) fn set_current_polling(
    pollset: Option<PollsetId>,
    worker: Option<WorkerId>,
) -> (Option<PollsetId>, Option<WorkerId>) {
    with_context(|ctx| (ctx.pollset.replace(pollset), ctx.worker.replace(worker)))
}
