use crate::context;
use std::marker::PhantomData;

/// Scope in which scheduled closures accumulate on the current thread.
///
/// Scopes nest. Dropping the outermost one runs every queued closure,
/// including closures queued by the ones being run. Entry points that may
/// schedule closures open a scope before taking any lock, so callbacks
/// always run with no iomgr lock held.
#[must_use = "closures are flushed when the scope is dropped"]
pub struct ExecCtx {
    // Tied to the thread whose queue it flushes.
    _not_send: PhantomData<*const ()>,
}

impl ExecCtx {
    pub fn enter() -> Self {
        context::enter_exec_ctx();
        Self {
            _not_send: PhantomData,
        }
    }

    /// Runs queued closures until the queue is empty. Returns whether any
    /// closure ran.
    pub fn flush() -> bool {
        let mut ran = false;
        while let Some((closure, error)) = context::pop_closure() {
            closure.invoke(error);
            ran = true;
        }
        ran
    }
}

impl Drop for ExecCtx {
    fn drop(&mut self) {
        if context::exit_exec_ctx() == 0 {
            // Callbacks run inside a scope so what they schedule waits its
            // turn in this loop instead of flushing recursively.
            context::enter_exec_ctx();
            Self::flush();
            context::exit_exec_ctx();
        }
    }
}
