use crate::closure::Closure;
use crate::error::Error;
use parking_lot::Mutex;
use std::sync::Arc;

/// Readiness of one direction of an fd.
#[derive(Debug, Default)]
enum State {
    #[default]
    NotReady,
    Ready,
    Waiting(Arc<Closure>),
    Shutdown(Error),
}

/// Hands a single readiness edge to at most one waiting closure.
#[derive(Debug, Default)]
pub(crate) struct Event {
    state: Mutex<State>,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&self) {
        *self.state.lock() = State::NotReady;
    }

    /// Registers `closure` for the next readiness edge. Returns true when a
    /// pending READY was consumed.
    ///
    /// # Panics
    ///
    /// If another closure is already waiting.
    #[track_caller]
    pub(crate) fn notify_on(&self, closure: Arc<Closure>) -> bool {
        let mut state = self.state.lock();
        let (error, consumed_ready) = match std::mem::take(&mut *state) {
            State::NotReady => {
                *state = State::Waiting(closure);
                return false;
            }
            State::Ready => (Error::NONE, true),
            State::Shutdown(cause) => {
                let error = shutdown_error(&cause);
                *state = State::Shutdown(cause);
                (error, false)
            }
            State::Waiting(pending) => {
                *state = State::Waiting(pending);
                drop(state);
                panic!("notify_on called while a previous closure is still pending");
            }
        };
        drop(state);

        closure.sched(error);
        consumed_ready
    }

    /// Records readiness. Returns true when a waiting closure was scheduled.
    pub(crate) fn set_ready(&self) -> bool {
        let mut state = self.state.lock();
        match std::mem::take(&mut *state) {
            State::NotReady | State::Ready => {
                *state = State::Ready;
                false
            }
            State::Waiting(closure) => {
                drop(state);
                closure.sched(Error::NONE);
                true
            }
            shutdown @ State::Shutdown(_) => {
                *state = shutdown;
                false
            }
        }
    }

    /// Moves to SHUTDOWN, failing any waiter. Returns true on the first call.
    pub(crate) fn set_shutdown(&self, why: Error) -> bool {
        let mut state = self.state.lock();
        let waiting = match std::mem::take(&mut *state) {
            shutdown @ State::Shutdown(_) => {
                *state = shutdown;
                return false;
            }
            State::Waiting(closure) => Some(closure),
            State::NotReady | State::Ready => None,
        };

        let error = shutdown_error(&why);
        *state = State::Shutdown(why);
        drop(state);

        if let Some(closure) = waiting {
            closure.sched(error);
        }
        true
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), State::Ready)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(*self.state.lock(), State::Shutdown(_))
    }

    #[cfg(test)]
    pub(crate) fn has_waiter(&self) -> bool {
        matches!(*self.state.lock(), State::Waiting(_))
    }
}

#[track_caller]
pub(crate) fn shutdown_error(cause: &Error) -> Error {
    Error::with_children("FD shutdown", [cause.clone()])
}
