//! File descriptor handles.
//!
//! An [`Fd`] owns a raw descriptor registered with an engine. Readiness is
//! tracked per direction by an [`Event`] slot; pollsets, polling islands and
//! pollset-sets hold internal [`FdRef`]s so the state outlives the owner
//! until every holder lets go.

use crate::closure::{Closure, ExecCtx};
use crate::epoll::IslandRef;
use crate::error::Error;
use crate::pollset::{Pollset, PollsetShared, PollsetWorker};
use crate::runtime::PollStrategy;
use crate::sys;
use parking_lot::Mutex;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

mod event;
pub(crate) use event::{Event, shutdown_error};

mod pool;
pub(crate) use pool::FdPool;

#[cfg(test)]
mod tests;

/// What `orphan` does with the raw descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanMode {
    /// Close it.
    Close,
    /// Hand it back to the caller, open.
    Release,
    /// The caller already closed it.
    AlreadyClosed,
}

/// Poll engine bookkeeping: the workers currently polling this fd.
#[derive(Debug, Default)]
pub(crate) struct Watchers {
    pub(crate) read: Option<PollsetWorker>,
    pub(crate) write: Option<PollsetWorker>,
    /// Workers polling the fd without interest in either direction.
    pub(crate) inactive: Vec<PollsetWorker>,
}

impl Watchers {
    pub(crate) fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none() && self.inactive.is_empty()
    }
}

/// State guarded by the fd mutex.
#[derive(Debug, Default)]
pub(crate) struct FdLocked {
    pub(crate) name: String,
    /// Epoll engine: island the fd was last added to. May be stale.
    pub(crate) island: Option<IslandRef>,
    pub(crate) watchers: Watchers,
    pub(crate) closed: bool,
    pub(crate) released: bool,
    pub(crate) on_done: Option<Arc<Closure>>,
}

pub(crate) struct FdState {
    strategy: PollStrategy,
    slot: AtomicUsize,
    generation: AtomicU32,
    raw: AtomicI32,

    // The owner handle keeps `active` set until orphan. `refs` counts every
    // holder, owner included.
    active: AtomicBool,
    refs: AtomicUsize,

    pub(crate) read: Event,
    pub(crate) write: Event,
    pollhup: AtomicBool,
    read_notifier: Mutex<Option<Weak<PollsetShared>>>,

    pub(crate) mu: Mutex<FdLocked>,
    pool: Weak<FdPool>,
}

impl FdState {
    fn new(strategy: PollStrategy, pool: Weak<FdPool>) -> Self {
        Self {
            strategy,
            slot: AtomicUsize::new(0),
            generation: AtomicU32::new(0),
            raw: AtomicI32::new(-1),
            active: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            read: Event::new(),
            write: Event::new(),
            pollhup: AtomicBool::new(false),
            read_notifier: Mutex::new(None),
            mu: Mutex::new(FdLocked::default()),
            pool,
        }
    }

    // Only called by the pool on a state nobody references.
    fn reset(&self, raw: RawFd, name: &str, slot: usize, generation: u32) {
        self.slot.store(slot, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Release);
        self.raw.store(raw, Ordering::Relaxed);
        self.read.reset();
        self.write.reset();
        self.pollhup.store(false, Ordering::Relaxed);
        *self.read_notifier.lock() = None;
        *self.mu.lock() = FdLocked {
            name: format!("{name} fd={raw}"),
            ..FdLocked::default()
        };
        self.refs.store(1, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.raw.load(Ordering::Relaxed)
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::Relaxed)
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Epoll user data identifying this incarnation of the state.
    pub(crate) fn token(&self) -> u64 {
        (u64::from(self.generation()) << 32) | self.slot() as u64
    }

    pub(crate) fn strategy(&self) -> PollStrategy {
        self.strategy
    }

    pub(crate) fn is_orphaned(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }

    fn clear_active(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn saw_pollhup(&self) -> bool {
        self.pollhup.load(Ordering::Acquire)
    }

    pub(crate) fn set_pollhup(&self) {
        self.pollhup.store(true, Ordering::Release);
    }

    pub(crate) fn set_read_notifier(&self, pollset: &Arc<PollsetShared>) {
        *self.read_notifier.lock() = Some(Arc::downgrade(pollset));
    }

    /// Marks the fd readable and records which pollset saw it.
    pub(crate) fn become_readable(&self, notifier: Option<&Arc<PollsetShared>>) -> bool {
        if let Some(pollset) = notifier {
            self.set_read_notifier(pollset);
        }
        self.read.set_ready()
    }

    pub(crate) fn become_writable(&self) -> bool {
        self.write.set_ready()
    }

    /// Moves both directions to SHUTDOWN. Only the first call has effect.
    pub(crate) fn shutdown_events(&self, why: Error) -> bool {
        if !self.read.set_shutdown(why.clone()) {
            return false;
        }
        self.write.set_shutdown(why);
        true
    }
}

impl fmt::Debug for FdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdState")
            .field("raw", &self.raw())
            .field("slot", &self.slot())
            .field("generation", &self.generation())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("orphaned", &self.is_orphaned())
            .finish_non_exhaustive()
    }
}

/// Counted reference to an fd state. The last drop returns the state to its
/// pool.
pub(crate) struct FdRef(Arc<FdState>);

impl FdRef {
    /// Wraps a state whose count already includes this reference.
    fn adopt(state: Arc<FdState>) -> Self {
        FdRef(state)
    }

    /// Takes a reference unless the count already dropped to zero.
    pub(crate) fn try_new(state: &Arc<FdState>) -> Option<Self> {
        state
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .ok()
            .map(|_| FdRef(Arc::clone(state)))
    }

    pub(crate) fn state(&self) -> &Arc<FdState> {
        &self.0
    }

    pub(crate) fn ptr_eq(&self, other: &FdRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Clone for FdRef {
    fn clone(&self) -> Self {
        self.0.refs.fetch_add(1, Ordering::Relaxed);
        FdRef(Arc::clone(&self.0))
    }
}

impl Drop for FdRef {
    fn drop(&mut self) {
        if self.0.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(pool) = self.0.pool.upgrade() {
            pool.release(&self.0);
        }
    }
}

impl std::ops::Deref for FdRef {
    type Target = FdState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for FdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owner handle for a registered descriptor.
///
/// Dropping an `Fd` without calling [`Fd::orphan`] orphans it with
/// [`OrphanMode::Close`].
pub struct Fd {
    inner: FdRef,
}

impl Fd {
    pub(crate) fn new(inner: FdRef) -> Self {
        Self { inner }
    }

    pub(crate) fn as_ref(&self) -> &FdRef {
        &self.inner
    }

    pub fn name(&self) -> String {
        self.inner.mu.lock().name.clone()
    }

    /// The raw descriptor, or `None` once released or closed.
    pub fn wrapped_fd(&self) -> Option<RawFd> {
        let locked = self.inner.mu.lock();
        (!locked.released && !locked.closed && !self.inner.is_orphaned()).then(|| self.inner.raw())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.read.is_shutdown()
    }

    /// Schedules `closure` once the fd is readable.
    ///
    /// # Panics
    ///
    /// If a previous read closure is still pending.
    #[track_caller]
    pub fn notify_on_read(&self, closure: Arc<Closure>) {
        let _ctx = ExecCtx::enter();
        match self.inner.strategy() {
            PollStrategy::Epoll => {
                self.inner.read.notify_on(closure);
            }
            PollStrategy::Poll => crate::poll::notify_on(&self.inner, &self.inner.read, closure),
        }
    }

    /// Schedules `closure` once the fd is writable.
    ///
    /// # Panics
    ///
    /// If a previous write closure is still pending.
    #[track_caller]
    pub fn notify_on_write(&self, closure: Arc<Closure>) {
        let _ctx = ExecCtx::enter();
        match self.inner.strategy() {
            PollStrategy::Epoll => {
                self.inner.write.notify_on(closure);
            }
            PollStrategy::Poll => crate::poll::notify_on(&self.inner, &self.inner.write, closure),
        }
    }

    /// Fails pending and future notifications with `why` and shuts the
    /// socket down in both directions. Later calls drop `why`.
    pub fn shutdown(&self, why: Error) {
        let _ctx = ExecCtx::enter();
        let _locked = match self.inner.strategy() {
            PollStrategy::Poll => Some(self.inner.mu.lock()),
            PollStrategy::Epoll => None,
        };

        if !self.inner.shutdown_events(why) {
            return;
        }
        if let Err(e) = sys::shutdown_rdwr(self.inner.raw()) {
            tracing::trace!(fd = self.inner.raw(), error = %e, "shutdown(SHUT_RDWR) failed");
        }
    }

    /// Pollset whose poller most recently saw this fd readable.
    pub fn read_notifier_pollset(&self) -> Option<Pollset> {
        self.inner
            .read_notifier
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Pollset::from_shared)
    }

    /// Gives up ownership. Pending notifications fail with "FD orphaned",
    /// the descriptor is handled according to `mode`, and `on_done` is
    /// scheduled once the engine no longer uses it.
    ///
    /// Returns the descriptor for [`OrphanMode::Release`].
    pub fn orphan(self, on_done: Option<Arc<Closure>>, mode: OrphanMode, reason: &str) -> Option<RawFd> {
        tracing::debug!(fd = self.inner.raw(), ?mode, reason, "orphan");
        let _ctx = ExecCtx::enter();
        match self.inner.strategy() {
            PollStrategy::Epoll => crate::epoll::orphan(&self.inner, on_done, mode),
            PollStrategy::Poll => crate::poll::orphan(&self.inner, on_done, mode),
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.inner.is_orphaned() {
            return;
        }
        let _ctx = ExecCtx::enter();
        match self.inner.strategy() {
            PollStrategy::Epoll => crate::epoll::orphan(&self.inner, None, OrphanMode::Close),
            PollStrategy::Poll => crate::poll::orphan(&self.inner, None, OrphanMode::Close),
        };
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fd").field("state", &self.inner).finish()
    }
}

/// Clears the active flag. Returns false if the fd was already orphaned.
pub(crate) fn mark_orphaned(state: &FdState) -> bool {
    let was_active = !state.is_orphaned();
    state.clear_active();
    was_active
}

/// Error used to resolve waiters of an orphaned fd.
#[track_caller]
pub(crate) fn orphaned_error() -> Error {
    Error::new("FD orphaned")
}

/// Identity of the polling island `fd` belongs to, resolved through any
/// merges. Always `None` under the poll engine.
pub fn fd_island_id(fd: &Fd) -> Option<u64> {
    let locked = fd.inner.mu.lock();
    locked.island.as_ref().map(|island| island.latest_id().as_u64())
}
