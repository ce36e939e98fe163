use crate::error::{Error, append_error};
use crate::fd::FdRef;
use crate::pollset::PollsetWorker;
use crate::sys::WakeupFd;
use crate::sys::epoll::{EPOLLET, EPOLLIN, EPOLLOUT, Epoll};
use crate::utils::IslandId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Epoll user data of the island's own wakeup fd.
pub(crate) const WAKEUP_TOKEN: u64 = u64::MAX;
/// Epoll user data of the engine-wide merge wakeup fd.
pub(crate) const POISON_TOKEN: u64 = u64::MAX - 1;

/// Interest registered for every fd: both directions, edge-triggered.
const FD_EVENTS: u32 = EPOLLIN | EPOLLOUT | EPOLLET;

pub(crate) struct IslandState {
    pub(crate) id: IslandId,
    pub(crate) fds: Vec<FdRef>,
    /// Set once this island was merged away.
    pub(crate) became: Option<IslandRef>,
}

/// Polling lease bookkeeping.
#[derive(Default)]
pub(crate) struct IslandWorkers {
    pub(crate) pollers: usize,
    pub(crate) waiting: VecDeque<PollsetWorker>,
}

/// An epoll set shared by every pollset and fd that were ever added
/// together.
pub(crate) struct PollingIsland {
    epoll: Epoll,
    wakeup: WakeupFd,
    refs: AtomicUsize,
    // Kicks delivered through `wakeup` whose target has not left
    // `epoll_wait` yet.
    pending_kicks: AtomicUsize,
    pub(crate) state: Mutex<IslandState>,
    pub(crate) workers: Mutex<IslandWorkers>,
    pool: Weak<IslandPool>,
}

impl PollingIsland {
    fn new(pool: Weak<IslandPool>) -> Result<Self, Error> {
        let epoll = Epoll::new()?;
        let wakeup = WakeupFd::new()?;
        epoll.add(wakeup.as_raw_fd(), WAKEUP_TOKEN, EPOLLIN | EPOLLET)?;

        Ok(Self {
            epoll,
            wakeup,
            refs: AtomicUsize::new(0),
            pending_kicks: AtomicUsize::new(0),
            state: Mutex::new(IslandState {
                id: IslandId::next(),
                fds: Vec::new(),
                became: None,
            }),
            workers: Mutex::new(IslandWorkers::default()),
            pool,
        })
    }

    /// Prepares a pooled island for reuse.
    fn recycle(&self, poison: &WakeupFd) -> Result<(), Error> {
        self.epoll.delete(poison.as_raw_fd())?;
        self.wakeup.consume()?;
        self.pending_kicks.store(0, Ordering::Release);

        let mut state = self.state.lock();
        debug_assert!(state.fds.is_empty() && state.became.is_none());
        state.id = IslandId::next();
        Ok(())
    }

    pub(crate) fn epoll(&self) -> &Epoll {
        &self.epoll
    }

    pub(crate) fn wakeup(&self) -> &WakeupFd {
        &self.wakeup
    }

    pub(crate) fn pending_kicks(&self) -> &AtomicUsize {
        &self.pending_kicks
    }

    /// Registers `fd` and takes a reference on it. A failed registration
    /// leaves the fd out of the list.
    pub(crate) fn add_fd_locked(&self, state: &mut IslandState, fd: &FdRef) -> Error {
        if let Err(e) = self.epoll.add(fd.raw(), fd.token(), FD_EVENTS) {
            return Error::with_children("add_fd_locked", [e.into()]);
        }
        if !state.fds.iter().any(|held| held.ptr_eq(fd)) {
            state.fds.push(fd.clone());
        }
        tracing::trace!(island = %state.id, fd = fd.raw(), "added fd to polling island");
        Error::NONE
    }

    /// Drops `fd` from the list, unregistering it unless `skip_del`. The
    /// removed reference is handed back so it can be released unlocked.
    pub(crate) fn remove_fd_locked(
        &self,
        state: &mut IslandState,
        fd: &FdRef,
        skip_del: bool,
        error: &mut Error,
    ) -> Option<FdRef> {
        if !skip_del {
            if let Err(e) = self.epoll.delete(fd.raw()) {
                append_error(error, "remove_fd", e.into());
            }
        }
        let pos = state.fds.iter().position(|held| held.ptr_eq(fd))?;
        Some(state.fds.swap_remove(pos))
    }

    /// Moves the fds of the smaller island (`a` or `b`) into the other one
    /// and forwards it there. Returns the survivor.
    fn merge_locked<'a>(
        a: (&'a Arc<PollingIsland>, &'a mut IslandState),
        b: (&'a Arc<PollingIsland>, &'a mut IslandState),
        poison: &WakeupFd,
        error: &mut Error,
    ) -> &'a Arc<PollingIsland> {
        let ((p, p_state), (q, q_state)) = if a.1.fds.len() > b.1.fds.len() {
            (b, a)
        } else {
            (a, b)
        };

        for fd in &p_state.fds {
            if let Err(e) = q.epoll.add(fd.raw(), fd.token(), FD_EVENTS) {
                append_error(error, "merge", e.into());
            }
        }
        for fd in &p_state.fds {
            if let Err(e) = p.epoll.delete(fd.raw()) {
                append_error(error, "merge", e.into());
            }
        }
        // Level-triggered so every poller parked in `p` sees it.
        if let Err(e) = p.epoll.add(poison.as_raw_fd(), POISON_TOKEN, EPOLLIN) {
            append_error(error, "merge", e.into());
        }

        tracing::trace!(
            from = %p_state.id,
            into = %q_state.id,
            fds = p_state.fds.len(),
            "merged polling islands"
        );

        let moved = std::mem::take(&mut p_state.fds);
        for fd in moved {
            if !q_state.fds.iter().any(|held| held.ptr_eq(&fd)) {
                q_state.fds.push(fd);
            }
        }
        p_state.became = Some(IslandRef::acquire(q));
        q
    }

    /// Called when the last reference goes away.
    fn release(self: &Arc<Self>) {
        let became = {
            let mut state = self.state.lock();
            debug_assert!(state.fds.is_empty(), "island released with fds");
            tracing::trace!(island = %state.id, "polling island released");
            state.fds.clear();
            state.became.take()
        };

        if let Some(pool) = self.pool.upgrade() {
            pool.free.lock().push(Arc::clone(self));
        }
        drop(became);
    }
}

impl fmt::Debug for PollingIsland {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingIsland")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Counted reference to a polling island. Forwarding pointers, pollsets and
/// fds all hold one.
pub(crate) struct IslandRef(Arc<PollingIsland>);

impl IslandRef {
    /// The island must already be kept alive by another reference.
    pub(crate) fn acquire(island: &Arc<PollingIsland>) -> Self {
        island.refs.fetch_add(1, Ordering::Relaxed);
        IslandRef(Arc::clone(island))
    }

    pub(crate) fn island(&self) -> &Arc<PollingIsland> {
        &self.0
    }

    /// Representative island at the time of the call.
    pub(crate) fn latest(&self) -> Arc<PollingIsland> {
        let mut current = Arc::clone(&self.0);
        loop {
            let next = current.state.lock().became.as_ref().map(|r| Arc::clone(&r.0));
            match next {
                Some(next) => current = next,
                None => return current,
            }
        }
    }

    pub(crate) fn latest_id(&self) -> IslandId {
        with_latest(&self.0, |_, state| state.id)
    }

    /// Points this reference at the representative, releasing the stale
    /// island.
    pub(crate) fn refresh(&mut self) {
        let latest = self.latest();
        if Arc::ptr_eq(&latest, &self.0) {
            return;
        }
        let stale = std::mem::replace(self, IslandRef::acquire(&latest));
        drop(stale);
    }

    pub(crate) fn same_island(&self, other: &IslandRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Clone for IslandRef {
    fn clone(&self) -> Self {
        IslandRef::acquire(&self.0)
    }
}

impl Drop for IslandRef {
    fn drop(&mut self) {
        if self.0.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.release();
        }
    }
}

impl fmt::Debug for IslandRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runs `f` with the representative of `start` locked.
pub(crate) fn with_latest<R>(
    start: &Arc<PollingIsland>,
    f: impl FnOnce(&Arc<PollingIsland>, &mut IslandState) -> R,
) -> R {
    let mut current = Arc::clone(start);
    loop {
        let mut state = current.state.lock();
        let next = state.became.as_ref().map(|r| Arc::clone(&r.0));
        match next {
            Some(next) => {
                drop(state);
                current = next;
            }
            None => return f(&current, &mut state),
        }
    }
}

pub(crate) enum LockedPair<'a> {
    Same(&'a Arc<PollingIsland>, &'a mut IslandState),
    Distinct(
        (&'a Arc<PollingIsland>, &'a mut IslandState),
        (&'a Arc<PollingIsland>, &'a mut IslandState),
    ),
}

/// Locks the representatives of `a` and `b`, lower address first, retrying
/// while either one gets forwarded.
pub(crate) fn with_latest_pair<R>(
    a: &IslandRef,
    b: &IslandRef,
    f: impl FnOnce(LockedPair<'_>) -> R,
) -> R {
    loop {
        let a_latest = a.latest();
        let b_latest = b.latest();

        if Arc::ptr_eq(&a_latest, &b_latest) {
            return with_latest(&a_latest, |island, state| f(LockedPair::Same(island, state)));
        }

        let a_first = Arc::as_ptr(&a_latest) < Arc::as_ptr(&b_latest);
        let (first, second) = if a_first {
            (&a_latest, &b_latest)
        } else {
            (&b_latest, &a_latest)
        };

        let mut first_state = first.state.lock();
        let mut second_state = second.state.lock();
        if first_state.became.is_some() || second_state.became.is_some() {
            continue;
        }

        let (a_state, b_state) = if a_first {
            (&mut *first_state, &mut *second_state)
        } else {
            (&mut *second_state, &mut *first_state)
        };
        return f(LockedPair::Distinct((&a_latest, a_state), (&b_latest, b_state)));
    }
}

/// Merges the islands behind `a` and `b`. Returns a reference to the
/// survivor and any registration errors.
pub(crate) fn merge(a: &IslandRef, b: &IslandRef, poison: &WakeupFd) -> (IslandRef, Error) {
    with_latest_pair(a, b, |pair| match pair {
        LockedPair::Same(island, _) => (IslandRef::acquire(island), Error::NONE),
        LockedPair::Distinct(a, b) => {
            let mut error = Error::NONE;
            let survivor = PollingIsland::merge_locked(a, b, poison, &mut error);
            (IslandRef::acquire(survivor), error)
        }
    })
}

/// Owns the island freelist and the engine's merge wakeup fd.
pub(crate) struct IslandPool {
    free: Mutex<Vec<Arc<PollingIsland>>>,
    poison: WakeupFd,
    max_pollers: usize,
    max_events: usize,
}

impl IslandPool {
    pub(crate) fn new(max_pollers: usize, max_events: usize) -> Result<Arc<Self>, Error> {
        let poison = WakeupFd::new()?;
        // Never consumed: stays readable for the engine's lifetime.
        poison.wakeup()?;

        Ok(Arc::new(Self {
            free: Mutex::new(Vec::new()),
            poison,
            max_pollers: max_pollers.max(1),
            max_events: max_events.max(1),
        }))
    }

    pub(crate) fn poison(&self) -> &WakeupFd {
        &self.poison
    }

    pub(crate) fn max_pollers(&self) -> usize {
        self.max_pollers
    }

    pub(crate) fn max_events(&self) -> usize {
        self.max_events
    }

    /// Returns the caller's reference to a fresh island holding `initial`.
    pub(crate) fn create(self: &Arc<Self>, initial: Option<&FdRef>) -> Result<IslandRef, Error> {
        let pooled = self.free.lock().pop();
        let island = match pooled {
            Some(island) => {
                island.recycle(&self.poison)?;
                island
            }
            None => Arc::new(PollingIsland::new(Arc::downgrade(self))?),
        };

        let island = IslandRef::acquire(&island);
        let error = match initial {
            Some(fd) => island.0.add_fd_locked(&mut island.0.state.lock(), fd),
            None => Error::NONE,
        };
        if !error.is_none() {
            return Err(error);
        }

        tracing::trace!(island = %island.latest_id(), "polling island created");
        Ok(island)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn clear_freelist(&self) {
        let free = std::mem::take(&mut *self.free.lock());
        drop(free);
    }
}

impl fmt::Debug for IslandPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IslandPool")
            .field("free", &self.free_count())
            .field("max_pollers", &self.max_pollers)
            .field("max_events", &self.max_events)
            .finish_non_exhaustive()
    }
}
