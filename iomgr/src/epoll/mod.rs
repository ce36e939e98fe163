//! Epoll engine: fds live in polling islands which merge whenever a pollset
//! and an fd from different islands meet.

use crate::closure::{Closure, sched_opt};
use crate::deadline::Deadline;
use crate::error::{Error, append_error, log_if_error};
use crate::fd::{FdPool, FdRef, OrphanMode, mark_orphaned, orphaned_error};
use crate::pollset::{Phase, PollsetShared, PollsetWorker};
use crate::sys;
use crate::sys::epoll::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI};
use crate::utils::ScopeGuard;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;

mod island;
pub(crate) use island::{IslandPool, IslandRef, PollingIsland, with_latest};

#[cfg(test)]
mod tests;

const READABLE: u32 = EPOLLIN | EPOLLPRI | EPOLLERR | EPOLLHUP;
const WRITABLE: u32 = EPOLLOUT | EPOLLERR | EPOLLHUP;

/// Joins `fd` to the island of the pollset whose island slot is
/// `pollset_island`. Called with the pollset locked.
pub(crate) fn add_fd(pollset_island: &mut Option<IslandRef>, fd: &FdRef, pool: &Arc<IslandPool>) -> Error {
    let mut locked = fd.mu.lock();
    if fd.is_orphaned() {
        return Error::NONE;
    }

    let (joined, error) = match (pollset_island.as_ref(), locked.island.as_ref()) {
        (None, None) => match pool.create(Some(fd)) {
            Ok(island) => (island, Error::NONE),
            Err(e) => return e,
        },
        (Some(ours), None) => with_latest(ours.island(), |island, state| {
            let error = island.add_fd_locked(state, fd);
            (IslandRef::acquire(island), error)
        }),
        (None, Some(theirs)) => (IslandRef::acquire(&theirs.latest()), Error::NONE),
        (Some(ours), Some(theirs)) => island::merge(ours, theirs, pool.poison()),
    };

    let stale_fd = replace_island(&mut locked.island, &joined);
    drop(locked);
    let stale_pollset = replace_island(pollset_island, &joined);

    drop(stale_fd);
    drop(stale_pollset);
    error
}

fn replace_island(slot: &mut Option<IslandRef>, joined: &IslandRef) -> Option<IslandRef> {
    match slot {
        Some(current) if current.same_island(joined) => None,
        _ => slot.replace(joined.clone()),
    }
}

/// Orphans `fd`: it leaves its island, its waiters fail and `on_done` is
/// scheduled. Returns the raw fd for [`OrphanMode::Release`].
pub(crate) fn orphan(fd: &FdRef, on_done: Option<Arc<Closure>>, mode: OrphanMode) -> Option<RawFd> {
    let raw = fd.raw();
    let mut error = Error::NONE;

    let (removed, stale) = {
        let mut locked = fd.mu.lock();
        locked.on_done = on_done;
        mark_orphaned(fd);

        // Unregister before closing so a recycled descriptor number can
        // never be removed from an epoll set in our place.
        let skip_del = mode == OrphanMode::AlreadyClosed;
        let removed = locked.island.as_ref().and_then(|island| {
            with_latest(island.island(), |island, state| {
                island.remove_fd_locked(state, fd, skip_del, &mut error)
            })
        });
        let stale = locked.island.take();

        match mode {
            OrphanMode::Close => {
                if let Err(e) = sys::close(raw) {
                    append_error(&mut error, "fd_orphan", e.into());
                }
                locked.closed = true;
            }
            OrphanMode::Release => locked.released = true,
            OrphanMode::AlreadyClosed => locked.closed = true,
        }

        fd.shutdown_events(orphaned_error());
        sched_opt(locked.on_done.take(), error.clone());
        (removed, stale)
    };

    drop(removed);
    drop(stale);
    log_if_error("fd_orphan", error);
    (mode == OrphanMode::Release).then_some(raw)
}

/// One polling pass of `worker` over `island`.
pub(crate) fn work(
    fds: &FdPool,
    pool: &IslandPool,
    pollset: &Arc<PollsetShared>,
    worker: &PollsetWorker,
    island: &Arc<PollingIsland>,
    deadline: Deadline,
) -> Error {
    if !acquire_lease(island, worker, pool.max_pollers(), deadline) {
        return Error::NONE;
    }
    let _lease = ScopeGuard::new(|| release_lease(island));

    let mut events = Vec::with_capacity(pool.max_events());
    let mut error = Error::NONE;

    loop {
        {
            let mut wake = worker.lock();
            if wake.kicked {
                break;
            }
            wake.phase = Phase::PollingIsland(Arc::clone(island));
        }

        let res = island.epoll().wait(&mut events, deadline.to_millis_timeout());

        let signaled = {
            let mut wake = worker.lock();
            wake.phase = Phase::Idle;
            std::mem::take(&mut wake.signaled_island)
        };
        if signaled {
            island.pending_kicks().fetch_sub(1, Ordering::AcqRel);
        }

        let n = match res {
            Ok(n) => n,
            Err(e) if e.is_interrupted() => continue,
            Err(e) => {
                append_error(&mut error, "pollset_work", e.into());
                break;
            }
        };
        tracing::trace!(events = n, "epoll_wait returned");
        if n == 0 {
            break;
        }

        let mut woken = false;
        let mut done = false;
        for event in &events {
            let token = event.u64;
            let bits = event.events;

            match token {
                island::WAKEUP_TOKEN => {
                    woken = true;
                    if let Err(e) = island.wakeup().consume() {
                        append_error(&mut error, "pollset_work", e.into());
                    }
                }
                island::POISON_TOKEN => done = true,
                _ => {
                    let Some(fd) = fds.lookup(token) else {
                        continue;
                    };
                    if bits & READABLE != 0 {
                        fd.become_readable(Some(pollset));
                    }
                    if bits & WRITABLE != 0 {
                        fd.become_writable();
                    }
                    done = true;
                }
            }
        }

        if done || !error.is_none() || deadline.has_passed() {
            break;
        }

        // An edge consumed on behalf of another poller's kick is passed on.
        if woken && !worker.kicked() && island.pending_kicks().load(Ordering::Acquire) > 0 {
            if let Err(e) = island.wakeup().wakeup() {
                append_error(&mut error, "pollset_work", e.into());
                break;
            }
        }
    }

    error
}

/// Waits for one of the island's polling slots. Returns false when kicked
/// or timed out first.
fn acquire_lease(island: &PollingIsland, worker: &PollsetWorker, max_pollers: usize, deadline: Deadline) -> bool {
    let mut workers = island.workers.lock();
    if workers.pollers < max_pollers {
        workers.pollers += 1;
        return true;
    }

    workers.waiting.push_back(worker.clone());
    let mut wake = worker.lock();
    drop(workers);

    wake.phase = Phase::Waiting;
    while !wake.turn && !wake.kicked {
        match deadline.instant() {
            None => worker.condvar().wait(&mut wake),
            Some(at) => {
                if worker.condvar().wait_until(&mut wake, at).timed_out() {
                    break;
                }
            }
        }
    }
    wake.phase = Phase::Idle;
    let granted = std::mem::take(&mut wake.turn);
    drop(wake);

    if granted {
        return true;
    }

    let mut workers = island.workers.lock();
    if let Some(pos) = workers.waiting.iter().position(|w| w.ptr_eq(worker)) {
        workers.waiting.remove(pos);
        return false;
    }
    drop(workers);

    // Handed the lease while giving up on it; the caller polls once and
    // passes it on.
    std::mem::take(&mut worker.lock().turn)
}

/// Hands the slot to the oldest waiter, or frees it.
fn release_lease(island: &PollingIsland) {
    let mut workers = island.workers.lock();
    match workers.waiting.pop_front() {
        Some(next) => {
            let mut wake = next.lock();
            wake.turn = true;
            next.condvar().notify_one();
        }
        None => workers.pollers = workers.pollers.saturating_sub(1),
    }
}
