//! Poll engine: every `work` call builds a `pollfd` array from the pollset's
//! fds. Workers register as fd watchers so readiness and orphaning can kick
//! exactly the threads that are polling a descriptor.

use crate::closure::{Closure, sched_opt};
use crate::deadline::Deadline;
use crate::error::{Error, IntProperty, StatusCode, append_error, log_if_error};
use crate::fd::{Event, FdLocked, FdRef, FdState, OrphanMode, mark_orphaned, orphaned_error};
use crate::pollset::{PollsetShared, PollsetWorker};
use crate::sys;
use crate::sys::poll::{POLLERR, POLLHUP, POLLIN, POLLOUT};
use smallvec::SmallVec;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;


const POLLIN_CHECK: i16 = POLLIN | POLLHUP | POLLERR;
const POLLOUT_CHECK: i16 = POLLOUT | POLLHUP | POLLERR;

/// `pollfd` entries kept inline before spilling to the heap.
const INLINE_PFDS: usize = 16;

pub(crate) fn notify_on(fd: &FdState, event: &Event, closure: Arc<Closure>) {
    let locked = fd.mu.lock();

    if fd.saw_pollhup() && !event.is_shutdown() {
        drop(locked);
        closure.sched(
            Error::new("FD shutdown").set_int(IntProperty::GrpcStatus, StatusCode::Unavailable as i64),
        );
        return;
    }

    if event.notify_on(closure) {
        maybe_wake_one_watcher(&locked);
    }
}

pub(crate) fn orphan(fd: &FdRef, on_done: Option<Arc<Closure>>, mode: OrphanMode) -> Option<RawFd> {
    let raw = fd.raw();
    let mut locked = fd.mu.lock();
    locked.on_done = on_done;

    match mode {
        OrphanMode::Close => {}
        OrphanMode::Release | OrphanMode::AlreadyClosed => locked.released = true,
    }

    mark_orphaned(fd);
    fd.shutdown_events(orphaned_error());

    if locked.watchers.is_empty() {
        close_fd_locked(fd, &mut locked);
    } else {
        // The last watcher to leave `end_poll` closes it.
        wake_all_watchers(&locked);
    }

    (mode == OrphanMode::Release).then_some(raw)
}

fn close_fd_locked(fd: &FdState, locked: &mut FdLocked) {
    locked.closed = true;
    let error = if locked.released {
        Error::NONE
    } else {
        sys::close(fd.raw()).map_or_else(Error::from, |_| Error::NONE)
    };
    sched_opt(locked.on_done.take(), error);
}

fn kick_watcher(worker: &PollsetWorker) {
    log_if_error("fd_kick", worker.wake_specifically(true));
}

/// Prefers an idle watcher, then the read watcher, then the write watcher.
fn maybe_wake_one_watcher(locked: &FdLocked) {
    let watchers = &locked.watchers;
    let target = watchers
        .inactive
        .first()
        .or(watchers.read.as_ref())
        .or(watchers.write.as_ref());

    if let Some(worker) = target {
        kick_watcher(worker);
    }
}

fn wake_all_watchers(locked: &FdLocked) {
    let watchers = &locked.watchers;
    for worker in &watchers.inactive {
        kick_watcher(worker);
    }
    if let Some(read) = &watchers.read {
        kick_watcher(read);
    }
    if let Some(write) = &watchers.write {
        let same = watchers.read.as_ref().is_some_and(|read| read.ptr_eq(write));
        if !same {
            kick_watcher(write);
        }
    }
}

/// Registers `worker` as a watcher. Returns the interest mask to poll for,
/// or `None` if the fd is shut down and must not be watched.
fn begin_poll(fd: &FdState, worker: &PollsetWorker, read_mask: i16, write_mask: i16) -> Option<i16> {
    let mut locked = fd.mu.lock();
    if fd.read.is_shutdown() {
        return None;
    }

    let mut mask = 0;
    if read_mask != 0 && locked.watchers.read.is_none() && !fd.read.is_ready() {
        locked.watchers.read = Some(worker.clone());
        mask |= read_mask;
    }
    if write_mask != 0 && locked.watchers.write.is_none() && !fd.write.is_ready() {
        locked.watchers.write = Some(worker.clone());
        mask |= write_mask;
    }
    if mask == 0 {
        locked.watchers.inactive.push(worker.clone());
    }
    Some(mask)
}

/// Detaches `worker` and applies what `poll` reported.
fn end_poll(
    fd: &FdState,
    worker: &PollsetWorker,
    got_read: bool,
    got_write: bool,
    notifier: &Arc<PollsetShared>,
) {
    let mut locked = fd.mu.lock();
    let mut was_polling = false;
    let mut kick = false;

    if locked.watchers.read.as_ref().is_some_and(|w| w.ptr_eq(worker)) {
        locked.watchers.read = None;
        was_polling = true;
        kick |= !got_read;
    }
    if locked.watchers.write.as_ref().is_some_and(|w| w.ptr_eq(worker)) {
        locked.watchers.write = None;
        was_polling = true;
        kick |= !got_write;
    }
    if !was_polling {
        if let Some(pos) = locked.watchers.inactive.iter().position(|w| w.ptr_eq(worker)) {
            locked.watchers.inactive.swap_remove(pos);
        }
    }

    if got_read && fd.become_readable(Some(notifier)) {
        kick = true;
    }
    if got_write && fd.become_writable() {
        kick = true;
    }

    if kick {
        maybe_wake_one_watcher(&locked);
    }
    if fd.is_orphaned() && locked.watchers.is_empty() && !locked.closed {
        close_fd_locked(fd, &mut locked);
    }
}

/// One `poll` pass of `worker` over `fds`.
pub(crate) fn work(
    pollset: &Arc<PollsetShared>,
    worker: &PollsetWorker,
    fds: &[FdRef],
    deadline: Deadline,
) -> Error {
    let Some(wakeup) = worker.wakeup_fd() else {
        return Error::new("pollset_work: worker has no wakeup fd");
    };

    let mut pfds: SmallVec<[libc::pollfd; INLINE_PFDS]> = SmallVec::with_capacity(fds.len() + 1);
    pfds.push(libc::pollfd {
        fd: wakeup.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    });

    let mut watched: SmallVec<[&FdRef; INLINE_PFDS]> = SmallVec::with_capacity(fds.len());
    for fd in fds {
        if let Some(mask) = begin_poll(fd, worker, POLLIN, POLLOUT) {
            pfds.push(libc::pollfd {
                fd: fd.raw(),
                events: mask,
                revents: 0,
            });
            watched.push(fd);
        }
    }

    let res = loop {
        match sys::poll::poll(&mut pfds, deadline.to_millis_timeout()) {
            Err(e) if e.is_interrupted() => continue,
            res => break res,
        }
    };

    let mut error = Error::NONE;
    match res {
        Err(e) => {
            append_error(&mut error, "pollset_work", e.into());
            // Wake everything; the bad fd gets found on the next pass.
            for fd in &watched {
                end_poll(fd, worker, true, true, pollset);
            }
        }
        Ok(0) => {
            for fd in &watched {
                end_poll(fd, worker, false, false, pollset);
            }
        }
        Ok(n) => {
            tracing::trace!(ready = n, "poll returned");
            if pfds[0].revents & POLLIN_CHECK != 0 {
                if let Err(e) = wakeup.consume() {
                    append_error(&mut error, "pollset_work", e.into());
                }
            }
            for (fd, pfd) in watched.iter().zip(&pfds[1..]) {
                if pfd.revents & POLLHUP != 0 {
                    fd.set_pollhup();
                }
                end_poll(
                    fd,
                    worker,
                    pfd.revents & POLLIN_CHECK != 0,
                    pfd.revents & POLLOUT_CHECK != 0,
                    pollset,
                );
            }
        }
    }

    error
}
