//! Pollsets: the sets of fds a group of worker threads poll together.
//!
//! A thread calls [`Pollset::work`] to block until an fd it cares about
//! becomes ready, a kick arrives, or its deadline passes. Ready fds schedule
//! their closures on the polling thread, which runs them before `work`
//! returns.

use crate::closure::{Closure, ExecCtx};
use crate::context;
use crate::deadline::Deadline;
use crate::epoll::{self, IslandPool, IslandRef};
use crate::error::{Error, append_error, log_if_error};
use crate::fd::{Fd, FdRef};
use crate::poll;
use crate::runtime::{EngineShared, PollStrategy};
use crate::sys::WakeupFd;
use crate::utils::{PollsetId, ScopeGuard};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

mod worker;
pub(crate) use worker::Phase;
pub use worker::PollsetWorker;


/// Which workers a [`Pollset::kick`] wakes.
#[derive(Debug, Clone, Copy)]
pub enum Kick<'a> {
    /// One parked worker, rotated round-robin. Ignored when called from a
    /// thread polling this same pollset.
    Any,
    /// Every worker but the caller's own.
    Broadcast,
    /// This worker.
    Worker(&'a PollsetWorker),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct KickFlags: u8 {
        /// A worker may kick itself.
        const CAN_KICK_SELF = 1;

        /// The kicked worker rebuilds its poll set and polls again instead of
        /// returning.
        const REEVALUATE_POLLING_ON_WAKEUP = 1 << 1;
    }
}

pub(crate) enum Backend {
    Epoll {
        pool: Arc<IslandPool>,
        island: Option<IslandRef>,
    },
    Poll {
        fds: Vec<FdRef>,
    },
}

/// What one polling round works on, captured under the pollset lock.
enum Round {
    Epoll(Arc<IslandPool>, IslandRef),
    Poll(Vec<FdRef>),
}

pub(crate) struct PollsetState {
    workers: VecDeque<PollsetWorker>,
    kicked_without_pollers: bool,
    shutting_down: bool,
    called_shutdown: bool,
    shutdown_done: Option<Arc<Closure>>,
    pollset_set_count: usize,
    wakeup_cache: Vec<Arc<WakeupFd>>,
    backend: Backend,
}

impl PollsetState {
    fn has_observers(&self) -> bool {
        !self.workers.is_empty() || self.pollset_set_count > 0
    }

    fn prepare_round(&mut self) -> Result<Round, Error> {
        match &mut self.backend {
            Backend::Epoll { pool, island } => {
                let working = match island.as_mut() {
                    Some(current) => {
                        current.refresh();
                        current.clone()
                    }
                    None => {
                        let created = pool.create(None)?;
                        *island = Some(created.clone());
                        created
                    }
                };
                Ok(Round::Epoll(Arc::clone(pool), working))
            }
            Backend::Poll { fds } => {
                let (orphaned, live): (Vec<_>, Vec<_>) =
                    std::mem::take(fds).into_iter().partition(|fd| fd.is_orphaned());
                *fds = live;
                drop(orphaned);

                let polled = fds.iter().filter(|fd| !fd.saw_pollhup()).cloned().collect();
                Ok(Round::Poll(polled))
            }
        }
    }

    fn take_wakeup_fd(&mut self) -> Result<Arc<WakeupFd>, Error> {
        match self.wakeup_cache.pop() {
            Some(fd) => Ok(fd),
            None => Ok(Arc::new(WakeupFd::new()?)),
        }
    }

    /// Drops the backend's references, returning them so they are released
    /// after unlocking.
    fn release_backend(&mut self) -> (Option<IslandRef>, Vec<FdRef>) {
        match &mut self.backend {
            Backend::Epoll { island, .. } => (island.take(), Vec::new()),
            Backend::Poll { fds } => (None, std::mem::take(fds)),
        }
    }

    fn finish_shutdown(&mut self) -> (Option<Arc<Closure>>, (Option<IslandRef>, Vec<FdRef>)) {
        self.called_shutdown = true;
        (self.shutdown_done.take(), self.release_backend())
    }

    /// Pops the next worker round-robin, skipping the calling thread's own
    /// worker unless `can_kick_self`.
    fn next_worker(&mut self, can_kick_self: bool) -> Option<PollsetWorker> {
        let me = context::current_worker();
        let mut worker = self.workers.pop_front()?;

        if Some(worker.id()) == me {
            self.workers.push_back(worker);
            worker = self.workers.pop_front()?;
            if !can_kick_self && Some(worker.id()) == me {
                self.workers.push_back(worker);
                return None;
            }
        }

        self.workers.push_back(worker.clone());
        Some(worker)
    }

    #[track_caller]
    fn kick(&mut self, id: PollsetId, target: Kick<'_>, flags: KickFlags) -> Error {
        let mut error = Error::NONE;

        match target {
            Kick::Broadcast => {
                assert!(
                    !flags.contains(KickFlags::REEVALUATE_POLLING_ON_WAKEUP),
                    "broadcast kicks cannot ask to reevaluate polling"
                );
                let me = context::current_worker();
                for worker in self.workers.iter().filter(|w| Some(w.id()) != me) {
                    append_error(&mut error, "Kick Failure", worker.wake());
                }
                self.kicked_without_pollers = true;
            }
            Kick::Worker(worker) => {
                let is_self = context::current_worker() == Some(worker.id());
                if !is_self || flags.contains(KickFlags::CAN_KICK_SELF) {
                    let reevaluate = flags.contains(KickFlags::REEVALUATE_POLLING_ON_WAKEUP);
                    append_error(&mut error, "Kick Failure", worker.wake_specifically(reevaluate));
                }
            }
            Kick::Any => {
                assert!(
                    !flags.contains(KickFlags::REEVALUATE_POLLING_ON_WAKEUP),
                    "untargeted kicks cannot ask to reevaluate polling"
                );
                if context::current_pollset() != Some(id) {
                    if self.workers.is_empty() {
                        self.kicked_without_pollers = true;
                    } else if let Some(worker) = self.next_worker(flags.contains(KickFlags::CAN_KICK_SELF)) {
                        append_error(&mut error, "Kick Failure", worker.wake());
                    }
                }
            }
        }

        error
    }
}

pub(crate) struct PollsetShared {
    id: PollsetId,
    engine: Arc<EngineShared>,
    mu: Mutex<PollsetState>,
}

/// A set of fds polled by any number of worker threads.
///
/// Cloning yields another handle to the same pollset.
#[derive(Clone)]
pub struct Pollset(Arc<PollsetShared>);

impl Pollset {
    pub(crate) fn new(engine: Arc<EngineShared>) -> Self {
        let backend = match &engine.islands {
            Some(pool) => Backend::Epoll {
                pool: Arc::clone(pool),
                island: None,
            },
            None => Backend::Poll { fds: Vec::new() },
        };

        let id = PollsetId::next();
        tracing::debug!(pollset = %id, "pollset created");

        Pollset(Arc::new(PollsetShared {
            id,
            engine,
            mu: Mutex::new(PollsetState {
                workers: VecDeque::new(),
                kicked_without_pollers: false,
                shutting_down: false,
                called_shutdown: false,
                shutdown_done: None,
                pollset_set_count: 0,
                wakeup_cache: Vec::new(),
                backend,
            }),
        }))
    }

    pub(crate) fn from_shared(shared: Arc<PollsetShared>) -> Self {
        Pollset(shared)
    }

    pub(crate) fn ptr_eq(&self, other: &Pollset) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn id(&self) -> PollsetId {
        self.0.id
    }

    /// Adds `fd` to the pollset. Under the epoll engine this joins their
    /// polling islands, merging them if both already have one.
    pub fn add_fd(&self, fd: &Fd) {
        let _ctx = ExecCtx::enter();
        log_if_error("pollset_add_fd", self.add_fd_ref(fd.as_ref()));
    }

    pub(crate) fn add_fd_ref(&self, fd: &FdRef) -> Error {
        let mut state = self.0.mu.lock();
        match &mut state.backend {
            Backend::Epoll { pool, island } => {
                let pool = Arc::clone(pool);
                epoll::add_fd(island, fd, &pool)
            }
            Backend::Poll { fds } => {
                if fds.iter().any(|held| held.ptr_eq(fd)) {
                    return Error::NONE;
                }
                fds.push(fd.clone());
                state.kick(self.0.id, Kick::Any, KickFlags::empty())
            }
        }
    }

    /// Removes `fd`. A no-op under the epoll engine, where island membership
    /// only ends when the fd is orphaned.
    pub fn del_fd(&self, fd: &Fd) {
        self.del_fd_ref(fd.as_ref());
    }

    pub(crate) fn del_fd_ref(&self, fd: &FdRef) {
        let removed = {
            let mut state = self.0.mu.lock();
            match &mut state.backend {
                Backend::Epoll { .. } => None,
                Backend::Poll { fds } => fds
                    .iter()
                    .position(|held| held.ptr_eq(fd))
                    .map(|pos| fds.swap_remove(pos)),
            }
        };
        drop(removed);
    }

    /// Polls until an fd becomes ready, the worker is kicked, or `deadline`
    /// passes. Closures made runnable by the poll run on this thread before
    /// returning.
    ///
    /// Pass a [`PollsetWorker`] to be able to target this call with
    /// [`Kick::Worker`]; `None` uses an anonymous worker.
    pub fn work(&self, worker: Option<&PollsetWorker>, deadline: Deadline) -> Result<(), Error> {
        let _ctx = ExecCtx::enter();
        let anonymous;
        let worker = match worker {
            Some(worker) => worker,
            None => {
                anonymous = PollsetWorker::new();
                &anonymous
            }
        };

        let shared = &self.0;
        let mut state = shared.mu.lock();

        let wakeup_fd = match shared.engine.cfg.strategy {
            PollStrategy::Poll => Some(state.take_wakeup_fd()?),
            PollStrategy::Epoll => None,
        };
        worker.begin(wakeup_fd);

        let mut error = Error::NONE;
        let mut deadline = deadline;
        let mut added = false;

        if state.shutting_down {
            // Nothing to do.
        } else if state.kicked_without_pollers {
            state.kicked_without_pollers = false;
        } else {
            state.workers.push_front(worker.clone());
            added = true;

            let previous = context::set_current_polling(Some(shared.id), Some(worker.id()));
            let _restore = ScopeGuard::new(move || {
                context::set_current_polling(previous.0, previous.1);
            });

            loop {
                let round = match state.prepare_round() {
                    Ok(round) => round,
                    Err(e) => {
                        append_error(&mut error, "pollset_work", e);
                        break;
                    }
                };
                drop(state);

                let round_error = match round {
                    Round::Epoll(pool, working) => {
                        let fds = &shared.engine.fds;
                        epoll::work(fds, &pool, shared, worker, working.island(), deadline)
                    }
                    Round::Poll(polled) => poll::work(shared, worker, &polled, deadline),
                };
                if !round_error.is_none() {
                    error = round_error;
                }

                let queued_work = ExecCtx::flush();
                state = shared.mu.lock();

                let mut wake = worker.lock();
                if wake.reevaluate && error.is_none() {
                    wake.reevaluate = false;
                    wake.kicked = false;
                    state.kicked_without_pollers = false;
                    if queued_work || wake.kicked_specifically {
                        deadline = Deadline::now();
                    }
                    continue;
                }
                break;
            }
        }

        if added {
            if let Some(pos) = state.workers.iter().position(|w| w.ptr_eq(worker)) {
                state.workers.remove(pos);
            }
        }
        if let Some(fd) = worker.end() {
            if state.wakeup_cache.len() < shared.engine.cfg.wakeup_cache_size {
                state.wakeup_cache.push(fd);
            }
        }

        let mut finished = None;
        if state.shutting_down {
            if !state.workers.is_empty() {
                log_if_error("pollset_work", state.kick(shared.id, Kick::Any, KickFlags::empty()));
            } else if !state.called_shutdown && !state.has_observers() {
                finished = Some(state.finish_shutdown());
            }
        }
        drop(state);

        if let Some((on_done, released)) = finished {
            drop(released);
            tracing::debug!(pollset = %shared.id, "pollset shutdown finished");
            crate::closure::sched_opt(on_done, Error::NONE);
        }

        if error.is_none() {
            Ok(())
        } else {
            log_if_error("pollset_work", error.clone());
            Err(error)
        }
    }

    /// Wakes workers of this pollset.
    #[track_caller]
    pub fn kick(&self, target: Kick<'_>, flags: KickFlags) -> Result<(), Error> {
        tracing::debug!(pollset = %self.0.id, ?target, ?flags, "kick");
        let error = self.0.mu.lock().kick(self.0.id, target, flags);
        if error.is_none() { Ok(()) } else { Err(error) }
    }

    /// Starts shutting the pollset down. `on_done` runs once no worker and
    /// no pollset-set observes it anymore.
    ///
    /// # Panics
    ///
    /// If called twice.
    #[track_caller]
    pub fn shutdown(&self, on_done: Option<Arc<Closure>>) {
        let _ctx = ExecCtx::enter();
        let mut state = self.0.mu.lock();
        assert!(!state.shutting_down, "pollset shut down twice");

        tracing::debug!(pollset = %self.0.id, "pollset shutdown");
        state.shutting_down = true;
        state.shutdown_done = on_done;
        log_if_error("pollset_shutdown", state.kick(self.0.id, Kick::Broadcast, KickFlags::empty()));

        let finished = (!state.called_shutdown && !state.has_observers()).then(|| state.finish_shutdown());
        drop(state);

        if let Some((on_done, released)) = finished {
            drop(released);
            crate::closure::sched_opt(on_done, Error::NONE);
        }
    }

    /// Releases the pollset's fds and cached wakeup fds.
    ///
    /// # Panics
    ///
    /// If a worker is still inside `work`.
    #[track_caller]
    pub fn destroy(self) {
        let _ctx = ExecCtx::enter();
        let mut state = self.0.mu.lock();
        assert!(state.workers.is_empty(), "pollset destroyed with active workers");

        let cache = std::mem::take(&mut state.wakeup_cache);
        let released = state.release_backend();
        drop(state);

        drop(cache);
        drop(released);
        tracing::debug!(pollset = %self.0.id, "pollset destroyed");
    }

    pub(crate) fn observe(&self) {
        self.0.mu.lock().pollset_set_count += 1;
    }

    /// A pollset-set let go of this pollset; finishes a pending shutdown
    /// that was waiting on it.
    pub(crate) fn unobserve(&self) {
        let mut state = self.0.mu.lock();
        state.pollset_set_count = state.pollset_set_count.saturating_sub(1);

        let finished = (state.shutting_down && !state.called_shutdown && !state.has_observers())
            .then(|| state.finish_shutdown());
        drop(state);

        if let Some((on_done, released)) = finished {
            drop(released);
            crate::closure::sched_opt(on_done, Error::NONE);
        }
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.0.mu.lock().workers.len()
    }
}

impl fmt::Debug for Pollset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pollset").field("id", &self.0.id).finish_non_exhaustive()
    }
}

/// Identity of the polling island behind `pollset`, resolved through any
/// merges. `None` under the poll engine or before the first `add_fd`/`work`.
pub fn pollset_island_id(pollset: &Pollset) -> Option<u64> {
    let state = pollset.0.mu.lock();
    match &state.backend {
        Backend::Epoll { island: Some(island), .. } => Some(island.latest_id().as_u64()),
        _ => None,
    }
}
