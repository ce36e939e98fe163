use crate::epoll::PollingIsland;
use crate::error::Error;
use crate::sys::WakeupFd;
use crate::utils::WorkerId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// What a worker is blocked on, which decides how a kick reaches it.
#[derive(Default)]
pub(crate) enum Phase {
    #[default]
    Idle,
    /// Parked on the condition variable, queued for an island's lease.
    Waiting,
    /// Inside `epoll_wait` on this island.
    PollingIsland(Arc<PollingIsland>),
}

#[derive(Default)]
pub(crate) struct WakeState {
    pub(crate) kicked: bool,
    pub(crate) kicked_specifically: bool,
    pub(crate) reevaluate: bool,
    pub(crate) phase: Phase,
    /// The island lease was handed over by its previous holder.
    pub(crate) turn: bool,
    /// A kick went through the island wakeup fd and is still outstanding.
    pub(crate) signaled_island: bool,
    /// Poll engine: eventfd polled at `pollfd[0]` for the whole `work` call.
    pub(crate) wakeup_fd: Option<Arc<WakeupFd>>,
}

pub(crate) struct WorkerShared {
    id: WorkerId,
    wake: Mutex<WakeState>,
    cv: Condvar,
}

/// Handle to a thread inside [`Pollset::work`](crate::Pollset::work).
///
/// Create one, pass it to `work`, and clone it to other threads to target
/// them with [`Kick::Worker`](crate::Kick::Worker).
#[derive(Clone)]
pub struct PollsetWorker(Arc<WorkerShared>);

impl PollsetWorker {
    pub fn new() -> Self {
        PollsetWorker(Arc::new(WorkerShared {
            id: WorkerId::next(),
            wake: Mutex::new(WakeState::default()),
            cv: Condvar::new(),
        }))
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.0.id
    }

    pub(crate) fn ptr_eq(&self, other: &PollsetWorker) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True once the worker has been kicked during its current `work` call.
    pub fn kicked(&self) -> bool {
        self.0.wake.lock().kicked
    }

    pub fn kicked_specifically(&self) -> bool {
        self.0.wake.lock().kicked_specifically
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WakeState> {
        self.0.wake.lock()
    }

    pub(crate) fn condvar(&self) -> &Condvar {
        &self.0.cv
    }

    /// Clears per-call flags at the start of `work`.
    pub(crate) fn begin(&self, wakeup_fd: Option<Arc<WakeupFd>>) {
        let mut wake = self.lock();
        *wake = WakeState {
            wakeup_fd,
            ..WakeState::default()
        };
    }

    /// Returns the eventfd lent to this worker, if any.
    pub(crate) fn end(&self) -> Option<Arc<WakeupFd>> {
        let mut wake = self.lock();
        wake.phase = Phase::Idle;
        wake.wakeup_fd.take()
    }

    pub(crate) fn wakeup_fd(&self) -> Option<Arc<WakeupFd>> {
        self.lock().wakeup_fd.clone()
    }

    /// Non-targeted wakeup: used by `Kick::Any` and broadcasts.
    pub(crate) fn wake(&self) -> Error {
        let mut wake = self.lock();
        wake.kicked = true;
        self.wake_locked(&mut wake)
    }

    /// Targeted wakeup, optionally asking the worker to rebuild its poll set.
    pub(crate) fn wake_specifically(&self, reevaluate: bool) -> Error {
        let mut wake = self.lock();
        wake.kicked = true;
        wake.kicked_specifically = true;
        if reevaluate {
            wake.reevaluate = true;
        }
        self.wake_locked(&mut wake)
    }

    fn wake_locked(&self, wake: &mut WakeState) -> Error {
        if let Some(fd) = &wake.wakeup_fd {
            return fd.wakeup().map_or_else(Error::from, |_| Error::NONE);
        }

        match &wake.phase {
            Phase::Idle => Error::NONE,
            Phase::Waiting => {
                self.0.cv.notify_one();
                Error::NONE
            }
            Phase::PollingIsland(island) => {
                if !wake.signaled_island {
                    wake.signaled_island = true;
                    island.pending_kicks().fetch_add(1, Ordering::AcqRel);
                }
                island.wakeup().wakeup().map_or_else(Error::from, |_| Error::NONE)
            }
        }
    }
}

impl Default for PollsetWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PollsetWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollsetWorker")
            .field("id", &self.0.id)
            .finish_non_exhaustive()
    }
}
