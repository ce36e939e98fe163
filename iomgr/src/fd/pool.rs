use super::{FdRef, FdState};
use crate::runtime::PollStrategy;
use parking_lot::Mutex;
use slab::Slab;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Allocator for fd states.
///
/// Live states sit in a slab indexed by slot; released ones wait on a
/// freelist. Each allocation stamps a fresh generation so that an epoll token
/// (`generation << 32 | slot`) outliving its fd resolves to nothing.
#[derive(Debug)]
pub(crate) struct FdPool {
    strategy: PollStrategy,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    live: Slab<Arc<FdState>>,
    free: Vec<Arc<FdState>>,
    next_generation: u32,
}

impl FdPool {
    pub(crate) fn new(strategy: PollStrategy) -> Arc<Self> {
        Arc::new(Self {
            strategy,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Returns the owner reference of a freshly initialized state.
    pub(crate) fn alloc(self: &Arc<Self>, raw: RawFd, name: &str) -> FdRef {
        let mut inner = self.inner.lock();

        let state = inner
            .free
            .pop()
            .unwrap_or_else(|| Arc::new(FdState::new(self.strategy, Arc::downgrade(self))));

        inner.next_generation = inner.next_generation.wrapping_add(1);
        let generation = inner.next_generation;

        let entry = inner.live.vacant_entry();
        state.reset(raw, name, entry.key(), generation);
        entry.insert(Arc::clone(&state));

        FdRef::adopt(state)
    }

    /// Resolves an epoll token to a new reference, unless the fd behind it
    /// has been released.
    pub(crate) fn lookup(&self, token: u64) -> Option<FdRef> {
        let slot = (token & u64::from(u32::MAX)) as usize;
        let generation = (token >> 32) as u32;

        let inner = self.inner.lock();
        inner
            .live
            .get(slot)
            .filter(|state| state.generation() == generation)
            .and_then(FdRef::try_new)
    }

    /// Called once the last reference to `state` is gone.
    pub(super) fn release(&self, state: &Arc<FdState>) {
        let mut inner = self.inner.lock();

        let slot = state.slot();
        if inner
            .live
            .get(slot)
            .is_some_and(|live| Arc::ptr_eq(live, state))
        {
            inner.live.remove(slot);
        }
        inner.free.push(Arc::clone(state));
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Drops every pooled state.
    pub(crate) fn clear_freelist(&self) {
        let free = std::mem::take(&mut self.inner.lock().free);
        drop(free);
    }
}
