//! Pollset-sets: groups of fds, pollsets and nested sets where every fd is
//! kept in every pollset reachable from the group.

use crate::closure::ExecCtx;
use crate::error::log_if_error;
use crate::fd::{Fd, FdRef};
use crate::pollset::Pollset;
use crate::utils::PollsetSetId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;


#[derive(Default)]
struct Members {
    fds: Vec<FdRef>,
    pollsets: Vec<Pollset>,
    sets: Vec<PollsetSet>,
    /// Set once merged into another set; every operation then goes there.
    parent: Option<PollsetSet>,
}

impl Members {
    fn len(&self) -> usize {
        self.fds.len() + self.pollsets.len() + self.sets.len()
    }

    /// Drops orphaned fds, returning the rest.
    fn sweep_fds(&mut self) -> Vec<FdRef> {
        let (orphaned, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fds)
            .into_iter()
            .partition(|fd| fd.is_orphaned());
        self.fds = live;
        drop(orphaned);
        self.fds.clone()
    }
}

struct Shared {
    id: PollsetSetId,
    mu: Mutex<Members>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ctx = ExecCtx::enter();
        let members = std::mem::take(self.mu.get_mut());
        for pollset in &members.pollsets {
            pollset.unobserve();
        }
    }
}

/// A group of fds, pollsets and nested pollset-sets.
///
/// Cloning yields another handle to the same set.
#[derive(Clone)]
pub struct PollsetSet(Arc<Shared>);

impl PollsetSet {
    pub(crate) fn new() -> Self {
        let id = PollsetSetId::next();
        tracing::debug!(pollset_set = %id, "pollset-set created");
        PollsetSet(Arc::new(Shared {
            id,
            mu: Mutex::new(Members::default()),
        }))
    }

    fn ptr_eq(&self, other: &PollsetSet) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Chases `parent` to the representative, pointing this handle's set
    /// straight at it.
    fn root(&self) -> PollsetSet {
        let mut current = self.clone();
        loop {
            let parent = current.0.mu.lock().parent.clone();
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }

        if !current.ptr_eq(self) {
            self.0.mu.lock().parent = Some(current.clone());
        }
        current
    }

    /// Runs `f` with the representative locked, retrying if it gets merged
    /// away meanwhile.
    fn with_root<R>(&self, f: impl FnOnce(&mut Members) -> R) -> R {
        loop {
            let root = self.root();
            let mut members = root.0.mu.lock();
            if members.parent.is_none() {
                return f(&mut members);
            }
        }
    }

    pub fn add_fd(&self, fd: &Fd) {
        let _ctx = ExecCtx::enter();
        self.add_fd_ref(fd.as_ref());
    }

    pub(crate) fn add_fd_ref(&self, fd: &FdRef) {
        self.with_root(|members| {
            if !members.fds.iter().any(|held| held.ptr_eq(fd)) {
                members.fds.push(fd.clone());
            }
            for pollset in &members.pollsets {
                log_if_error("pollset_set_add_fd", pollset.add_fd_ref(fd));
            }
            for set in &members.sets {
                set.add_fd_ref(fd);
            }
        });
    }

    pub fn del_fd(&self, fd: &Fd) {
        let _ctx = ExecCtx::enter();
        self.del_fd_ref(fd.as_ref());
    }

    pub(crate) fn del_fd_ref(&self, fd: &FdRef) {
        let removed = self.with_root(|members| {
            let removed = members
                .fds
                .iter()
                .position(|held| held.ptr_eq(fd))
                .map(|pos| members.fds.swap_remove(pos));
            for pollset in &members.pollsets {
                pollset.del_fd_ref(fd);
            }
            for set in &members.sets {
                set.del_fd_ref(fd);
            }
            removed
        });
        drop(removed);
    }

    /// Adds `pollset`, which then polls every fd of the set and defers its
    /// shutdown until removed.
    pub fn add_pollset(&self, pollset: &Pollset) {
        let _ctx = ExecCtx::enter();
        pollset.observe();

        self.with_root(|members| {
            members.pollsets.push(pollset.clone());
            for fd in members.sweep_fds() {
                log_if_error("pollset_set_add_pollset", pollset.add_fd_ref(&fd));
            }
        });
    }

    pub fn del_pollset(&self, pollset: &Pollset) {
        let _ctx = ExecCtx::enter();
        let removed = self.with_root(|members| {
            members
                .pollsets
                .iter()
                .position(|held| held.ptr_eq(pollset))
                .map(|pos| members.pollsets.swap_remove(pos))
        });
        if let Some(pollset) = removed {
            pollset.unobserve();
        }
    }

    /// Nests `item` in this set: every fd of this set is pushed into it.
    pub fn add_pollset_set(&self, item: &PollsetSet) {
        let _ctx = ExecCtx::enter();
        self.with_root(|members| {
            members.sets.push(item.clone());
            for fd in members.sweep_fds() {
                item.add_fd_ref(&fd);
            }
        });
    }

    pub fn del_pollset_set(&self, item: &PollsetSet) {
        let removed = self.with_root(|members| {
            members
                .sets
                .iter()
                .position(|held| held.ptr_eq(item))
                .map(|pos| members.sets.swap_remove(pos))
        });
        drop(removed);
    }

    /// Joins the groups behind `self` and `other`. Afterwards both handles
    /// address the same set, and every fd reaches every pollset of the
    /// union.
    pub fn merge(&self, other: &PollsetSet) {
        let _ctx = ExecCtx::enter();
        loop {
            let a = self.root();
            let b = other.root();
            if a.ptr_eq(&b) {
                return;
            }

            let (first, second) = if Arc::as_ptr(&a.0) < Arc::as_ptr(&b.0) {
                (&a, &b)
            } else {
                (&b, &a)
            };
            let mut first_members = first.0.mu.lock();
            let mut second_members = second.0.mu.lock();
            if first_members.parent.is_some() || second_members.parent.is_some() {
                continue;
            }

            let ((winner, winner_members), (loser, loser_members)) =
                if first_members.len() >= second_members.len() {
                    ((first, &mut *first_members), (second, &mut *second_members))
                } else {
                    ((second, &mut *second_members), (first, &mut *first_members))
                };

            tracing::debug!(into = %winner.0.id, from = %loser.0.id, "merging pollset-sets");
            merge_members((winner, winner_members), (loser, &mut *loser_members));
            loser_members.parent = Some(winner.clone());
            return;
        }
    }

    /// Releases every member: fd references are dropped and pollsets stop
    /// waiting on this set to finish their shutdown.
    pub fn destroy(self) {
        let _ctx = ExecCtx::enter();
        let members = {
            let mut members = self.0.mu.lock();
            Members {
                fds: std::mem::take(&mut members.fds),
                pollsets: std::mem::take(&mut members.pollsets),
                sets: std::mem::take(&mut members.sets),
                parent: None,
            }
        };

        for pollset in &members.pollsets {
            pollset.unobserve();
        }
        tracing::debug!(pollset_set = %self.0.id, "pollset-set destroyed");
    }

    #[cfg(test)]
    pub(crate) fn fd_count(&self) -> usize {
        self.with_root(|members| members.fds.len())
    }
}

/// Moves `loser`'s members into `winner` and fans every fd out to every
/// pollset and nested set of the union.
///
/// Both sets are locked by the caller, so neither may stay nested in the
/// union: propagating into it would relock it.
fn merge_members(
    (winner_set, winner): (&PollsetSet, &mut Members),
    (loser_set, loser): (&PollsetSet, &mut Members),
) {
    let is_merged = |set: &PollsetSet| set.ptr_eq(winner_set) || set.ptr_eq(loser_set);
    // The caller's root handles outlive these, so no set is dropped here.
    winner.sets.retain(|set| !is_merged(set));

    let loser_fds: Vec<FdRef> = loser
        .sweep_fds()
        .into_iter()
        .filter(|fd| !winner.fds.iter().any(|held| held.ptr_eq(fd)))
        .collect();
    let winner_fds = winner.sweep_fds();

    let new_pollsets: Vec<Pollset> = std::mem::take(&mut loser.pollsets)
        .into_iter()
        .filter_map(|pollset| {
            if winner.pollsets.iter().any(|held| held.ptr_eq(&pollset)) {
                // Counted once per membership: the duplicate goes away.
                pollset.unobserve();
                None
            } else {
                Some(pollset)
            }
        })
        .collect();
    let new_sets: Vec<PollsetSet> = std::mem::take(&mut loser.sets)
        .into_iter()
        .filter(|set| !is_merged(set) && !winner.sets.iter().any(|held| held.ptr_eq(set)))
        .collect();

    for fd in &loser_fds {
        for pollset in &winner.pollsets {
            log_if_error("pollset_set_merge", pollset.add_fd_ref(fd));
        }
        for set in &winner.sets {
            set.add_fd_ref(fd);
        }
    }
    for fd in winner_fds.iter().chain(&loser_fds) {
        for pollset in &new_pollsets {
            log_if_error("pollset_set_merge", pollset.add_fd_ref(fd));
        }
        for set in &new_sets {
            set.add_fd_ref(fd);
        }
    }

    loser.fds.clear();
    winner.fds.extend(loser_fds);
    winner.pollsets.extend(new_pollsets);
    winner.sets.extend(new_sets);
}

impl fmt::Debug for PollsetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollsetSet").field("id", &self.0.id).finish_non_exhaustive()
    }
}
