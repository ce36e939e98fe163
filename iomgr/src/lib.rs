//! Readiness-based I/O multiplexing core.
//!
//! An [`Engine`] owns the pools behind every [`Fd`], [`Pollset`] and
//! [`PollsetSet`] created from it. Threads block in [`Pollset::work`] until a
//! registered fd is ready, a kick arrives or a deadline passes; readiness is
//! delivered by scheduling [`Closure`]s that run on the polling thread.

#[doc(inline)]
pub use iomgr_macros::test;

pub mod closure;
pub use closure::{Closure, ClosureList, ClosureScheduler, ExecCtx};

mod context;

pub mod deadline;
pub use deadline::Deadline;

mod epoll;

pub mod error;
pub use error::Error;

mod fd;
pub use fd::{Fd, OrphanMode, fd_island_id};

mod poll;

mod pollset;
pub use pollset::{Kick, KickFlags, Pollset, PollsetWorker, pollset_island_id};

mod pollset_set;
pub use pollset_set::PollsetSet;

pub mod runtime;
pub use runtime::{Builder, Engine, PollStrategy};

mod sys;
pub use sys::SysError;

mod utils;

#[cfg(test)]
mod test_utils;
