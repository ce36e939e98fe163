//! Thin wrappers over the Linux syscalls the engines use.

use std::os::fd::RawFd;

pub mod errors;
pub use errors::SysError;

pub(crate) mod epoll;
pub(crate) use epoll::Epoll;

pub(crate) mod poll;

mod wakeup_fd;
pub(crate) use wakeup_fd::WakeupFd;

pub(crate) fn close(fd: RawFd) -> errors::Result<()> {
    // SAFETY: the caller owns `fd` and never uses it again.
    if unsafe { libc::close(fd) } < 0 {
        return Err(SysError::last("close"));
    }
    Ok(())
}

/// `shutdown(fd, SHUT_RDWR)`. Errors are expected for non-sockets.
pub(crate) fn shutdown_rdwr(fd: RawFd) -> errors::Result<()> {
    // SAFETY: no pointers are passed.
    if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } < 0 {
        return Err(SysError::last("shutdown"));
    }
    Ok(())
}
