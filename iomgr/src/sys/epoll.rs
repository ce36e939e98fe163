use super::errors::{Result, SysError};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub(crate) const EPOLLPRI: u32 = libc::EPOLLPRI as u32;
pub(crate) const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub(crate) const EPOLLET: u32 = libc::EPOLLET as u32;

/// Owned epoll instance. Closed on drop.
#[derive(Debug)]
pub(crate) struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: no pointers are passed.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(SysError::last("epoll_create1"));
        }

        // SAFETY: `fd` was just returned by the kernel and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Registers `fd`. Already being registered counts as success.
    pub(crate) fn add(&self, fd: RawFd, token: u64, events: u32) -> Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, token, events) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            res => res,
        }
    }

    /// Unregisters `fd`. Not being registered counts as success.
    pub(crate) fn delete(&self, fd: RawFd) -> Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            res => res,
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, events: u32) -> Result<()> {
        let mut event = libc::epoll_event { events, u64: token };

        // SAFETY: `event` outlives the call and the kernel copies it.
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(SysError::last("epoll_ctl"));
        }
        Ok(())
    }

    /// Waits for events, filling `events` up to its capacity. A timeout of -1
    /// blocks indefinitely. EINTR is returned to the caller.
    pub(crate) fn wait(&self, events: &mut Vec<libc::epoll_event>, timeout_ms: i32) -> Result<usize> {
        events.clear();
        let capacity = events.capacity().clamp(1, libc::c_int::MAX as usize);
        events.reserve(capacity);

        // SAFETY: the buffer has room for `capacity` entries and the kernel
        // writes at most that many.
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                capacity as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(SysError::last("epoll_wait"));
        }

        let n = n as usize;
        // SAFETY: the kernel initialized the first `n` entries.
        unsafe { events.set_len(n) };
        Ok(n)
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
