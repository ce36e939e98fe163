use super::errors::{Result, SysError};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Non-blocking eventfd used to interrupt a thread blocked in
/// `epoll_wait`/`poll`.
#[derive(Debug)]
pub(crate) struct WakeupFd {
    fd: OwnedFd,
}

impl WakeupFd {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: no pointers are passed.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(SysError::last("eventfd"));
        }

        // SAFETY: `fd` was just returned by the kernel and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Makes the fd readable.
    pub(crate) fn wakeup(&self) -> Result<()> {
        let one: u64 = 1;
        loop {
            // SAFETY: writes 8 bytes from a live u64.
            let rc = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    (&one as *const u64).cast(),
                    size_of::<u64>(),
                )
            };
            if rc >= 0 {
                return Ok(());
            }

            let err = SysError::last("eventfd_write");
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Counter saturated: already readable.
                Some(libc::EAGAIN) => return Ok(()),
                _ => return Err(err),
            }
        }
    }

    /// Drains pending wakeups so the fd is no longer readable.
    pub(crate) fn consume(&self) -> Result<()> {
        let mut value: u64 = 0;
        loop {
            // SAFETY: reads at most 8 bytes into a live u64.
            let rc = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut value as *mut u64).cast(),
                    size_of::<u64>(),
                )
            };
            if rc >= 0 {
                continue;
            }

            let err = SysError::last("eventfd_read");
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(()),
                _ => return Err(err),
            }
        }
    }
}

impl AsRawFd for WakeupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::poll::{POLLIN, poll};
    use anyhow::Result;

    fn is_readable(fd: &WakeupFd) -> Result<bool> {
        let mut fds = [libc::pollfd {
            fd: fd.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        }];
        Ok(poll(&mut fds, 0)? == 1 && fds[0].revents & POLLIN != 0)
    }

    #[test]
    fn test_wakeup_then_consume() -> Result<()> {
        let fd = WakeupFd::new()?;
        assert!(!is_readable(&fd)?);

        fd.wakeup()?;
        fd.wakeup()?;
        assert!(is_readable(&fd)?);

        fd.consume()?;
        assert!(!is_readable(&fd)?);

        // Draining an empty fd is fine.
        fd.consume()?;
        Ok(())
    }
}
