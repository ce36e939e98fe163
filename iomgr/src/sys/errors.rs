use crate::error::Error;
use std::io;

/// Failure at the syscall boundary.
#[derive(thiserror::Error, Debug)]
pub enum SysError {
    #[error("{syscall} failed: {source}")]
    Syscall {
        syscall: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SysError {
    /// Captures `errno` right after a failed call.
    pub(crate) fn last(syscall: &'static str) -> Self {
        Self::from_errno(syscall, nix::errno::Errno::last() as i32)
    }

    pub(crate) fn from_errno(syscall: &'static str, errno: i32) -> Self {
        SysError::Syscall {
            syscall,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.raw_os_error()
            .is_some_and(|errno| matches!(errno, libc::EINTR | libc::EAGAIN))
    }

    pub fn is_interrupted(&self) -> bool {
        self.raw_os_error() == Some(libc::EINTR)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        let SysError::Syscall { source, .. } = self;
        source.raw_os_error()
    }
}

impl PartialEq for SysError {
    fn eq(&self, other: &Self) -> bool {
        let (Self::Syscall { syscall: a, source: ea }, Self::Syscall { syscall: b, source: eb }) = (self, other);
        a == b && ea.kind() == eb.kind() && ea.raw_os_error() == eb.raw_os_error()
    }
}

impl From<SysError> for Error {
    #[track_caller]
    fn from(e: SysError) -> Self {
        let SysError::Syscall { syscall, source } = &e;
        match source.raw_os_error() {
            Some(errno) => Error::os_error(errno, syscall),
            None => Error::new(e.to_string()),
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, SysError>;
