use crate::deadline::Deadline;
use crate::fd::Fd;
use crate::pollset::{Pollset, PollsetWorker};
use crate::runtime::{Builder, Engine, PollStrategy};
use std::io::Write;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

pub(crate) mod spy;
pub(crate) use spy::ClosureSpy;

pub(crate) fn build_engine(strategy: PollStrategy) -> anyhow::Result<Engine> {
    let builder = match strategy {
        PollStrategy::Epoll => Builder::new_epoll(),
        PollStrategy::Poll => Builder::new_poll(),
    };
    builder.try_build()
}

/// Connected, non-blocking pair of unix stream sockets.
pub(crate) fn socketpair() -> anyhow::Result<(UnixStream, UnixStream)> {
    let (a, b) = UnixStream::pair()?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;
    Ok((a, b))
}

/// Hands `stream` over to `engine`, which then owns the descriptor.
pub(crate) fn register(engine: &Engine, stream: UnixStream, name: &str) -> Fd {
    engine.fd_create(stream.into_raw_fd(), name)
}

/// An engine fd and the peer end the test writes to.
pub(crate) fn registered_pair(engine: &Engine, name: &str) -> anyhow::Result<(Fd, UnixStream)> {
    let (ours, peer) = socketpair()?;
    Ok((register(engine, ours, name), peer))
}

pub(crate) fn write_byte(peer: &mut UnixStream) -> anyhow::Result<()> {
    peer.write_all(b"x")?;
    Ok(())
}

pub(crate) fn read_byte(raw: RawFd) -> anyhow::Result<u8> {
    let mut byte = [0u8; 1];
    // SAFETY: reads at most one byte into a live buffer.
    let n = unsafe { libc::read(raw, byte.as_mut_ptr().cast(), 1) };
    anyhow::ensure!(n == 1, "read returned {n}");
    Ok(byte[0])
}

/// Calls `work` until `spy` has seen `calls` invocations or `timeout`
/// elapses. Returns the number of invocations seen.
pub(crate) fn work_until(
    pollset: &Pollset,
    spy: &ClosureSpy,
    calls: usize,
    timeout: Duration,
) -> anyhow::Result<usize> {
    let deadline = Deadline::after(timeout);
    let worker = PollsetWorker::new();
    while spy.calls() < calls && !deadline.has_passed() {
        pollset.work(Some(&worker), deadline)?;
    }
    Ok(spy.calls())
}
