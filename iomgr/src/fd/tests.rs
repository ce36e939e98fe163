use super::*;
use crate::error::StrProperty;
use crate::test_utils::{ClosureSpy, build_engine, registered_pair, write_byte};
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;

assert_impl_all!(Fd: Send, Sync);
assert_impl_all!(FdRef: Send, Sync);
assert_impl_all!(FdPool: Send, Sync);

fn description(error: &Error) -> Option<&str> {
    error.get_str(StrProperty::Description)
}

/// Reads from `peer` and reports whether the other end was closed.
fn peer_sees_eof(peer: &mut UnixStream) -> Result<bool> {
    let mut buf = [0u8; 8];
    match peer.read(&mut buf) {
        Ok(0) => Ok(true),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[test]
fn test_pool_stamps_new_generation_per_allocation() -> Result<()> {
    let pool = FdPool::new(PollStrategy::Poll);

    let first = pool.alloc(-1, "first");
    let first_token = first.token();
    let first_slot = first.slot();
    drop(first);
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.free_count(), 1);

    // Same state and slot, new generation.
    let second = pool.alloc(-1, "second");
    assert_eq!(pool.free_count(), 0);
    assert_eq!(second.slot(), first_slot);
    assert_ne!(second.token(), first_token);

    assert!(pool.lookup(first_token).is_none());
    let found = pool.lookup(second.token()).expect("live token resolves");
    assert!(found.ptr_eq(&second));
    Ok(())
}

#[test]
fn test_lookup_after_release_is_none() -> Result<()> {
    let pool = FdPool::new(PollStrategy::Epoll);
    let fd = pool.alloc(-1, "gone");
    let token = fd.token();

    let extra = fd.clone();
    drop(fd);
    assert!(pool.lookup(token).is_some());

    drop(extra);
    assert!(pool.lookup(token).is_none());
    assert_eq!(pool.live_count(), 0);
    Ok(())
}

#[test]
fn test_try_new_refuses_released_state() -> Result<()> {
    let pool = FdPool::new(PollStrategy::Poll);
    let fd = pool.alloc(-1, "released");
    let state = Arc::clone(fd.state());

    let again = FdRef::try_new(&state).expect("count is positive");
    drop(again);
    drop(fd);

    assert!(FdRef::try_new(&state).is_none());
    Ok(())
}

#[test]
fn test_clear_freelist_drops_pooled_states() -> Result<()> {
    let pool = FdPool::new(PollStrategy::Poll);
    let states: Vec<_> = (0..4).map(|i| pool.alloc(-1, &format!("fd{i}"))).collect();
    assert_eq!(pool.live_count(), 4);

    drop(states);
    assert_eq!(pool.free_count(), 4);
    pool.clear_freelist();
    assert_eq!(pool.free_count(), 0);
    Ok(())
}

#[rstest]
#[case::epoll(PollStrategy::Epoll)]
#[case::poll(PollStrategy::Poll)]
fn test_name_and_wrapped_fd(#[case] strategy: PollStrategy) -> Result<()> {
    let engine = build_engine(strategy)?;
    let (fd, _peer) = registered_pair(&engine, "client")?;

    let raw = fd.wrapped_fd().expect("fd is open");
    assert_eq!(fd.name(), format!("client fd={raw}"));
    assert!(!fd.is_shutdown());
    assert!(fd.read_notifier_pollset().is_none());

    drop(fd);
    engine.shutdown();
    Ok(())
}

#[rstest]
#[case::epoll(PollStrategy::Epoll)]
#[case::poll(PollStrategy::Poll)]
fn test_orphan_close_closes_descriptor(#[case] strategy: PollStrategy) -> Result<()> {
    let engine = build_engine(strategy)?;
    let (fd, mut peer) = registered_pair(&engine, "close")?;
    let done = ClosureSpy::new();

    assert!(!peer_sees_eof(&mut peer)?);
    let returned = fd.orphan(Some(done.closure()), OrphanMode::Close, "test");

    assert!(returned.is_none());
    assert_eq!(done.calls(), 1);
    assert!(done.last_error().is_some_and(|e| e.is_none()));
    assert!(peer_sees_eof(&mut peer)?);
    engine.shutdown();
    Ok(())
}

#[rstest]
#[case::epoll(PollStrategy::Epoll)]
#[case::poll(PollStrategy::Poll)]
fn test_orphan_release_hands_descriptor_back(#[case] strategy: PollStrategy) -> Result<()> {
    let engine = build_engine(strategy)?;
    let (fd, mut peer) = registered_pair(&engine, "release")?;
    let done = ClosureSpy::new();

    let raw = fd
        .orphan(Some(done.closure()), OrphanMode::Release, "test")
        .expect("released fd is returned");
    assert_eq!(done.calls(), 1);

    // SAFETY: the engine gave up the descriptor; the stream owns it now.
    let mut ours = unsafe { UnixStream::from_raw_fd(raw) };
    write_byte(&mut peer)?;
    let mut byte = [0u8; 1];
    ours.read_exact(&mut byte)?;
    assert_eq!(&byte, b"x");
    assert!(!peer_sees_eof(&mut peer)?);
    engine.shutdown();
    Ok(())
}

#[rstest]
#[case::epoll(PollStrategy::Epoll)]
#[case::poll(PollStrategy::Poll)]
fn test_orphan_already_closed_skips_close(#[case] strategy: PollStrategy) -> Result<()> {
    let engine = build_engine(strategy)?;
    let (fd, mut peer) = registered_pair(&engine, "closed")?;
    let done = ClosureSpy::new();

    let raw = fd.wrapped_fd().expect("fd is open");
    sys::close(raw)?;
    assert!(fd.orphan(Some(done.closure()), OrphanMode::AlreadyClosed, "test").is_none());

    assert_eq!(done.calls(), 1);
    assert!(done.last_error().is_some_and(|e| e.is_none()));
    assert!(peer_sees_eof(&mut peer)?);
    engine.shutdown();
    Ok(())
}

#[rstest]
#[case::epoll(PollStrategy::Epoll)]
#[case::poll(PollStrategy::Poll)]
fn test_orphan_fails_pending_waiters(#[case] strategy: PollStrategy) -> Result<()> {
    let engine = build_engine(strategy)?;
    let (fd, _peer) = registered_pair(&engine, "orphaned")?;
    let reader = ClosureSpy::new();

    fd.notify_on_read(reader.closure());
    assert_eq!(reader.calls(), 0);

    fd.orphan(None, OrphanMode::Close, "test");
    assert_eq!(reader.calls(), 1);

    let err = reader.last_error().expect("waiter ran");
    assert_eq!(description(&err), Some("FD shutdown"));
    let cause = err.children().next().expect("cause attached");
    assert_eq!(description(cause), Some("FD orphaned"));
    engine.shutdown();
    Ok(())
}

#[rstest]
#[case::epoll(PollStrategy::Epoll)]
#[case::poll(PollStrategy::Poll)]
fn test_shutdown_resolves_both_directions(#[case] strategy: PollStrategy) -> Result<()> {
    let engine = build_engine(strategy)?;
    let (fd, mut peer) = registered_pair(&engine, "shutdown")?;
    let reader = ClosureSpy::new();
    let writer = ClosureSpy::new();

    fd.notify_on_read(reader.closure());
    fd.shutdown(Error::new("endpoint closing"));
    fd.shutdown(Error::new("ignored"));
    assert!(fd.is_shutdown());
    assert_eq!(reader.calls(), 1);

    fd.notify_on_write(writer.closure());
    assert_eq!(writer.calls(), 1);

    for err in reader.errors().iter().chain(writer.errors().iter()) {
        assert_eq!(description(err), Some("FD shutdown"));
        let cause = err.children().next().expect("cause attached");
        assert_eq!(description(cause), Some("endpoint closing"));
    }

    // SHUT_RDWR reached the socket.
    assert!(peer_sees_eof(&mut peer)?);
    drop(fd);
    engine.shutdown();
    Ok(())
}

#[test]
fn test_ready_edge_before_waiter_runs_closure_immediately() -> Result<()> {
    let engine = build_engine(PollStrategy::Epoll)?;
    let (fd, _peer) = registered_pair(&engine, "edge")?;
    let reader = ClosureSpy::new();

    {
        let _ctx = ExecCtx::enter();
        assert!(!fd.as_ref().become_readable(None));
    }
    fd.notify_on_read(reader.closure());
    assert_eq!(reader.calls(), 1);
    assert!(reader.last_error().is_some_and(|e| e.is_none()));

    // The edge was consumed.
    fd.notify_on_read(reader.closure());
    assert_eq!(reader.calls(), 1);

    drop(fd);
    assert_eq!(reader.calls(), 2);
    engine.shutdown();
    Ok(())
}

#[test]
fn test_dropping_owner_orphans_and_recycles_state() -> Result<()> {
    let engine = build_engine(PollStrategy::Poll)?;
    let pool = Arc::clone(&engine.shared().fds);
    let (fd, mut peer) = registered_pair(&engine, "dropped")?;
    let token = fd.as_ref().token();

    drop(fd);
    assert!(peer_sees_eof(&mut peer)?);
    assert!(pool.lookup(token).is_none());
    assert_eq!(pool.free_count(), 1);
    engine.shutdown();
    assert_eq!(pool.free_count(), 0);
    Ok(())
}

#[rstest]
#[case::epoll(PollStrategy::Epoll)]
#[case::poll(PollStrategy::Poll)]
#[should_panic(expected = "previous closure is still pending")]
fn test_second_read_waiter_panics(#[case] strategy: PollStrategy) {
    let engine = build_engine(strategy).unwrap();
    let (fd, _peer) = registered_pair(&engine, "twice").unwrap();
    fd.notify_on_read(Closure::new(|_| {}));
    fd.notify_on_read(Closure::new(|_| {}));
}
