use super::*;
use crate::fd::{Fd, fd_island_id};
use crate::pollset::{Pollset, pollset_island_id};
use crate::runtime::{Engine, PollStrategy};
use crate::test_utils::{ClosureSpy, build_engine, registered_pair, work_until, write_byte};
use crate::utils::IslandId;
use anyhow::Result;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

assert_impl_all!(IslandRef: Send, Sync);
assert_impl_all!(IslandPool: Send, Sync);

fn island_pool(engine: &Engine) -> Arc<IslandPool> {
    Arc::clone(engine.shared().islands.as_ref().expect("epoll engine"))
}

/// Runs `f` on the representative island of `fd`.
fn with_fd_island<R>(fd: &Fd, f: impl FnOnce(&island::IslandState) -> R) -> Option<R> {
    let locked = fd.as_ref().mu.lock();
    let island = locked.island.as_ref()?;
    Some(with_latest(island.island(), |_, state| f(state)))
}

fn fds(engine: &Engine, n: usize) -> Result<Vec<(Fd, UnixStream)>> {
    (0..n).map(|i| registered_pair(engine, &format!("fd{i}"))).collect()
}

#[test]
fn test_transitive_merges_converge_on_one_island() -> Result<()> {
    let engine = build_engine(PollStrategy::Epoll)?;
    let pairs = fds(&engine, 12)?;
    let pollsets: Vec<Pollset> = (0..5).map(|_| engine.pollset()).collect();

    let mut rng = fastrand::Rng::with_seed(0x15_1a_4d);
    for (fd, _) in &pairs {
        pollsets[rng.usize(..pollsets.len())].add_fd(fd);
    }
    // Linking every pollset through the first fd joins all islands.
    for pollset in &pollsets {
        pollset.add_fd(&pairs[0].0);
    }
    // Repeats are no-ops.
    for (fd, _) in pairs.iter().take(3) {
        pollsets[rng.usize(..pollsets.len())].add_fd(fd);
    }

    let ids: HashSet<u64> = pairs
        .iter()
        .map(|(fd, _)| fd_island_id(fd).expect("fd joined an island"))
        .chain(pollsets.iter().map(|p| pollset_island_id(p).expect("pollset has an island")))
        .collect();
    assert_eq!(ids.len(), 1);

    let members = with_fd_island(&pairs[0].0, |state| {
        state.fds.iter().map(|fd| fd.token()).collect::<Vec<_>>()
    })
    .expect("fd joined an island");
    let unique: HashSet<u64> = members.iter().copied().collect();
    assert_eq!(members.len(), pairs.len());
    assert_eq!(unique.len(), pairs.len());
    for (fd, _) in &pairs {
        assert!(unique.contains(&fd.as_ref().token()));
    }

    drop(pairs);
    for pollset in pollsets {
        pollset.destroy();
    }
    engine.shutdown();
    Ok(())
}

#[test]
fn test_concurrent_add_fd_converges_on_one_island() -> Result<()> {
    const THREADS: usize = 8;

    let engine = build_engine(PollStrategy::Epoll)?;
    let pairs = fds(&engine, 16)?;
    let pollsets: Vec<Pollset> = (0..5).map(|_| engine.pollset()).collect();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let (pairs, pollsets) = (&pairs, &pollsets);
            s.spawn(move || {
                let mut rng = fastrand::Rng::with_seed(t as u64);
                // Every thread links some pollset through the first fd.
                pollsets[t % pollsets.len()].add_fd(&pairs[0].0);
                for (fd, _) in pairs.iter().skip(t).step_by(THREADS) {
                    pollsets[rng.usize(..pollsets.len())].add_fd(fd);
                }
                for _ in 0..4 {
                    let (fd, _) = &pairs[rng.usize(..pairs.len())];
                    pollsets[rng.usize(..pollsets.len())].add_fd(fd);
                }
            });
        }
    });
    // Any pollset left out by the thread count still joins through fd0.
    for pollset in &pollsets {
        pollset.add_fd(&pairs[0].0);
    }

    let ids: HashSet<u64> = pairs
        .iter()
        .map(|(fd, _)| fd_island_id(fd).expect("fd joined an island"))
        .chain(pollsets.iter().map(|p| pollset_island_id(p).expect("pollset has an island")))
        .collect();
    assert_eq!(ids.len(), 1, "islands did not converge: {ids:?}");

    let members = with_fd_island(&pairs[0].0, |state| {
        state.fds.iter().map(|fd| fd.token()).collect::<Vec<_>>()
    })
    .expect("fd joined an island");
    let unique: HashSet<u64> = members.iter().copied().collect();
    assert_eq!(members.len(), pairs.len());
    assert_eq!(unique.len(), pairs.len());

    drop(pairs);
    for pollset in pollsets {
        pollset.destroy();
    }
    engine.shutdown();
    Ok(())
}

#[test]
fn test_merge_wakes_worker_parked_on_forwarded_island() -> Result<()> {
    let engine = build_engine(PollStrategy::Epoll)?;
    let (fa1, mut fa1_peer) = registered_pair(&engine, "a1")?;
    let (fa2, _fa2_peer) = registered_pair(&engine, "a2")?;
    let (fb, _fb_peer) = registered_pair(&engine, "b")?;
    let a = engine.pollset();
    let b = engine.pollset();

    a.add_fd(&fa1);
    a.add_fd(&fa2);
    b.add_fd(&fb);
    assert_ne!(pollset_island_id(&a), pollset_island_id(&b));
    // Consume the initial writable edges.
    a.work(None, Deadline::now())?;
    b.work(None, Deadline::now())?;

    let worker = PollsetWorker::new();
    let (returned_ok, elapsed) = std::thread::scope(|s| -> Result<(bool, Duration)> {
        let parked = s.spawn(|| {
            let start = Instant::now();
            let res = b.work(Some(&worker), Deadline::after(Duration::from_secs(10)));
            (res.is_ok(), start.elapsed())
        });

        let give_up = Instant::now() + Duration::from_secs(5);
        while !matches!(worker.lock().phase, Phase::PollingIsland(_)) {
            anyhow::ensure!(Instant::now() < give_up, "worker never reached epoll_wait");
            std::thread::sleep(Duration::from_millis(1));
        }

        // The pollset's island holds more fds, so b's island is forwarded.
        a.add_fd(&fb);
        parked
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))
    })?;

    assert!(returned_ok);
    assert!(elapsed < Duration::from_secs(5), "worker stayed parked for {elapsed:?}");
    assert!(!worker.kicked());
    assert_eq!(pollset_island_id(&b), fd_island_id(&fa1));

    // b now polls the surviving island and sees a's fds.
    let spy = ClosureSpy::new();
    write_byte(&mut fa1_peer)?;
    fa1.notify_on_read(spy.closure());
    assert_eq!(work_until(&b, &spy, 1, Duration::from_secs(5))?, 1);

    drop((fa1, fa2, fb));
    a.destroy();
    b.destroy();
    engine.shutdown();
    Ok(())
}

#[test]
fn test_forwarded_island_outlives_its_last_reference_only() -> Result<()> {
    let engine = build_engine(PollStrategy::Epoll)?;
    let pool = island_pool(&engine);
    let (first, _p1) = registered_pair(&engine, "first")?;
    let (second, _p2) = registered_pair(&engine, "second")?;
    let a = engine.pollset();
    let b = engine.pollset();

    a.add_fd(&first);
    b.add_fd(&second);
    assert_ne!(fd_island_id(&first), fd_island_id(&second));

    a.add_fd(&second);
    assert_eq!(fd_island_id(&first), fd_island_id(&second));
    assert_eq!(pollset_island_id(&b), fd_island_id(&first));
    assert_eq!(pool.free_count(), 0);

    // The forwarded island is still referenced by one of these two.
    drop(first);
    b.destroy();
    assert_eq!(pool.free_count(), 1);

    let remaining = with_fd_island(&second, |state| state.fds.len()).expect("still in an island");
    assert_eq!(remaining, 1);

    drop(second);
    a.destroy();
    assert_eq!(pool.free_count(), 2);
    engine.shutdown();
    assert_eq!(pool.free_count(), 0);
    Ok(())
}

#[test]
fn test_orphan_removes_fd_from_latest_island() -> Result<()> {
    let engine = build_engine(PollStrategy::Epoll)?;
    let pairs = fds(&engine, 3)?;
    let pollset = engine.pollset();
    for (fd, _) in &pairs {
        pollset.add_fd(fd);
    }

    let mut pairs = pairs.into_iter();
    let (gone, _peer) = pairs.next().expect("three fds");
    let (kept, _kept_peer) = pairs.next().expect("three fds");
    let token = gone.as_ref().token();

    gone.orphan(None, OrphanMode::Close, "test");
    let members = with_fd_island(&kept, |state| {
        state.fds.iter().map(|fd| fd.token()).collect::<Vec<_>>()
    })
    .expect("kept fd is in an island");
    assert_eq!(members.len(), 2);
    assert!(!members.contains(&token));

    drop(pairs);
    drop(kept);
    pollset.destroy();
    engine.shutdown();
    Ok(())
}

#[test]
fn test_recycled_island_is_quiet_and_renamed() -> Result<()> {
    let engine = build_engine(PollStrategy::Epoll)?;
    let pool = island_pool(&engine);

    let (first, _p1) = registered_pair(&engine, "first")?;
    let (second, _p2) = registered_pair(&engine, "second")?;
    let a = engine.pollset();
    a.add_fd(&first);
    let b = engine.pollset();
    b.add_fd(&second);
    let before: HashSet<u64> = [fd_island_id(&first), fd_island_id(&second)]
        .into_iter()
        .flatten()
        .collect();

    // Merging adds the always-readable merge fd to the forwarded island.
    a.add_fd(&second);
    drop(first);
    drop(second);
    a.destroy();
    b.destroy();
    assert_eq!(pool.free_count(), 2);

    let islands = (0..2)
        .map(|_| pool.create(None))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(pool.free_count(), 0);

    let mut events = Vec::with_capacity(8);
    for island in &islands {
        assert!(!before.contains(&island.latest_id().as_u64()));
        assert_eq!(island.island().epoll().wait(&mut events, 0)?, 0);
        assert_eq!(island.island().pending_kicks().load(Ordering::Acquire), 0);
    }
    drop(islands);
    assert_eq!(pool.free_count(), 2);
    engine.shutdown();
    Ok(())
}

#[test]
fn test_island_ids_are_unique() {
    let ids: HashSet<_> = (0..16).map(|_| IslandId::next()).collect();
    assert_eq!(ids.len(), 16);
}
