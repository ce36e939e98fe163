use crate::epoll::IslandPool;
use crate::fd::{Fd, FdPool};
use crate::pollset::Pollset;
use crate::pollset_set::PollsetSet;
use crate::sys::Epoll;
use anyhow::{Result, anyhow, bail};
use std::env;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Environment variable read by [`Builder::from_env`].
pub const POLL_STRATEGY_ENV: &str = "IOMGR_POLL_STRATEGY";

/// Concurrent `epoll_wait` callers allowed per polling island.
const MAX_POLLERS_PER_ISLAND: usize = 1;

/// Events fetched per `epoll_wait`.
const MAX_EPOLL_EVENTS: usize = 100;

/// Wakeup fds each pollset keeps around for its poll-engine workers.
const WAKEUP_CACHE_SIZE: usize = 4;

/// Readiness mechanism backing an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollStrategy {
    /// `epoll` with polling islands.
    Epoll,
    /// Portable `poll(2)`.
    Poll,
}

impl PollStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            PollStrategy::Epoll => "epoll",
            PollStrategy::Poll => "poll",
        }
    }

    fn is_available(&self) -> bool {
        match self {
            PollStrategy::Epoll => Engine::is_epoll_available(),
            PollStrategy::Poll => true,
        }
    }

    /// Parses a comma-separated preference list. `all` expands to every
    /// strategy, best first.
    fn parse_list(list: &str) -> Result<Vec<PollStrategy>> {
        let mut strategies = Vec::new();
        for name in list.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            match name {
                "epoll" => strategies.push(PollStrategy::Epoll),
                "poll" => strategies.push(PollStrategy::Poll),
                "all" => strategies.extend([PollStrategy::Epoll, PollStrategy::Poll]),
                other => bail!("unknown poll strategy: {other:?}"),
            }
        }
        Ok(strategies)
    }
}

impl fmt::Display for PollStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Candidate strategies in preference order. The first available one is
    /// used.
    strategies: Vec<PollStrategy>,

    /// How many workers may sit in `epoll_wait` on the same island. Extra
    /// workers queue for a lease.
    max_pollers_per_island: usize,

    /// Size of the event buffer handed to `epoll_wait`.
    max_epoll_events: usize,

    /// Wakeup fds cached per pollset under the poll engine.
    wakeup_cache_size: usize,
}

impl Builder {
    fn new(strategies: Vec<PollStrategy>) -> Self {
        Self {
            strategies,
            max_pollers_per_island: MAX_POLLERS_PER_ISLAND,
            max_epoll_events: MAX_EPOLL_EVENTS,
            wakeup_cache_size: WAKEUP_CACHE_SIZE,
        }
    }

    /// Returns a builder for the epoll engine.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_epoll() -> Builder {
        Builder::new(vec![PollStrategy::Epoll])
    }

    pub fn new_poll() -> Builder {
        Builder::new(vec![PollStrategy::Poll])
    }

    /// Picks the strategy from [`POLL_STRATEGY_ENV`], a comma-separated list
    /// of `epoll`, `poll` or `all`. Unset means `all`.
    pub fn from_env() -> Result<Builder> {
        let list = env::var(POLL_STRATEGY_ENV).unwrap_or_else(|_| "all".to_string());
        let strategies = PollStrategy::parse_list(&list)?;
        Ok(Builder::new(strategies))
    }

    #[track_caller]
    pub fn max_pollers_per_island(mut self, val: usize) -> Self {
        assert!(val > 0, "max_pollers_per_island must be greater than 0");
        self.max_pollers_per_island = val;
        self
    }

    #[track_caller]
    pub fn max_epoll_events(mut self, val: usize) -> Self {
        assert!(val > 0, "max_epoll_events must be greater than 0");
        self.max_epoll_events = val;
        self
    }

    pub fn wakeup_cache_size(mut self, val: usize) -> Self {
        self.wakeup_cache_size = val;
        self
    }

    /// Creates the configured `Engine`.
    pub fn try_build(self) -> Result<Engine> {
        let cfg = self.try_into()?;
        Engine::new(cfg)
    }
}

/// Snapshot of the builder settings, carried by the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub strategy: PollStrategy,
    pub max_pollers_per_island: usize,
    pub max_epoll_events: usize,
    pub wakeup_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            strategy: PollStrategy::Epoll,
            max_pollers_per_island: MAX_POLLERS_PER_ISLAND,
            max_epoll_events: MAX_EPOLL_EVENTS,
            wakeup_cache_size: WAKEUP_CACHE_SIZE,
        }
    }
}

impl TryFrom<Builder> for EngineConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let strategy = builder
            .strategies
            .iter()
            .copied()
            .find(PollStrategy::is_available)
            .ok_or_else(|| anyhow!("none of the requested poll strategies is available: {:?}", builder.strategies))?;

        Ok(EngineConfig {
            strategy,
            max_pollers_per_island: builder.max_pollers_per_island,
            max_epoll_events: builder.max_epoll_events,
            wakeup_cache_size: builder.wakeup_cache_size,
        })
    }
}

/// State shared by everything created from one engine.
pub(crate) struct EngineShared {
    pub(crate) cfg: EngineConfig,
    pub(crate) fds: Arc<FdPool>,
    /// Epoll engine only.
    pub(crate) islands: Option<Arc<IslandPool>>,
}

/// An initialized I/O manager. Fds, pollsets and pollset-sets are created
/// from it and stay tied to its poll strategy.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    fn new(cfg: EngineConfig) -> Result<Engine> {
        let islands = match cfg.strategy {
            PollStrategy::Epoll => Some(
                IslandPool::new(cfg.max_pollers_per_island, cfg.max_epoll_events)
                    .map_err(|e| anyhow!("failed to set up polling islands: {e}"))?,
            ),
            PollStrategy::Poll => None,
        };

        tracing::debug!(engine = cfg.strategy.name(), "engine initialized");
        Ok(Engine {
            shared: Arc::new(EngineShared {
                fds: FdPool::new(cfg.strategy),
                islands,
                cfg,
            }),
        })
    }

    /// True when `epoll_create1` works on this system.
    pub fn is_epoll_available() -> bool {
        Epoll::new().is_ok()
    }

    pub fn name(&self) -> &'static str {
        self.shared.cfg.strategy.name()
    }

    pub fn strategy(&self) -> PollStrategy {
        self.shared.cfg.strategy
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.cfg
    }

    /// Takes ownership of `raw`. `name` shows up in logs.
    pub fn fd_create(&self, raw: RawFd, name: &str) -> Fd {
        tracing::trace!(fd = raw, name, "fd created");
        Fd::new(self.shared.fds.alloc(raw, name))
    }

    pub fn pollset(&self) -> Pollset {
        Pollset::new(Arc::clone(&self.shared))
    }

    pub fn pollset_set(&self) -> PollsetSet {
        PollsetSet::new()
    }

    /// Releases the engine's pooled fd states and islands. Objects still
    /// alive keep working; their resources are freed when they drop.
    pub fn shutdown(self) {
        self.shared.fds.clear_freelist();
        if let Some(islands) = &self.shared.islands {
            islands.clear_freelist();
        }
        tracing::debug!(engine = self.name(), "engine shut down");
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.cfg)
            .finish_non_exhaustive()
    }
}
