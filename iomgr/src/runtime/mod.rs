//! Engine construction and configuration.

mod runtime;
pub use runtime::{Builder, Engine, EngineConfig, POLL_STRATEGY_ENV, PollStrategy};

pub(crate) use runtime::EngineShared;
