pub(crate) mod id;
pub(crate) use id::{IslandId, PollsetId, PollsetSetId, WorkerId};

pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;
