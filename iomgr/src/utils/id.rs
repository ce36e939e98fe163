use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Defines a process-unique, monotonically allocated identifier type.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
        pub struct $name(NonZeroU64);

        impl $name {
            pub(crate) fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);

                let id = COUNTER.fetch_add(1, Ordering::Relaxed);
                let Some(id) = NonZeroU64::new(id) else {
                    exhausted($what);
                };

                Self(id)
            }

            pub(crate) fn as_u64(&self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

#[cold]
fn exhausted(what: &str) -> ! {
    panic!("failed to generate unique {what} ID: bitspace exhausted")
}

define_id!(
    /// Identifies a pollset for the lifetime of the process.
    PollsetId,
    "pollset"
);

define_id!(
    /// Identifies a pollset worker record.
    WorkerId,
    "worker"
);

define_id!(
    /// Identifies a polling island allocation. Survives freelist reuse.
    IslandId,
    "island"
);

define_id!(PollsetSetId, "pollset-set");
