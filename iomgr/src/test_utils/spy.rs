use crate::closure::Closure;
use crate::error::Error;
use std::sync::{Arc, RwLock};

/// Records every invocation of the closures it hands out.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClosureSpy {
    calls: Arc<RwLock<Vec<Error>>>,
}

impl ClosureSpy {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A fresh closure that records into this spy.
    pub(crate) fn closure(&self) -> Arc<Closure> {
        let calls = Arc::clone(&self.calls);
        Closure::new(move |error| calls.write().unwrap().push(error))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.calls.read().unwrap().last().cloned()
    }

    pub(crate) fn errors(&self) -> Vec<Error> {
        self.calls.read().unwrap().clone()
    }
}
