use std::marker::PhantomData;

/// Runs a closure when dropped, unless disarmed first.
///
/// Used on the worker exit paths so thread-local polling state is restored
/// on every return, including early returns through `?`.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Taken out on drop or disarm so the closure runs at most once.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }

    /// Prevents the closure from running on drop.
    #[allow(unused)]
    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guard_runs_on_drop() {
        let hits = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            assert_eq!(hits.get(), 0);
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let hits = Cell::new(0);
        {
            let mut guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            guard.disarm();
        }
        assert_eq!(hits.get(), 0);
    }
}
