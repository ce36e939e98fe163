use super::Closure;
use crate::error::Error;
use std::collections::VecDeque;
use std::sync::Arc;

/// FIFO of closures, each with the error it will be scheduled with.
#[derive(Debug, Default)]
pub struct ClosureList {
    entries: VecDeque<(Arc<Closure>, Error)>,
}

impl ClosureList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `closure` carrying `error`. Returns whether the list was empty.
    ///
    /// A missing closure drops `error` and returns false.
    pub fn append(&mut self, closure: Option<Arc<Closure>>, error: Error) -> bool {
        let Some(closure) = closure else {
            return false;
        };

        let was_empty = self.entries.is_empty();
        self.entries.push_back((closure, error));
        was_empty
    }

    /// Replaces every `NONE` error in the list with `forced`.
    pub fn fail_all(&mut self, forced: Error) {
        for (_, error) in self.entries.iter_mut() {
            if error.is_none() {
                *error = forced.clone();
            }
        }
    }

    /// Schedules every entry in order, leaving the list empty.
    pub fn sched_all(&mut self) {
        for (closure, error) in self.entries.drain(..) {
            closure.sched(error);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
