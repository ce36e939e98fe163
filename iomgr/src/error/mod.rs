//! Immutable, reference-counted error values.
//!
//! An [`Error`] is either one of three sentinels (`NONE`, `OOM`, `CANCELLED`)
//! or a heap value holding persistent maps of integer, string and time
//! attributes plus an ordered list of child errors. Setters consume the error
//! and return a new one: a uniquely owned value is updated in place, a shared
//! one is copied by sharing the persistent map nodes, so a published error is
//! never mutated under another thread.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

mod avl;
use avl::AvlMap;

mod keys;
pub use keys::{IntProperty, StatusCode, StrProperty, TimeProperty};

mod render;

#[cfg(test)]
mod tests;

#[derive(Clone, Default)]
pub struct Error(Repr);

#[derive(Clone, Default)]
enum Repr {
    #[default]
    None,
    Oom,
    Cancelled,
    Heap(Arc<ErrorData>),
}

pub(crate) struct ErrorData {
    ints: AvlMap<IntProperty, i64>,
    strs: AvlMap<StrProperty, Arc<str>>,
    times: AvlMap<TimeProperty, SystemTime>,
    /// Keyed by insertion index so iteration follows insertion order.
    children: AvlMap<usize, Error>,
    next_child: usize,
    rendered: OnceLock<String>,
}

impl Clone for ErrorData {
    fn clone(&self) -> Self {
        Self {
            ints: self.ints.clone(),
            strs: self.strs.clone(),
            times: self.times.clone(),
            children: self.children.clone(),
            next_child: self.next_child,
            rendered: OnceLock::new(),
        }
    }
}

impl ErrorData {
    fn new(description: &str, location: &Location<'_>) -> Self {
        Self {
            ints: AvlMap::new().insert(IntProperty::FileLine, i64::from(location.line())),
            strs: AvlMap::new()
                .insert(StrProperty::File, Arc::from(location.file()))
                .insert(StrProperty::Description, Arc::from(description)),
            times: AvlMap::new().insert(TimeProperty::Created, SystemTime::now()),
            children: AvlMap::new(),
            next_child: 0,
            rendered: OnceLock::new(),
        }
    }

    fn push_child(&mut self, child: Error) {
        if child.is_none() {
            return;
        }
        self.children = self.children.insert(self.next_child, child);
        self.next_child += 1;
    }
}

impl Error {
    /// Success. Carries no attributes.
    pub const NONE: Error = Error(Repr::None);

    /// Resource exhaustion. Usable without allocating.
    pub const OOM: Error = Error(Repr::Oom);

    pub const CANCELLED: Error = Error(Repr::Cancelled);

    /// Creates an error recording the caller's file and line and the creation
    /// time.
    #[track_caller]
    pub fn new(description: impl AsRef<str>) -> Self {
        let data = ErrorData::new(description.as_ref(), Location::caller());
        Error(Repr::Heap(Arc::new(data)))
    }

    /// Creates an error that references `children`. `NONE` children are
    /// skipped.
    #[track_caller]
    pub fn with_children<I>(description: impl AsRef<str>, children: I) -> Self
    where
        I: IntoIterator<Item = Error>,
    {
        let mut data = ErrorData::new(description.as_ref(), Location::caller());
        for child in children {
            data.push_child(child);
        }
        Error(Repr::Heap(Arc::new(data)))
    }

    /// Error for a failed syscall, carrying `errno`, its `strerror` text and
    /// the syscall name.
    #[track_caller]
    pub fn os_error(errno: i32, syscall: &str) -> Self {
        Error::new("OS Error")
            .set_int(IntProperty::Errno, i64::from(errno))
            .set_str(StrProperty::OsError, strerror(errno))
            .set_str(StrProperty::Syscall, syscall)
    }

    pub fn is_none(&self) -> bool {
        matches!(self.0, Repr::None)
    }

    /// True for the three sentinels, which carry no attributes.
    pub fn is_special(&self) -> bool {
        !matches!(self.0, Repr::Heap(_))
    }

    #[track_caller]
    pub fn set_int(self, which: IntProperty, value: i64) -> Self {
        self.update(|data| data.ints = data.ints.insert(which, value))
    }

    #[track_caller]
    pub fn set_str(self, which: StrProperty, value: &str) -> Self {
        self.update(|data| data.strs = data.strs.insert(which, Arc::from(value)))
    }

    #[track_caller]
    pub fn set_time(self, which: TimeProperty, value: SystemTime) -> Self {
        self.update(|data| data.times = data.times.insert(which, value))
    }

    /// Adds `child` to the referenced errors.
    ///
    /// - `NONE` with a child returns the child itself.
    /// - A `NONE` child, or adding an error to itself, returns `self`.
    #[track_caller]
    pub fn add_child(self, child: Error) -> Self {
        if self.is_none() {
            return child;
        }
        if child.is_none() || self.same_as(&child) {
            return self;
        }
        self.update(|data| data.push_child(child))
    }

    pub fn get_int(&self, which: IntProperty) -> Option<i64> {
        match &self.0 {
            Repr::Heap(data) => data.ints.get(&which).copied(),
            special => match which {
                IntProperty::GrpcStatus => Some(special_status(special).as_i64()),
                _ => None,
            },
        }
    }

    pub fn get_str(&self, which: StrProperty) -> Option<&str> {
        match &self.0 {
            Repr::Heap(data) => data.strs.get(&which).map(|s| s.as_ref()),
            _ => None,
        }
    }

    pub fn get_time(&self, which: TimeProperty) -> Option<SystemTime> {
        match &self.0 {
            Repr::Heap(data) => data.times.get(&which).copied(),
            _ => None,
        }
    }

    /// Referenced errors in insertion order.
    pub fn children(&self) -> impl Iterator<Item = &Error> + '_ {
        let data = match &self.0 {
            Repr::Heap(data) => Some(data),
            _ => None,
        };
        data.into_iter()
            .flat_map(|data| data.children.iter().map(|(_, child)| child))
    }

    /// Status code and message this error maps to.
    ///
    /// The tree is searched in pre-order (the error itself, then each child
    /// subtree in insertion order) and the first node carrying
    /// [`IntProperty::GrpcStatus`] wins. Without one the code is
    /// [`StatusCode::Unknown`] and the message comes from the root.
    pub fn get_status(&self) -> (StatusCode, String) {
        if self.is_none() {
            return (StatusCode::Ok, String::new());
        }

        let (node, code) = match self.find_status() {
            Some((node, code)) => (node, StatusCode::from_i64(code)),
            None => (self, StatusCode::Unknown),
        };

        let message = match &node.0 {
            Repr::Heap(_) => node
                .get_str(StrProperty::GrpcMessage)
                .or_else(|| node.get_str(StrProperty::Description))
                .unwrap_or("unknown error")
                .to_string(),
            Repr::Oom => "RESOURCE_EXHAUSTED".to_string(),
            Repr::Cancelled => "CANCELLED".to_string(),
            Repr::None => String::new(),
        };

        (code, message)
    }

    fn find_status(&self) -> Option<(&Error, i64)> {
        if let Some(code) = self.get_int(IntProperty::GrpcStatus) {
            return Some((self, code));
        }
        self.children().find_map(|child| child.find_status())
    }

    /// JSON rendering, computed once per error value.
    pub fn rendered(&self) -> &str {
        match &self.0 {
            Repr::None => "\"OK\"",
            Repr::Oom => "\"RESOURCE_EXHAUSTED\"",
            Repr::Cancelled => "\"CANCELLED\"",
            Repr::Heap(data) => data.rendered.get_or_init(|| render::render(data)),
        }
    }

    fn same_as(&self, other: &Error) -> bool {
        match (&self.0, &other.0) {
            (Repr::Heap(a), Repr::Heap(b)) => Arc::ptr_eq(a, b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }

    /// Copy-on-write entry point for every setter.
    #[track_caller]
    fn update(self, f: impl FnOnce(&mut ErrorData)) -> Self {
        let mut arc = match self.0 {
            Repr::Heap(arc) => arc,
            special => Arc::new(materialize(&special, Location::caller())),
        };

        let data = Arc::make_mut(&mut arc);
        data.rendered = OnceLock::new();
        f(data);

        Error(Repr::Heap(arc))
    }
}

fn special_status(repr: &Repr) -> StatusCode {
    match repr {
        Repr::None => StatusCode::Ok,
        Repr::Oom => StatusCode::ResourceExhausted,
        Repr::Cancelled => StatusCode::Cancelled,
        Repr::Heap(_) => StatusCode::Unknown,
    }
}

/// Heap copy of a sentinel, so it can take attributes.
fn materialize(repr: &Repr, location: &Location<'_>) -> ErrorData {
    let (description, status) = match repr {
        Repr::None => ("no error", Some(StatusCode::Ok)),
        Repr::Oom => ("oom", None),
        Repr::Cancelled => ("cancelled", Some(StatusCode::Cancelled)),
        Repr::Heap(_) => ("unknown", None),
    };

    let mut data = ErrorData::new(description, location);
    if let Some(status) = status {
        data.ints = data.ints.insert(IntProperty::GrpcStatus, status.as_i64());
    }
    data
}

fn strerror(errno: i32) -> &'static str {
    nix::errno::Errno::from_raw(errno).desc()
}

/// Folds `error` into `composite`, creating the composite with
/// `description` on the first failure.
#[track_caller]
pub(crate) fn append_error(composite: &mut Error, description: &str, error: Error) {
    if error.is_none() {
        return;
    }
    if composite.is_none() {
        *composite = Error::new(description);
    }
    *composite = std::mem::take(composite).add_child(error);
}

/// Logs and drops a non-`NONE` error. Returns true when `error` was `NONE`.
pub(crate) fn log_if_error(what: &str, error: Error) -> bool {
    if error.is_none() {
        return true;
    }
    tracing::warn!(what, error = %error, "operation failed");
    false
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rendered())
    }
}

impl std::error::Error for Error {}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rendered())
    }
}
