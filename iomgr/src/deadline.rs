use std::time::{Duration, Instant};

/// Waits shorter than this are turned into a non-blocking poll.
const MAX_SPIN_POLLING: Duration = Duration::from_micros(10);

/// Bounds every blocking call made by a pollset worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    Infinite,
    At(Instant),
}

impl Deadline {
    pub fn infinite() -> Self {
        Deadline::Infinite
    }

    /// A deadline that has already passed; `work` does a single non-blocking pass.
    pub fn now() -> Self {
        Deadline::At(Instant::now())
    }

    /// Saturates to `Infinite` when `timeout` overflows the clock.
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Deadline::Infinite, Deadline::At)
    }

    pub fn has_passed(&self) -> bool {
        match self {
            Deadline::Infinite => false,
            Deadline::At(at) => *at <= Instant::now(),
        }
    }

    pub(crate) fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::Infinite => None,
            Deadline::At(at) => Some(*at),
        }
    }

    /// Converts to the millisecond timeout taken by `epoll_wait` and `poll`.
    ///
    /// - infinite maps to `-1`
    /// - anything within 10µs of now maps to `0`
    /// - everything else rounds up to the next millisecond, with a floor of 1
    pub(crate) fn to_millis_timeout(&self) -> i32 {
        self.to_millis_timeout_from(Instant::now())
    }

    fn to_millis_timeout_from(&self, now: Instant) -> i32 {
        let at = match self {
            Deadline::Infinite => return -1,
            Deadline::At(at) => *at,
        };

        if at <= now + MAX_SPIN_POLLING {
            return 0;
        }

        let timeout = at - now + Duration::from_nanos(999_999);
        match i32::try_from(timeout.as_millis()) {
            Ok(millis) => millis.max(1),
            Err(_) => -1,
        }
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Deadline::after(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::spin(Duration::from_micros(5), 0)]
    #[case::spin_edge(Duration::from_micros(10), 0)]
    #[case::sub_millisecond(Duration::from_micros(11), 1)]
    #[case::one_millisecond(Duration::from_millis(1), 1)]
    #[case::rounds_up(Duration::from_micros(1_001), 2)]
    #[case::exact(Duration::from_millis(250), 250)]
    fn test_to_millis_timeout(#[case] ahead: Duration, #[case] expected: i32) {
        let now = Instant::now();
        let deadline = Deadline::At(now + ahead);
        assert_eq!(deadline.to_millis_timeout_from(now), expected);
    }

    #[test]
    fn test_infinite_is_minus_one() {
        assert_eq!(Deadline::infinite().to_millis_timeout(), -1);
        assert!(!Deadline::infinite().has_passed());
    }

    #[test]
    fn test_past_deadline_is_zero() {
        let now = Instant::now();
        let past = Deadline::At(now);
        assert_eq!(past.to_millis_timeout_from(now + Duration::from_secs(1)), 0);
        assert!(past.has_passed());
    }

    #[test]
    fn test_overflow_is_infinite() {
        let now = Instant::now();
        let far = Deadline::At(now + Duration::from_secs(u32::MAX as u64));
        assert_eq!(far.to_millis_timeout_from(now), -1);
    }
}
