use std::time::{Duration, Instant};

/// Monotonic time source used for every interval computation.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Length of the interval between two readings of a [`Clock`], or `None`
/// when the clock did not move forward.
pub(crate) fn interval_between(previous: Duration, now: Duration) -> Option<Duration> {
    now.checked_sub(previous).filter(|interval| !interval.is_zero())
}
