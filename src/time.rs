//! Monotonic millisecond clock and deadline arithmetic.
//!
//! Every long-lived wait in the proxy (a stream interface's connect/data
//! timeout, a proxy's management-task rearm, the readiness engine's poll
//! deadline) is expressed as a [`Tick`] rather than a wall-clock
//! [`std::time::Instant`] directly, so that wraparound-tolerant comparisons
//! stay centralized in one place.

use std::time::{Duration, Instant};

/// A monotonic tick counter, in milliseconds since an arbitrary epoch fixed
/// at process start. Wraps on overflow; comparisons use wrapping arithmetic
/// so a wrapped tick still orders correctly against its neighbors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tick(u64);

impl Tick {
    pub const fn from_millis(millis: u64) -> Tick {
        Tick(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// `self + duration`, saturating rather than panicking on overflow (the
    /// tick counter is wide enough that this only matters for deliberately
    /// huge configured timeouts).
    pub fn add(self, duration: Duration) -> Tick {
        Tick(self.0.saturating_add(duration.as_millis() as u64))
    }

    /// True if `self` is at or before `now`, tolerant of the rare wraparound
    /// at `u64::MAX`: a deadline is "expired" if `now - self` is small and
    /// non-negative under wrapping subtraction, rather than if `self <= now`
    /// by plain comparison (which breaks the instant the counter wraps).
    pub fn is_expired(self, now: Tick) -> bool {
        let elapsed = now.0.wrapping_sub(self.0);
        // Half the address space: far enough in the "past" that this can only
        // be a real deadline, never a deadline that wrapped around in front
        // of `now`.
        elapsed <= (u64::MAX / 2)
    }

    pub fn saturating_duration_until(self, now: Tick) -> Duration {
        if self.is_expired(now) {
            Duration::ZERO
        } else {
            Duration::from_millis(self.0.wrapping_sub(now.0))
        }
    }
}

/// Source of [`Tick`] values, backed by [`std::time::Instant`].
///
/// A single `Clock` is created at startup and shared (by reference) across
/// the readiness engine, proxies and sessions; nothing here is reentrant or
/// thread-safe, matching the single-threaded cooperative scheduling model.
#[derive(Debug)]
pub struct Clock {
    epoch: Instant,
    now: Tick,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            epoch: Instant::now(),
            now: Tick(0),
        }
    }

    /// Current cached tick. Cheap: does not syscall.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Refresh the cached tick from the monotonic clock. Called once per
    /// event loop turn, never from inside a callback.
    pub fn refresh(&mut self) -> Tick {
        let elapsed = self.epoch.elapsed();
        self.now = Tick(elapsed.as_millis() as u64);
        self.now
    }

    pub fn deadline(&self, from: Duration) -> Tick {
        self.now.add(from)
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_monotone_without_wrap() {
        let deadline = Tick::from_millis(100);
        assert!(!deadline.is_expired(Tick::from_millis(99)));
        assert!(deadline.is_expired(Tick::from_millis(100)));
        assert!(deadline.is_expired(Tick::from_millis(101)));
    }

    #[test]
    fn expiry_tolerates_wraparound() {
        let deadline = Tick::from_millis(u64::MAX - 5);
        // `now` has wrapped past the epoch boundary, but only by a small
        // amount: the deadline must still read as not-yet-expired.
        assert!(!deadline.is_expired(Tick::from_millis(u64::MAX - 10)));
        assert!(deadline.is_expired(Tick::from_millis(2)));
    }
}
