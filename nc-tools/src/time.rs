//! Time sources used by the storage engine.
//!
//! `create-time` fields must be monotonic per creator (§3) even though the
//! wall clock they are derived from is not; [`MonotonicUsecClock`] enforces
//! that by clamping to "last value + 1" whenever the wall clock does not
//! advance (or goes backwards, e.g. NTP step).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in whole seconds since the epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Returns the current wall-clock time in microseconds since the epoch.
pub fn now_usec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Generator of strictly increasing `create-time` stamps for this process.
///
/// Wraps the wall clock so that two calls in the same microsecond (or a
/// clock that runs backwards) still produce distinct, increasing values,
/// matching the "monotonic per creator" requirement on blob metadata (§3).
pub struct MonotonicUsecClock {
    last: AtomicI64,
}

impl Default for MonotonicUsecClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicUsecClock {
    pub fn new() -> Self {
        MonotonicUsecClock {
            last: AtomicI64::new(0),
        }
    }

    /// Produce the next monotonic microsecond timestamp.
    pub fn next(&self) -> i64 {
        let wall = now_usec();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if wall > prev { wall } else { prev + 1 };
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(observed) => prev = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicUsecClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
    }
}
