use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Nanoseconds since a `MonotonicClock` epoch.
pub type Ticks = i64;

/// Sentinel stored in a closed `MonotonicExpiry`.
pub const CLOSED: Ticks = -1;

/// Converts a duration to ticks, saturating at `i64::MAX`.
pub fn ticks(duration: Duration) -> Ticks {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// A monotonic clock with a private epoch.
///
/// Backed by `tokio::time::Instant` so paused test runtimes drive it.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Ticks elapsed since the epoch.
    pub fn now(&self) -> Ticks {
        ticks(Instant::now().saturating_duration_since(self.epoch))
    }

    /// Ticks for `now + duration`, saturating.
    pub fn after(&self, duration: Duration) -> Ticks {
        self.now().saturating_add(ticks(duration))
    }

    /// Maps an instant onto this clock.
    pub fn at(&self, instant: Instant) -> Ticks {
        ticks(instant.saturating_duration_since(self.epoch))
    }

    /// Maps a non-negative tick count back to an instant.
    pub fn instant(&self, at: Ticks) -> Instant {
        let nanos = u64::try_from(at.max(0)).unwrap_or(0);
        self.epoch + Duration::from_nanos(nanos)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of offering a new value to a `MonotonicExpiry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The offered value was stored.
    Updated(Ticks),
    /// A value at least as large was already present; it is returned.
    Stale(Ticks),
    /// The cell holds the closed sentinel and accepts nothing.
    Closed,
}

impl Advance {
    /// The expiry that is in effect after the offer, if the cell is open.
    pub fn effective(self) -> Option<Ticks> {
        match self {
            Advance::Updated(value) | Advance::Stale(value) => Some(value),
            Advance::Closed => None,
        }
    }
}

/// Lock-free expiry timestamp that never moves backwards.
///
/// Several paths race to refresh the same expiry with values of very
/// different ages. Accepting a smaller value could resurrect a lease that
/// already expired, so writers only ever replace a value with a strictly
/// greater one.
#[derive(Debug)]
pub struct MonotonicExpiry {
    value: AtomicI64,
}

impl MonotonicExpiry {
    pub fn new(initial: Ticks) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    pub fn load(&self) -> Ticks {
        self.value.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.load() < 0
    }

    /// Stores `candidate` if it is strictly greater than the current value.
    pub fn advance(&self, candidate: Ticks) -> Advance {
        let mut observed = self.value.load(Ordering::Acquire);
        loop {
            if observed < 0 {
                return Advance::Closed;
            }
            if candidate <= observed {
                return Advance::Stale(observed);
            }
            match self.value.compare_exchange(
                observed,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Advance::Updated(candidate),
                Err(current) => {
                    trace!(current, observed, candidate, "expiry compare-exchange retried");
                    observed = current;
                }
            }
        }
    }

    /// Installs the closed sentinel. Later `advance` calls are rejected.
    pub fn close(&self) {
        self.value.store(CLOSED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_advance_only_moves_forward() {
        let expiry = MonotonicExpiry::new(0);

        assert_eq!(expiry.advance(100), Advance::Updated(100));
        assert_eq!(expiry.advance(50), Advance::Stale(100));
        assert_eq!(expiry.advance(100), Advance::Stale(100));
        assert_eq!(expiry.advance(101), Advance::Updated(101));
        assert_eq!(expiry.load(), 101);
    }

    #[test]
    fn test_closed_rejects_updates() {
        let expiry = MonotonicExpiry::new(500);
        expiry.close();

        assert!(expiry.is_closed());
        assert_eq!(expiry.advance(i64::MAX), Advance::Closed);
        assert_eq!(expiry.load(), CLOSED);
    }

    #[test]
    fn test_concurrent_writers_keep_maximum() {
        let expiry = Arc::new(MonotonicExpiry::new(0));
        let mut handles = vec![];

        for writer in 0..8i64 {
            let expiry = Arc::clone(&expiry);
            handles.push(thread::spawn(move || {
                let mut last_seen = 0;
                for step in 0..1_000i64 {
                    // Interleave rising and falling candidates per writer
                    let candidate = if step % 2 == 0 { step * 8 + writer } else { writer };
                    expiry.advance(candidate);
                    let seen = expiry.load();
                    assert!(seen >= last_seen, "expiry went backwards: {} -> {}", last_seen, seen);
                    last_seen = seen;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(expiry.load(), 998 * 8 + 7);
    }

    #[test]
    fn test_ticks_saturate() {
        assert_eq!(ticks(Duration::MAX), i64::MAX);
        assert_eq!(ticks(Duration::from_millis(2)), 2_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = MonotonicClock::new();
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(clock.now() - start, ticks(Duration::from_secs(3)));
        assert_eq!(clock.at(clock.instant(start)), start);
    }
}
