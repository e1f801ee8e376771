//! Clock used to stamp records at normalization time.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never goes backwards, even if the system clock is stepped.
#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Reading that would be returned for a given wall-clock sample.
    fn advance(&self, sample: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if sample > *last {
            *last = sample;
        }
        *last
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        self.advance(Utc::now())
    }
}

/// Always returns the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_monotonic_clock_ignores_backward_steps() {
        let clock = MonotonicClock::new();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().expect("valid time");
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).single().expect("valid time");

        assert_eq!(clock.advance(t1), t1);
        assert_eq!(clock.advance(t0), t1);
    }

    #[test]
    fn test_monotonic_clock_is_non_decreasing() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now();
        for _ in 0..100 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
    }
}
