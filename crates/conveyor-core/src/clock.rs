use chrono::{DateTime, FixedOffset, Utc};
use std::sync::{Mutex, Once};

/// Wall-clock time provider, normalized to UTC.
///
/// Decisions that must be monotonic (lease renewal scheduling, cleanup
/// intervals) use `tokio::time::Instant` directly; this trait only covers
/// visible timestamps and due-time computations so tests can inject a fixed
/// clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock with a settable instant.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock poisoned") = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().expect("clock poisoned");
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }
}

/// Normalize an externally supplied timestamp to UTC.
///
/// A non-UTC offset is logged once per process and converted.
pub fn normalize_to_utc(ts: DateTime<FixedOffset>) -> DateTime<Utc> {
    static WARN_ONCE: Once = Once::new();
    if ts.offset().local_minus_utc() != 0 {
        WARN_ONCE.call_once(|| {
            tracing::warn!(
                event = "conveyor.clock.non_utc_offset",
                offset_seconds = ts.offset().local_minus_utc(),
                "time provider returned a non-UTC offset; normalizing to UTC"
            );
        });
    }
    ts.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(
            clock.now(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 30).unwrap()
        );
    }

    #[test]
    fn normalization_preserves_the_instant() {
        let offset = FixedOffset::east_opt(3600).unwrap();
        let local = offset.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let utc = normalize_to_utc(local);
        assert_eq!(utc, Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap());
    }
}
