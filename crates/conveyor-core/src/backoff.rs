use rand::Rng;
use std::time::Duration;

/// Maps a 1-based attempt number to a retry delay.
pub trait BackoffPolicy: Send + Sync {
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with a hard ceiling and uniform jitter.
///
/// The delay is `min(base · 2^(attempt-1), ceiling)` plus a uniform draw in
/// `[0, jitter)`. With the defaults (base 500 ms, ceiling 60 s, jitter
/// 250 ms) attempt 10 stays well under two minutes.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub ceiling: Duration,
    pub jitter: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            ceiling: Duration::from_secs(60),
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let shift = (attempt - 1).min(32);
        let base_ms = self.base.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << shift);
        let capped_ms = exp_ms.min(self.ceiling.as_millis() as u64);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };

        Duration::from_millis(capped_ms + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_starts_at_base() {
        let policy = ExponentialBackoff::default();
        let delay = policy.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(500));
        assert!(delay < Duration::from_millis(750));
    }

    #[test]
    fn doubles_until_the_ceiling() {
        let policy = ExponentialBackoff {
            jitter: Duration::ZERO,
            ..ExponentialBackoff::default()
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(60));
    }

    #[test]
    fn attempt_ten_stays_under_two_minutes() {
        let policy = ExponentialBackoff::default();
        assert!(policy.delay_for_attempt(10) < Duration::from_secs(120));
    }

    #[test]
    fn zero_attempt_is_clamped() {
        let policy = ExponentialBackoff {
            jitter: Duration::ZERO,
            ..ExponentialBackoff::default()
        };
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = ExponentialBackoff::default();
        assert!(policy.delay_for_attempt(u32::MAX) <= Duration::from_secs(61));
    }
}
