//! Exponential retry backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Backoff before jitter: `min(base * 2^attempt, max)`.
///
/// Saturates instead of overflowing for large attempt counts, so the cap
/// always holds.
pub(crate) fn backoff_before_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(max)
}

/// Backoff scaled by a uniform random factor in `[0.5, 1.5]`.
///
/// The jitter band keeps a burst of jobs that failed together from
/// retrying in lockstep.
pub(crate) fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..=1.5);
    backoff_before_jitter(attempt, base, max).mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(10);
    const MAX: Duration = Duration::from_secs(6 * 60 * 60);

    #[test]
    fn grows_monotonically_before_jitter() {
        for attempt in 1..32 {
            let current = backoff_before_jitter(attempt, BASE, MAX);
            let next = backoff_before_jitter(attempt + 1, BASE, MAX);
            assert!(next >= current, "attempt {attempt}: {next:?} < {current:?}");
        }
    }

    #[test]
    fn caps_at_max() {
        assert_eq!(backoff_before_jitter(63, BASE, MAX), MAX);
        assert_eq!(backoff_before_jitter(200, BASE, MAX), MAX);
    }

    #[test]
    fn first_retry_doubles_the_base() {
        assert_eq!(backoff_before_jitter(1, BASE, MAX), Duration::from_secs(20));
    }

    #[test]
    fn jitter_stays_within_band() {
        for attempt in 1..12 {
            let before = backoff_before_jitter(attempt, BASE, MAX);
            for _ in 0..50 {
                let jittered = backoff_with_jitter(attempt, BASE, MAX);
                assert!(jittered >= before.mul_f64(0.5));
                assert!(jittered <= before.mul_f64(1.5));
                assert!(jittered <= MAX.mul_f64(1.5));
            }
        }
    }
}
