use rand::Rng;
use std::time::Duration;

/// Upper bound on any single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Demand retry delay: `base_ms` plus up to `jitter_ms` of random spread, so
/// jobs started together do not re-request in lockstep. Capped at
/// [`MAX_RETRY_DELAY`].
pub fn jittered_delay(base_ms: u64, jitter_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let spread = rng.gen_range(0..=jitter_ms);
    Duration::from_millis(base_ms.saturating_add(spread)).min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_bounds() {
        for _ in 0..100 {
            let d = jittered_delay(200, 50);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(jittered_delay(20, 0), Duration::from_millis(20));
    }

    #[test]
    fn extreme_values_are_capped() {
        assert_eq!(jittered_delay(u64::MAX, u64::MAX), MAX_RETRY_DELAY);
        assert_eq!(jittered_delay(u64::MAX, 0), MAX_RETRY_DELAY);
    }
}
