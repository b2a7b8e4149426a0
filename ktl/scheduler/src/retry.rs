//! Exponential backoff with jitter (`spec.md` §4.1 "Retry policy").

use std::time::Duration;

use rand::Rng;

const BASE: Duration = Duration::from_millis(500);
const MAX: Duration = Duration::from_secs(30);

/// Full-jitter exponential backoff: `uniform(0, min(max, base * 2^attempt))`.
/// `attempt` is 0-based (the delay before the *second* attempt uses
/// `attempt == 0`).
pub fn backoff(attempt: u32) -> Duration {
    let exp = BASE.as_millis().saturating_mul(1u128 << attempt.min(16));
    let capped = exp.min(MAX.as_millis());
    let mut rng = rand::rng();
    let jittered = rng.random_range(0..=capped.max(1));
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max() {
        for attempt in 0..20 {
            assert!(backoff(attempt) <= MAX);
        }
    }

    #[test]
    fn backoff_grows_with_attempt_on_average() {
        let samples = |attempt: u32| -> u128 {
            (0..200).map(|_| backoff(attempt).as_millis()).sum::<u128>() / 200
        };
        assert!(samples(0) < samples(4));
    }
}
