//! Retry delay math for the Fast Worker Pool's backoff policy (spec §4.H).
//!
//! `attempt` is 1-indexed, matching the spec's own numbering: the first
//! retry (after the initial attempt fails) is `attempt = 1`.

use std::time::Duration;

use marketlake_core::config::{BackoffKind, RetryConfig};
use rand::Rng;

pub fn delay_for_attempt(policy: &RetryConfig, attempt: u32) -> Duration {
    let base = policy.base_delay_ms as f64;
    let raw_ms = match policy.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Linear => base * attempt as f64 * policy.factor,
        BackoffKind::Exponential => base * policy.factor.powi(attempt as i32 - 1),
    };
    let capped_ms = raw_ms.min(policy.max_delay_ms as f64).max(0.0);
    Duration::from_millis(with_jitter(capped_ms) as u64)
}

/// ±10% jitter, per spec §4.H "A small jitter (±10%) SHOULD be added."
fn with_jitter(ms: f64) -> f64 {
    let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
    (ms * (1.0 + jitter_frac)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffKind) -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            backoff,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            factor: 2.0,
        }
    }

    #[test]
    fn fixed_backoff_ignores_attempt_number() {
        let policy = policy(BackoffKind::Fixed);
        for attempt in 1..=4 {
            let delay = delay_for_attempt(&policy, attempt).as_millis() as f64;
            assert!((900.0..=1100.0).contains(&delay), "attempt {attempt} delay {delay} out of jitter range");
        }
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let policy = policy(BackoffKind::Linear);
        let attempt2 = delay_for_attempt(&policy, 2).as_millis() as f64;
        // base=1000, factor=2 -> 1000*2*2 = 4000ms, ±10%
        assert!((3600.0..=4400.0).contains(&attempt2));
    }

    #[test]
    fn exponential_backoff_doubles_each_attempt() {
        let policy = policy(BackoffKind::Exponential);
        let attempt1 = delay_for_attempt(&policy, 1).as_millis() as f64;
        let attempt3 = delay_for_attempt(&policy, 3).as_millis() as f64;
        // attempt1: 1000*2^0=1000ms, attempt3: 1000*2^2=4000ms, ±10% each
        assert!((900.0..=1100.0).contains(&attempt1));
        assert!((3600.0..=4400.0).contains(&attempt3));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let mut policy = policy(BackoffKind::Exponential);
        policy.max_delay_ms = 2_000;
        let delay = delay_for_attempt(&policy, 10).as_millis() as f64;
        assert!(delay <= 2_200.0, "delay {delay} should be capped near max_delay_ms plus jitter");
    }
}
