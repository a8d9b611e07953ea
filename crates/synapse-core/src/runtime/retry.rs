//! Retry policy evaluation for function invocations.
//!
//! Stateless: attempt counts are persisted in the activity's metadata so a
//! recovered runtime continues the same attempt sequence.

use std::time::Duration;

use synapse_types::workflow::RetryDefinition;

/// Stateless retry handler.
///
/// `attempt` is 1-based (first execution is attempt 1).
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt may follow the failed `attempt`.
    pub fn should_retry(policy: &RetryDefinition, attempt: u32) -> bool {
        attempt < policy.max_attempts
    }

    /// Back-off before the attempt following `attempt`.
    ///
    /// `delay * multiplier^(attempt - 1)`, capped at `max_delay_ms`.
    pub fn delay_for(policy: &RetryDefinition, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let multiplier = if policy.multiplier.is_finite() && policy.multiplier >= 1.0 {
            policy.multiplier
        } else {
            1.0
        };
        let mut delay_ms = policy.delay_ms as f64 * multiplier.powi(exponent);
        if let Some(max) = policy.max_delay_ms {
            delay_ms = delay_ms.min(max as f64);
        }
        Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, delay_ms: u64, multiplier: f64, max_delay_ms: Option<u64>) -> RetryDefinition {
        RetryDefinition {
            name: "p".to_string(),
            max_attempts,
            delay_ms,
            multiplier,
            max_delay_ms,
        }
    }

    #[test]
    fn test_should_retry() {
        let p = policy(3, 100, 2.0, None);
        assert!(RetryHandler::should_retry(&p, 1));
        assert!(RetryHandler::should_retry(&p, 2));
        assert!(!RetryHandler::should_retry(&p, 3));

        let once = policy(1, 100, 2.0, None);
        assert!(!RetryHandler::should_retry(&once, 1));
    }

    #[test]
    fn test_exponential_backoff() {
        let p = policy(5, 100, 2.0, None);
        assert_eq!(RetryHandler::delay_for(&p, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay_for(&p, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::delay_for(&p, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(10, 1000, 3.0, Some(5000));
        assert_eq!(RetryHandler::delay_for(&p, 3), Duration::from_millis(5000));
        assert_eq!(RetryHandler::delay_for(&p, 9), Duration::from_millis(5000));
    }

    #[test]
    fn test_degenerate_multiplier_is_constant() {
        let p = policy(3, 250, 0.5, None);
        assert_eq!(RetryHandler::delay_for(&p, 3), Duration::from_millis(250));
    }
}
