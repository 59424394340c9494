//! Retry classification and backoff curves.
//!
//! Stateless: the engine is the sole retry-vs-fail decision point. A failure
//! is retried only when its kind is on the node's `retryable_errors`
//! allowlist and attempts remain. `INVALID_CONFIG` and `MISSING_INPUT` never
//! retry regardless of the allowlist.

use std::time::Duration;

use stitchflow_types::error::ErrorKind;
use stitchflow_types::pipeline::{Backoff, RetryPolicy};

/// Whether the just-failed attempt (1-based) should be retried.
pub fn should_retry(policy: Option<&RetryPolicy>, kind: ErrorKind, attempt: u32) -> bool {
    if kind.is_never_retryable() {
        return false;
    }
    let Some(policy) = policy else {
        return false;
    };
    attempt <= policy.max_retries && policy.retryable_errors.contains(&kind)
}

/// Delay before re-dispatching after the given failed attempt (1-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = Duration::from_millis(policy.retry_delay_ms);
    match policy.backoff {
        Backoff::Linear => base * attempt,
        Backoff::Exponential => base * 2u32.saturating_pow(attempt.saturating_sub(1)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, backoff: Backoff, kinds: Vec<ErrorKind>) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay_ms: 100,
            backoff,
            retryable_errors: kinds,
        }
    }

    #[test]
    fn test_retry_requires_allowlisted_kind() {
        let p = policy(3, Backoff::Linear, vec![ErrorKind::ProviderError]);
        assert!(should_retry(Some(&p), ErrorKind::ProviderError, 1));
        assert!(!should_retry(Some(&p), ErrorKind::ExecutionFailed, 1));
    }

    #[test]
    fn test_retry_exhausts_after_max() {
        let p = policy(2, Backoff::Linear, vec![ErrorKind::Timeout]);
        assert!(should_retry(Some(&p), ErrorKind::Timeout, 1));
        assert!(should_retry(Some(&p), ErrorKind::Timeout, 2));
        assert!(!should_retry(Some(&p), ErrorKind::Timeout, 3));
    }

    #[test]
    fn test_config_errors_never_retry() {
        let p = policy(
            3,
            Backoff::Linear,
            vec![ErrorKind::InvalidConfig, ErrorKind::MissingInput],
        );
        assert!(!should_retry(Some(&p), ErrorKind::InvalidConfig, 1));
        assert!(!should_retry(Some(&p), ErrorKind::MissingInput, 1));
    }

    #[test]
    fn test_no_policy_means_no_retry() {
        assert!(!should_retry(None, ErrorKind::ProviderError, 1));
    }

    #[test]
    fn test_linear_backoff_scales_with_attempt() {
        let p = policy(5, Backoff::Linear, vec![]);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let p = policy(5, Backoff::Exponential, vec![]);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&p, 4), Duration::from_millis(800));
    }
}
