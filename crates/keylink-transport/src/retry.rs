//! Connection-setup retry policy.
//!
//! Retry-with-predicate logic is pulled out into a first-class policy
//! object rather than scattered `if` checks at each call site, scoped to
//! three named delay classes. There is no circuit-breaker trip/half-open
//! state here, just a retry budget.

use crate::error::TransportError;
use std::time::Duration;

/// Delay before retrying after a BLE scan-throttle error.
#[must_use]
pub fn scan_throttle_delay() -> Duration {
    Duration::from_secs(15)
}

/// Delay before retrying after a characteristic-not-found error.
#[must_use]
pub fn characteristic_not_found_delay() -> Duration {
    Duration::from_secs(15)
}

/// Delay before retrying after any other transient error.
#[must_use]
pub fn other_delay() -> Duration {
    Duration::from_secs(1)
}

/// Connection-setup retry policy.
///
/// `budget` is `None` when `keep_connection` was requested (unbounded
/// retries); otherwise a fixed attempt budget of 3, after which the caller
/// must surface `ConnectionDead`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    budget: Option<u32>,
}

impl RetryPolicy {
    /// Build the policy for a connection attempt.
    #[must_use]
    pub fn new(keep_connection: bool) -> Self {
        Self {
            budget: if keep_connection { None } else { Some(3) },
        }
    }

    /// The delay to wait before the next attempt, given the error that just
    /// occurred.
    #[must_use]
    pub fn delay_for(error: &TransportError) -> Duration {
        match error {
            TransportError::ScanThrottled => scan_throttle_delay(),
            TransportError::CharacteristicNotFound(_) => characteristic_not_found_delay(),
            _ => other_delay(),
        }
    }

    /// Whether another attempt should be made after `attempts_made` prior
    /// attempts failed with `error`.
    ///
    /// Permission-denied, invalid-certificate, missing-trusted-time, and
    /// device-not-initialized errors must never be retried regardless of
    /// budget; callers map those to non-retryable
    /// `TransportError` variants or propagate them before consulting this
    /// policy.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32, error: &TransportError) -> bool {
        if !error.is_retryable() {
            tracing::debug!(error = %error, "non-retryable error, giving up");
            return false;
        }
        match self.budget {
            None => true,
            Some(budget) => {
                let retry = attempts_made < budget;
                if !retry {
                    tracing::debug!(attempts_made, budget, "retry budget exhausted");
                }
                retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_policy_always_retries_retryable_errors() {
        let policy = RetryPolicy::new(true);
        assert!(policy.should_retry(1000, &TransportError::DeviceNotFound));
    }

    #[test]
    fn bounded_policy_exhausts_after_three_attempts() {
        let policy = RetryPolicy::new(false);
        assert!(policy.should_retry(0, &TransportError::DeviceNotFound));
        assert!(policy.should_retry(2, &TransportError::DeviceNotFound));
        assert!(!policy.should_retry(3, &TransportError::DeviceNotFound));
    }

    #[test]
    fn permission_denied_never_retries() {
        let policy = RetryPolicy::new(true);
        assert!(!policy.should_retry(0, &TransportError::PermissionDenied("ble".into())));
    }

    #[test]
    fn delay_classes_match_error_kind() {
        assert_eq!(
            RetryPolicy::delay_for(&TransportError::ScanThrottled),
            Duration::from_secs(15)
        );
        assert_eq!(
            RetryPolicy::delay_for(&TransportError::CharacteristicNotFound("send")),
            Duration::from_secs(15)
        );
        assert_eq!(
            RetryPolicy::delay_for(&TransportError::Other("link drop".into())),
            Duration::from_secs(1)
        );
    }
}
