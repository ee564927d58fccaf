//! Tunable timeouts and retry budgets.
//!
//! Plain struct trees with `Default` impls holding the timeout table; no
//! external configuration-file crate is involved.

use std::time::Duration;

/// Timeouts for the various suspension points a session can block on.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// `CommandMux::request` default timeout.
    pub request: Duration,
    /// `CommandMux::await_notification` default timeout.
    pub notification: Duration,
    /// Hello-acknowledgment timer armed after sending the client hello.
    pub hello_ack: Duration,
    /// Outer timeout for the best-effort high-priority connection request.
    pub high_priority_request: Duration,
    /// Scan timeout when `keep_connection` is false.
    pub scan: Duration,
    /// Spacing between signed-time refresh retry attempts.
    pub signed_time_retry_spacing: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            notification: Duration::from_secs(30),
            hello_ack: Duration::from_secs(5),
            high_priority_request: Duration::from_secs(2),
            scan: Duration::from_secs(30),
            signed_time_retry_spacing: Duration::from_secs(5),
        }
    }
}

/// Retry budgets, kept as distinct first-class objects rather than folded
/// into a single generic retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudgets {
    /// Maximum `BUSY` retries for a single `LockApi` operation.
    pub busy_max_attempts: u32,
    /// Spacing between `BUSY` retries.
    pub busy_spacing: Duration,
    /// Maximum attempts for the signed-time refresh loop.
    pub signed_time_max_attempts: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            busy_max_attempts: 3,
            busy_spacing: Duration::from_secs(1),
            signed_time_max_attempts: 4,
        }
    }
}

/// Top-level configuration owned by a `SessionSupervisor`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorConfig {
    /// Whether the connection should be kept alive with unbounded
    /// reconnect retries.
    pub keep_connection: bool,
    /// Timeouts for suspension points.
    pub timeouts: TimeoutConfig,
    /// Retry budgets for `BUSY` and signed-time refresh.
    pub retries: RetryBudgets,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_documented_values() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.request, Duration::from_secs(30));
        assert_eq!(timeouts.notification, Duration::from_secs(30));
        assert_eq!(timeouts.hello_ack, Duration::from_secs(5));
        assert_eq!(timeouts.high_priority_request, Duration::from_secs(2));
        assert_eq!(timeouts.scan, Duration::from_secs(30));
        assert_eq!(timeouts.signed_time_retry_spacing, Duration::from_secs(5));
    }

    #[test]
    fn default_retry_budgets_match_spec() {
        let retries = RetryBudgets::default();
        assert_eq!(retries.busy_max_attempts, 3);
        assert_eq!(retries.busy_spacing, Duration::from_secs(1));
        assert_eq!(retries.signed_time_max_attempts, 4);
    }
}
