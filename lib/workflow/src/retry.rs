//! Retry classification and backoff.
//!
//! Only transient failures are worth another attempt: network errors of any
//! subtype, and upstream statuses listed in
//! [`RetryPolicy::retryable_statuses`]. Everything else is terminal on the
//! first failure.

use crate::error::NodeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    0
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

/// Exponential backoff policy.
///
/// Keys are camelCase in workflow JSON; the snake_case aliases let the same
/// struct load from environment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default = "default_max_retries", alias = "max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms", alias = "base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier", alias = "backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Ceiling for a single delay.
    #[serde(default = "default_max_delay_ms", alias = "max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upstream statuses treated as transient.
    #[serde(default = "default_retryable_statuses", alias = "retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch again after `delay`.
    Retry { delay: Duration },
    /// The error is terminal.
    GiveUp,
}

impl RetryPolicy {
    /// Creates a policy with the given retry count and timing.
    #[must_use]
    pub fn exponential(max_retries: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            backoff_multiplier: multiplier,
            ..Self::default()
        }
    }

    /// Whether an error is transient under this policy.
    #[must_use]
    pub fn is_retryable(&self, error: &NodeError) -> bool {
        match error {
            NodeError::Network { .. } => true,
            NodeError::HttpStatus { status, .. } => self.retryable_statuses.contains(status),
            NodeError::Validation { .. }
            | NodeError::Security(_)
            | NodeError::Execution { .. }
            | NodeError::Timeout { .. }
            | NodeError::Cancelled { .. } => false,
        }
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if millis.is_finite() && millis >= 0.0 {
            millis.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// Decides whether a node that has been dispatched `attempts` times
    /// should run again after failing with `error`.
    #[must_use]
    pub fn decide(&self, error: &NodeError, attempts: u32) -> RetryDecision {
        if attempts == 0 || attempts > self.max_retries || !self.is_retryable(error) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempts - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_integration::{NetworkErrorKind, RiskLevel, SecurityErrorKind, SecurityViolation};

    fn status(code: u16) -> NodeError {
        NodeError::HttpStatus {
            status: code,
            message: String::new(),
        }
    }

    #[test]
    fn backoff_schedule_doubles() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100), 2.0);
        let delays: Vec<u64> = (0..3)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400]);
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 250,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), 2.0)
        };
        assert_eq!(policy.delay_for(5), Duration::from_millis(250));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn only_transient_errors_retry() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10), 2.0);
        let network = NodeError::Network {
            kind: NetworkErrorKind::ConnectionRefused,
            message: String::new(),
        };
        assert!(policy.is_retryable(&network));
        assert!(policy.is_retryable(&status(503)));
        assert!(!policy.is_retryable(&status(404)));
        assert!(!policy.is_retryable(&NodeError::validation("bad input")));
        assert!(!policy.is_retryable(&NodeError::Security(SecurityViolation::new(
            SecurityErrorKind::BlockedTarget,
            RiskLevel::High,
            "10.0.0.1",
            "private address",
        ))));
        assert!(!policy.is_retryable(&NodeError::Timeout { limit_ms: 5 }));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100), 2.0);
        let err = status(503);
        assert_eq!(
            policy.decide(&err, 1),
            RetryDecision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.decide(&err, 3),
            RetryDecision::Retry {
                delay: Duration::from_millis(400)
            }
        );
        assert_eq!(policy.decide(&err, 4), RetryDecision::GiveUp);
    }

    #[test]
    fn default_policy_never_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(&status(503), 1), RetryDecision::GiveUp);
    }

    #[test]
    fn accepts_both_key_styles() {
        let camel: RetryPolicy =
            serde_json::from_str(r#"{"maxRetries": 2, "baseDelayMs": 50}"#).expect("camel");
        let snake: RetryPolicy =
            serde_json::from_str(r#"{"max_retries": 2, "base_delay_ms": 50}"#).expect("snake");
        assert_eq!(camel, snake);
        assert_eq!(camel.retryable_statuses, default_retryable_statuses());
    }
}
