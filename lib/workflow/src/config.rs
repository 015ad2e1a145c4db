//! Engine configuration.

use crate::budget::ConcurrencyConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use weaver_integration::{ResourceLimits, SecurityPolicy};

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_sink_retry_attempts() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    1024
}

/// What happens to a disabled node and its downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisabledNodePolicy {
    /// Outgoing edges resolve dead, so the downstream skips unless fed
    /// from elsewhere.
    #[default]
    #[serde(alias = "skip")]
    Skip,
    /// Input items are forwarded unchanged on the `main` output.
    #[serde(alias = "pass_through", alias = "passthrough")]
    PassThrough,
}

/// Everything the engine reads at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub security: SecurityPolicy,
    /// Applied to nodes without their own retry settings.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, alias = "disabledNodes")]
    pub disabled_nodes: DisabledNodePolicy,
    /// How long running nodes get to react to a cancel before being aborted.
    #[serde(default = "default_cancel_grace_ms", alias = "cancelGraceMs")]
    pub cancel_grace_ms: u64,
    /// Extra attempts per persistence record.
    #[serde(default = "default_sink_retry_attempts", alias = "sinkRetryAttempts")]
    pub sink_retry_attempts: u32,
    /// Lifecycle events buffered per subscriber.
    #[serde(default = "default_event_capacity", alias = "eventCapacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            limits: ResourceLimits::default(),
            security: SecurityPolicy::default(),
            retry: RetryPolicy::default(),
            disabled_nodes: DisabledNodePolicy::default(),
            cancel_grace_ms: default_cancel_grace_ms(),
            sink_retry_attempts: default_sink_retry_attempts(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.disabled_nodes, DisabledNodePolicy::Skip);
        assert_eq!(config.cancel_grace(), Duration::from_secs(5));
    }

    #[test]
    fn accepts_both_key_styles() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "disabledNodes": "passThrough",
            "cancel_grace_ms": 250,
            "concurrency": { "perExecution": 2, "global": 3 },
            "retry": { "maxRetries": 3, "base_delay_ms": 100 }
        }))
        .expect("parse");
        assert_eq!(config.disabled_nodes, DisabledNodePolicy::PassThrough);
        assert_eq!(config.cancel_grace_ms, 250);
        assert_eq!(config.concurrency.per_execution, 2);
        assert_eq!(config.concurrency.global, 3);
        assert_eq!(config.concurrency.per_user, 16);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 100);
    }
}
