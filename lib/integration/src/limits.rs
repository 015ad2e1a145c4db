//! Resource ceilings applied to node execution and outbound I/O.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_node_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_max_request_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_max_response_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_outbound_per_execution() -> usize {
    4
}

/// Configurable resource limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock budget for a single node attempt.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Budget for a single outbound request, connect included.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,
    /// Concurrent outbound requests allowed per execution. Zero means unlimited.
    #[serde(default = "default_max_outbound_per_execution")]
    pub max_outbound_per_execution: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            node_timeout_ms: default_node_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_request_bytes: default_max_request_bytes(),
            max_response_bytes: default_max_response_bytes(),
            max_outbound_per_execution: default_max_outbound_per_execution(),
        }
    }
}

impl ResourceLimits {
    /// Node attempt timeout as a `Duration`.
    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    /// Outbound request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
