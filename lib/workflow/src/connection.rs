//! Connections between node ports.
//!
//! A connection carries the items a source node emits on one output port to
//! one input port of a target node. Several connections may feed the same
//! input; their items are concatenated in declaration order.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// The port name used when a connection does not name one.
pub const MAIN_PORT: &str = "main";

fn main_port() -> String {
    MAIN_PORT.to_string()
}

/// A connection from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source_node_id: NodeId,
    #[serde(default = "main_port")]
    pub source_output: String,
    pub target_node_id: NodeId,
    #[serde(default = "main_port")]
    pub target_input: String,
    /// Optional inputs never hold back the target's readiness.
    #[serde(default)]
    pub optional: bool,
}

impl Connection {
    /// Connects `main` to `main`.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source_node_id: source.into(),
            source_output: main_port(),
            target_node_id: target.into(),
            target_input: main_port(),
            optional: false,
        }
    }

    /// Sets the source output port.
    #[must_use]
    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_output = port.into();
        self
    }

    /// Sets the target input port.
    #[must_use]
    pub fn to_port(mut self, port: impl Into<String>) -> Self {
        self.target_input = port.into();
        self
    }

    /// Marks the connection optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}
