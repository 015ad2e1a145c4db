//! Workflow nodes.
//!
//! A node is one step of a workflow. It names a registered node type, carries
//! opaque JSON parameters the type interprets, and may override engine
//! defaults through [`NodeSettings`].

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Borrow;

/// Identifier of a node, unique within its graph.
///
/// Node ids are chosen by the workflow author, so they are free-form strings
/// rather than generated ULIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Per-node overrides of engine and node-type defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    /// Turn terminal failures into error items instead of failing the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_fail: Option<bool>,
    /// Retry policy for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Wall-clock budget for one attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    /// Registered node type name, e.g. `http.request`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default = "empty_parameters")]
    pub parameters: JsonValue,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "is_default_settings")]
    pub settings: NodeSettings,
}

fn empty_parameters() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

fn is_default_settings(settings: &NodeSettings) -> bool {
    *settings == NodeSettings::default()
}

impl Node {
    /// Creates an enabled node with empty parameters.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            parameters: empty_parameters(),
            disabled: false,
            credential_refs: Vec::new(),
            settings: NodeSettings::default(),
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    /// Adds a credential reference.
    #[must_use]
    pub fn with_credential(mut self, reference: impl Into<String>) -> Self {
        self.credential_refs.push(reference.into());
        self
    }

    /// Sets the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Marks the node disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Returns a parameter by name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&JsonValue> {
        self.parameters.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_id_display() {
        let id = NodeId::from("fetch");
        assert_eq!(id.to_string(), "fetch");
        assert_eq!(id.as_str(), "fetch");
    }

    #[test]
    fn deserializes_with_defaults() {
        let node: Node = serde_json::from_value(json!({
            "id": "start",
            "type": "trigger.manual"
        }))
        .expect("deserialize");
        assert_eq!(node.id, NodeId::from("start"));
        assert_eq!(node.node_type, "trigger.manual");
        assert!(!node.disabled);
        assert!(node.credential_refs.is_empty());
        assert_eq!(node.parameters, json!({}));
        assert_eq!(node.settings, NodeSettings::default());
    }

    #[test]
    fn settings_use_camel_case() {
        let node: Node = serde_json::from_value(json!({
            "id": "fetch",
            "type": "http.request",
            "credentialRefs": ["github"],
            "settings": {
                "continueOnFail": true,
                "timeoutMs": 500,
                "retry": {"maxRetries": 2}
            }
        }))
        .expect("deserialize");
        assert_eq!(node.credential_refs, vec!["github".to_string()]);
        assert_eq!(node.settings.continue_on_fail, Some(true));
        assert_eq!(node.settings.timeout_ms, Some(500));
        assert_eq!(node.settings.retry.map(|r| r.max_retries), Some(2));
    }

    #[test]
    fn serialization_omits_empty_fields() {
        let node = Node::new("noop", "noop");
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(
            json,
            json!({"id": "noop", "type": "noop", "parameters": {}, "disabled": false})
        );
    }
}
