//! The node runtime contract.
//!
//! Node types implement [`NodeLogic`]. The scheduler calls `execute` once per
//! attempt with the node's merged input items and a [`NodeExecutionContext`]
//! that carries everything the node may touch: its identity, templated
//! parameters, its own credentials, the execution's HTTP helper and the
//! cancellation token.

use crate::descriptor::NodeDescriptor;
use crate::error::NodeError;
use crate::node::{Node, NodeId};
use async_trait::async_trait;
use minijinja::Environment;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weaver_core::{ExecutionId, WorkflowId};
use weaver_integration::{CredentialData, CredentialError, CredentialStore, HttpClient};

/// One unit of data flowing between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub data: JsonValue,
}

impl Item {
    /// Wraps a JSON value.
    #[must_use]
    pub fn new(data: JsonValue) -> Self {
        Self { data }
    }

    /// An item with an empty object.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(JsonValue::Object(serde_json::Map::new()))
    }
}

impl From<JsonValue> for Item {
    fn from(data: JsonValue) -> Self {
        Self::new(data)
    }
}

/// A node's result: items per output port, in insertion order.
///
/// A port that is absent or empty is "not taken"; its connections resolve
/// without delivering anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputByPort {
    ports: Vec<(String, Vec<Item>)>,
}

impl OutputByPort {
    /// Creates an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An output with items on a single port.
    #[must_use]
    pub fn single(port: impl Into<String>, items: Vec<Item>) -> Self {
        let mut out = Self::new();
        out.extend(port, items);
        out
    }

    /// An output with items on `main`.
    #[must_use]
    pub fn main(items: Vec<Item>) -> Self {
        Self::single(crate::connection::MAIN_PORT, items)
    }

    /// Appends items to a port.
    pub fn extend(&mut self, port: impl Into<String>, items: Vec<Item>) {
        let port = port.into();
        match self.ports.iter_mut().find(|(name, _)| *name == port) {
            Some((_, existing)) => existing.extend(items),
            None => self.ports.push((port, items)),
        }
    }

    /// Appends one item to a port.
    pub fn push(&mut self, port: impl Into<String>, item: Item) {
        self.extend(port, vec![item]);
    }

    /// Items on a port. Empty when the port was not taken.
    #[must_use]
    pub fn get(&self, port: &str) -> &[Item] {
        self.ports
            .iter()
            .find(|(name, _)| name == port)
            .map(|(_, items)| items.as_slice())
            .unwrap_or(&[])
    }

    /// Port names in insertion order.
    pub fn ports(&self) -> impl Iterator<Item = &str> {
        self.ports.iter().map(|(name, _)| name.as_str())
    }

    /// Ports and their items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Item])> {
        self.ports
            .iter()
            .map(|(name, items)| (name.as_str(), items.as_slice()))
    }

    /// Item count per port.
    #[must_use]
    pub fn counts(&self) -> Vec<(String, usize)> {
        self.ports
            .iter()
            .map(|(name, items)| (name.clone(), items.len()))
            .collect()
    }

    /// Returns true when no port carries items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.iter().all(|(_, items)| items.is_empty())
    }
}

impl Serialize for OutputByPort {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.ports.len()))?;
        for (port, items) in &self.ports {
            map.serialize_entry(port, items)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OutputByPort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PortsVisitor;

        impl<'de> Visitor<'de> for PortsVisitor {
            type Value = OutputByPort;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of port names to item lists")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Self::Value, M::Error> {
                let mut out = OutputByPort::new();
                while let Some((port, items)) = map.next_entry::<String, Vec<Item>>()? {
                    out.extend(port, items);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(PortsVisitor)
    }
}

/// Behaviour of a node type.
#[async_trait]
pub trait NodeLogic: Send + Sync {
    /// The static contract of this node type.
    fn descriptor(&self) -> NodeDescriptor;

    /// Runs one attempt.
    ///
    /// Implementations should observe `ctx.cancellation()` at await points
    /// that may block for long.
    async fn execute(
        &self,
        items: Vec<Item>,
        ctx: &NodeExecutionContext,
    ) -> Result<OutputByPort, NodeError>;
}

/// Renders `{{ … }}` templates in node parameters.
///
/// Templates see `json` (the current item's data) and `itemIndex`. A string
/// that is exactly one `{{ expr }}` evaluates to the expression's value, so
/// numbers, booleans and objects keep their type.
pub struct ParameterResolver {
    env: Environment<'static>,
}

impl Default for ParameterResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ParameterResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterResolver").finish_non_exhaustive()
    }
}

impl ParameterResolver {
    /// Creates a resolver with the default filter set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// Resolves every template inside `value` against one item.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a template fails to parse or evaluate.
    pub fn resolve(
        &self,
        value: &JsonValue,
        data: &JsonValue,
        item_index: usize,
    ) -> Result<JsonValue, NodeError> {
        let scope = minijinja::context! { json => data, itemIndex => item_index };
        self.resolve_in(value, &scope)
    }

    fn resolve_in(
        &self,
        value: &JsonValue,
        scope: &minijinja::Value,
    ) -> Result<JsonValue, NodeError> {
        match value {
            JsonValue::String(s) if s.contains("{{") => self.render(s, scope),
            JsonValue::Array(values) => values
                .iter()
                .map(|v| self.resolve_in(v, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            JsonValue::Object(fields) => fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_in(v, scope)?)))
                .collect::<Result<serde_json::Map<_, _>, NodeError>>()
                .map(JsonValue::Object),
            other => Ok(other.clone()),
        }
    }

    fn render(&self, template: &str, scope: &minijinja::Value) -> Result<JsonValue, NodeError> {
        let invalid = |e: minijinja::Error| NodeError::validation(format!("template error: {e}"));

        if let Some(expr) = whole_expression(template) {
            let value = self
                .env
                .compile_expression(expr)
                .map_err(invalid)?
                .eval(scope)
                .map_err(invalid)?;
            return serde_json::to_value(&value)
                .map_err(|e| NodeError::validation(format!("template value: {e}")));
        }
        self.env
            .render_str(template, scope)
            .map(JsonValue::String)
            .map_err(invalid)
    }
}

/// Returns the inner expression when `template` is a single `{{ expr }}`.
fn whole_expression(template: &str) -> Option<&str> {
    let inner = template
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

static NULL: JsonValue = JsonValue::Null;

/// Everything a node attempt may touch.
pub struct NodeExecutionContext {
    execution_id: ExecutionId,
    workflow_id: WorkflowId,
    node: Node,
    attempt: u32,
    items: Arc<[Item]>,
    resolver: Arc<ParameterResolver>,
    credentials: Arc<dyn CredentialStore>,
    http: HttpClient,
}

impl fmt::Debug for NodeExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("node_id", &self.node.id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Shared pieces a context is assembled from.
#[derive(Clone)]
pub struct RuntimeServices {
    pub resolver: Arc<ParameterResolver>,
    pub credentials: Arc<dyn CredentialStore>,
    pub http: HttpClient,
}

impl NodeExecutionContext {
    /// Creates a context for one attempt of `node`.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        node: Node,
        attempt: u32,
        items: Arc<[Item]>,
        services: RuntimeServices,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            node,
            attempt,
            items,
            resolver: services.resolver,
            credentials: services.credentials,
            http: services.http,
        }
    }

    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node.id
    }

    /// The node being executed, with its raw parameters.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resolves a parameter for the item at `item_index`.
    ///
    /// Missing parameters resolve to `null`. An index past the input (a
    /// trigger has none) resolves templates against `null` data.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a template is malformed.
    pub fn parameter(&self, name: &str, item_index: usize) -> Result<JsonValue, NodeError> {
        let Some(raw) = self.node.parameter(name) else {
            return Ok(JsonValue::Null);
        };
        let data = self
            .items
            .get(item_index)
            .map_or(&NULL, |item| &item.data);
        self.resolver.resolve(raw, data, item_index)
    }

    /// Like [`Self::parameter`] but requires a string.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the parameter is missing or not a string.
    pub fn string_parameter(&self, name: &str, item_index: usize) -> Result<String, NodeError> {
        match self.parameter(name, item_index)? {
            JsonValue::String(s) => Ok(s),
            JsonValue::Null => Err(NodeError::validation(format!(
                "parameter '{name}' is required"
            ))),
            other => Err(NodeError::validation(format!(
                "parameter '{name}' must be a string, got {other}"
            ))),
        }
    }

    /// Decrypts one of this node's credentials.
    ///
    /// # Errors
    ///
    /// Fails when the reference is not in the node's `credentialRefs` or the
    /// store cannot resolve it.
    pub async fn credential(&self, reference: &str) -> Result<CredentialData, NodeError> {
        if !self.node.credential_refs.iter().any(|r| r == reference) {
            return Err(CredentialError::NotPermitted {
                reference: reference.to_string(),
            }
            .into());
        }
        Ok(self.credentials.decrypt(reference).await?)
    }

    /// The per-execution HTTP helper.
    #[must_use]
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Cooperative cancellation for this execution.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        self.http.cancellation()
    }

    /// Whether the execution has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }
}
