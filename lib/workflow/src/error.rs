//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: structural problems found while compiling or validating a graph
//! - `NodeError`: failures of a single node attempt, classified by [`ErrorKind`]
//! - `RegistrationError`: node types the registry refuses
//! - `SinkError`: persistence collaborator failures
//! - `EngineError`: Execution API failures (wraps lower errors via context)

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use weaver_core::{ExecutionId, WorkflowId};
use weaver_integration::{
    CredentialError, HttpError, NetworkErrorKind, SecurityErrorKind, SecurityViolation,
};

/// Errors from graph compilation and validation.
///
/// These errors contain only information available at the graph layer.
/// Workflow-level context is added by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share an id.
    DuplicateNode { node_id: NodeId },
    /// A connection references a node that is not in the graph.
    DanglingConnection {
        connection: usize,
        node_id: NodeId,
    },
    /// The graph contains a cycle. Nodes are listed in traversal order.
    CyclicDependency { cycle: Vec<NodeId> },
    /// No registered node type has this name.
    UnknownNodeType { node_id: NodeId, node_type: String },
    /// A connection uses a port the node type does not declare.
    UnknownPort {
        node_id: NodeId,
        port: String,
        direction: PortDirection,
    },
    /// The node type requires a credential the node does not reference.
    MissingCredential { node_id: NodeId, credential: String },
}

/// Which side of a node a port is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::DanglingConnection {
                connection,
                node_id,
            } => {
                write!(f, "connection #{connection} references unknown node {node_id}")
            }
            Self::CyclicDependency { cycle } => {
                let path: Vec<&str> = cycle.iter().map(NodeId::as_str).collect();
                write!(f, "graph contains a cycle: {}", path.join(" -> "))
            }
            Self::UnknownNodeType { node_id, node_type } => {
                write!(f, "node {node_id} has unknown type '{node_type}'")
            }
            Self::UnknownPort {
                node_id,
                port,
                direction,
            } => write!(f, "{direction} port '{port}' not declared on node {node_id}"),
            Self::MissingCredential {
                node_id,
                credential,
            } => write!(f, "node {node_id} requires credential '{credential}'"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Classification of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "subtype", rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    Security(SecurityErrorKind),
    Network(NetworkErrorKind),
    Execution,
    Timeout,
    Cancellation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => f.write_str("validation"),
            Self::Security(sub) => write!(f, "security.{sub}"),
            Self::Network(sub) => write!(f, "network.{sub}"),
            Self::Execution => f.write_str("execution"),
            Self::Timeout => f.write_str("timeout"),
            Self::Cancellation => f.write_str("cancellation"),
        }
    }
}

/// A failed node attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Input or parameters were unusable, or outputs broke the node contract.
    Validation { message: String },
    /// The enforcer rejected an outbound request.
    Security(SecurityViolation),
    /// A transport failure on an outbound request.
    Network {
        kind: NetworkErrorKind,
        message: String,
    },
    /// An upstream service answered with a non-success status.
    HttpStatus { status: u16, message: String },
    /// Any other failure raised by node logic.
    Execution { message: String },
    /// The attempt exceeded its wall-clock budget.
    Timeout { limit_ms: u64 },
    /// The execution was cancelled while the node ran.
    Cancelled { reason: String },
}

impl NodeError {
    /// Shorthand for a validation failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for an execution failure.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Security(violation) => ErrorKind::Security(violation.kind),
            Self::Network { kind, .. } => ErrorKind::Network(*kind),
            Self::HttpStatus { .. } | Self::Execution { .. } => ErrorKind::Execution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { message } => write!(f, "validation failed: {message}"),
            Self::Security(violation) => write!(f, "blocked by security policy: {violation}"),
            Self::Network { kind, message } => write!(f, "network error ({kind}): {message}"),
            Self::HttpStatus { status, message } => {
                write!(f, "upstream returned status {status}: {message}")
            }
            Self::Execution { message } => f.write_str(message),
            Self::Timeout { limit_ms } => write!(f, "node timed out after {limit_ms}ms"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<HttpError> for NodeError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Security(violation) => Self::Security(violation),
            HttpError::Network { kind, message } => Self::Network { kind, message },
            HttpError::InvalidRequest { reason } => Self::Validation { message: reason },
            HttpError::Cancelled => Self::Cancelled {
                reason: "request aborted".to_string(),
            },
        }
    }
}

impl From<CredentialError> for NodeError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotPermitted { .. } => Self::Validation {
                message: err.to_string(),
            },
            other => Self::Execution {
                message: other.to_string(),
            },
        }
    }
}

/// Errors from node type registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The type name is empty.
    EmptyTypeName,
    /// The type declares no output ports.
    NoOutputPorts { node_type: String },
    /// A port has an empty name.
    EmptyPortName {
        node_type: String,
        direction: PortDirection,
    },
    /// A port name is declared twice on the same side.
    DuplicatePort {
        node_type: String,
        port: String,
        direction: PortDirection,
    },
    /// The type name is already registered.
    DuplicateType { node_type: String },
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTypeName => write!(f, "node type name is empty"),
            Self::NoOutputPorts { node_type } => {
                write!(f, "node type '{node_type}' declares no output ports")
            }
            Self::EmptyPortName {
                node_type,
                direction,
            } => write!(f, "node type '{node_type}' has an empty {direction} port name"),
            Self::DuplicatePort {
                node_type,
                port,
                direction,
            } => write!(
                f,
                "node type '{node_type}' declares {direction} port '{port}' twice"
            ),
            Self::DuplicateType { node_type } => {
                write!(f, "node type '{node_type}' is already registered")
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Errors from the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The record could not be encoded.
    Serialization { reason: String },
    /// The backend rejected or dropped the record.
    Publish { subject: String, reason: String },
    /// The backend is not reachable.
    Unavailable { reason: String },
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization { reason } => write!(f, "failed to encode record: {reason}"),
            Self::Publish { subject, reason } => {
                write!(f, "failed to publish to {subject}: {reason}")
            }
            Self::Unavailable { reason } => write!(f, "sink unavailable: {reason}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Errors from the Execution API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The workflow source has no such workflow.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The workflow source failed.
    WorkflowSource {
        workflow_id: WorkflowId,
        reason: String,
    },
    /// The workflow graph failed validation. No execution was created.
    InvalidWorkflow {
        workflow_id: WorkflowId,
        error: GraphError,
    },
    /// No execution with this id is known.
    ExecutionNotFound { execution_id: ExecutionId },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::WorkflowSource {
                workflow_id,
                reason,
            } => write!(f, "failed to load workflow {workflow_id}: {reason}"),
            Self::InvalidWorkflow { workflow_id, error } => {
                write!(f, "workflow {workflow_id} is invalid: {error}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
        }
    }
}

impl std::error::Error for EngineError {}
