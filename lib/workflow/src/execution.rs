//! Execution state.
//!
//! An [`Execution`] is created on submit and mutated only by its coordinator.
//! It tracks:
//! - Overall execution status
//! - Per-node execution state, inputs and outputs
//! - The first failure, once there is one

use crate::error::{ErrorKind, NodeError};
use crate::node::NodeId;
use crate::runtime::{Item, OutputByPort};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use weaver_core::{ExecutionId, UserId, WorkflowId};

/// The overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    /// Created, coordinator not started yet.
    Pending,
    Running,
    /// Cancel requested; running nodes are draining.
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The status of a single node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    /// Waiting for required inputs to resolve.
    Waiting,
    /// Inputs resolved, waiting for a worker slot.
    Ready,
    Running,
    Success,
    Error,
    /// Not run: branch not taken, disabled, or the execution halted first.
    Skipped,
}

impl NodeStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Skipped)
    }
}

/// A classified failure as recorded on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&NodeError> for ErrorRecord {
    fn from(error: &NodeError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Why an execution failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    /// The node whose terminal error failed the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionFailure {
    /// A failure caused by a node.
    #[must_use]
    pub fn from_node(node_id: NodeId, record: &ErrorRecord) -> Self {
        Self {
            node_id: Some(node_id),
            kind: record.kind,
            message: record.message.clone(),
        }
    }
}

/// Per-node state within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionState {
    pub status: NodeStatus,
    /// Merged input items, in connection declaration order.
    #[serde(default)]
    pub input_buffer: Vec<Item>,
    #[serde(default)]
    pub output_by_port: OutputByPort,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Dispatch count, retries included.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl Default for NodeExecutionState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Waiting,
            input_buffer: Vec::new(),
            output_by_port: OutputByPort::new(),
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            skip_reason: None,
        }
    }
}

impl NodeExecutionState {
    /// Marks the node ready with its merged input.
    pub fn mark_ready(&mut self, input: Vec<Item>) {
        self.status = NodeStatus::Ready;
        self.input_buffer = input;
    }

    /// Starts an attempt.
    pub fn start_attempt(&mut self) {
        self.status = NodeStatus::Running;
        self.attempts += 1;
        self.started_at.get_or_insert_with(Utc::now);
    }

    /// Records a successful attempt.
    pub fn succeed(&mut self, outputs: OutputByPort) {
        self.status = NodeStatus::Success;
        self.output_by_port = outputs;
        self.finished_at = Some(Utc::now());
    }

    /// Records a terminal failure.
    pub fn fail(&mut self, error: ErrorRecord) {
        self.status = NodeStatus::Error;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Marks the node skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = NodeStatus::Skipped;
        self.skip_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }
}

/// A single run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    /// Content hash of the plan this execution runs.
    pub plan_ref: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub trigger_data: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
    pub nodes: BTreeMap<NodeId, NodeExecutionState>,
}

impl Execution {
    /// Creates a pending execution with every node waiting.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        plan_ref: impl Into<String>,
        node_ids: impl IntoIterator<Item = NodeId>,
        trigger_data: JsonValue,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            plan_ref: plan_ref.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            trigger_data,
            user_id,
            failure: None,
            nodes: node_ids
                .into_iter()
                .map(|id| (id, NodeExecutionState::default()))
                .collect(),
        }
    }

    /// Returns true once the execution has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// State of one node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeExecutionState> {
        self.nodes.get(id)
    }

    /// Moves to a terminal status.
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Returns the duration of the execution so far.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// One node's state, as handed to the persistence sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub state: NodeExecutionState,
}
