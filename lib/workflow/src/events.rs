//! Execution lifecycle events.
//!
//! Every state change a client may want to render is published as a
//! [`LifecycleEvent`]. Only an execution's own coordinator emits its events,
//! so per-execution order is causal and `seq` counts up from 0 without gaps.
//! Delivery is fire-and-forget: slow subscribers lag and lose events, they
//! never hold up the engine.

use crate::execution::{ErrorRecord, ExecutionFailure};
use crate::node::NodeId;
use crate::runtime::OutputByPort;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use weaver_core::{ExecutionId, WorkflowId};

/// Item counts of a node's outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSummary {
    pub ports: BTreeMap<String, usize>,
    pub total_items: usize,
}

impl From<&OutputByPort> for OutputSummary {
    fn from(outputs: &OutputByPort) -> Self {
        let ports: BTreeMap<String, usize> = outputs.counts().into_iter().collect();
        let total_items = ports.values().sum();
        Self { ports, total_items }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventKind {
    ExecutionStart {
        workflow_id: WorkflowId,
    },
    NodeStart {
        node_id: NodeId,
        attempt: u32,
    },
    NodeComplete {
        node_id: NodeId,
        output_summary: OutputSummary,
    },
    NodeError {
        node_id: NodeId,
        error: ErrorRecord,
        will_retry: bool,
    },
    NodeSkipped {
        node_id: NodeId,
        reason: String,
    },
    ExecutionComplete,
    ExecutionFailed {
        failure: ExecutionFailure,
    },
    ExecutionCancelled,
}

impl EventKind {
    /// Returns true for the three terminal events.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionComplete | Self::ExecutionFailed { .. } | Self::ExecutionCancelled
        )
    }

    /// The node this event is about, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::NodeStart { node_id, .. }
            | Self::NodeComplete { node_id, .. }
            | Self::NodeError { node_id, .. }
            | Self::NodeSkipped { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// A lifecycle event of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub execution_id: ExecutionId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Fan-out of lifecycle events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBroadcaster {
    /// Creates a broadcaster that buffers up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }

    /// Current number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Stamps and publishes the events of one execution.
#[derive(Debug)]
pub(crate) struct EventEmitter {
    execution_id: ExecutionId,
    next_seq: u64,
    broadcaster: EventBroadcaster,
}

impl EventEmitter {
    pub(crate) fn new(execution_id: ExecutionId, broadcaster: EventBroadcaster) -> Self {
        Self {
            execution_id,
            next_seq: 0,
            broadcaster,
        }
    }

    pub(crate) fn emit(&mut self, kind: EventKind) -> LifecycleEvent {
        let event = LifecycleEvent {
            execution_id: self.execution_id,
            seq: self.next_seq,
            timestamp: Utc::now(),
            kind,
        };
        self.next_seq += 1;
        self.broadcaster.publish(event.clone());
        event
    }
}
