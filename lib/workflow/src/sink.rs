//! Persistence sink.
//!
//! The engine never waits on storage. Coordinators hand records to a
//! [`SinkWriter`], whose background task drains them in order into an
//! [`ExecutionSink`], retrying each record a bounded number of times.
//! Delivery is at-least-once; a record that still fails is logged and
//! dropped, and the execution carries on.

use crate::error::SinkError;
use crate::execution::{Execution, NodeSnapshot};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Storage for execution records.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    /// Persists one node's state.
    async fn record_node(&self, snapshot: &NodeSnapshot) -> Result<(), SinkError>;

    /// Persists the execution as a whole.
    async fn record_execution(&self, execution: &Execution) -> Result<(), SinkError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl ExecutionSink for NoopSink {
    async fn record_node(&self, _snapshot: &NodeSnapshot) -> Result<(), SinkError> {
        Ok(())
    }

    async fn record_execution(&self, _execution: &Execution) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps records in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemorySink {
    nodes: Mutex<Vec<NodeSnapshot>>,
    executions: Mutex<Vec<Execution>>,
}

impl InMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Node records in arrival order.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.nodes.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Execution records in arrival order.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionSink for InMemorySink {
    async fn record_node(&self, snapshot: &NodeSnapshot) -> Result<(), SinkError> {
        self.nodes
            .lock()
            .map_err(|e| SinkError::Unavailable {
                reason: e.to_string(),
            })?
            .push(snapshot.clone());
        Ok(())
    }

    async fn record_execution(&self, execution: &Execution) -> Result<(), SinkError> {
        self.executions
            .lock()
            .map_err(|e| SinkError::Unavailable {
                reason: e.to_string(),
            })?
            .push(execution.clone());
        Ok(())
    }
}

#[derive(Debug)]
enum SinkRecord {
    Node(NodeSnapshot),
    Execution(Box<Execution>),
}

/// Queue in front of an [`ExecutionSink`].
#[derive(Debug, Clone)]
pub struct SinkWriter {
    tx: mpsc::UnboundedSender<SinkRecord>,
}

impl SinkWriter {
    /// Starts the background task. It ends once every writer clone is dropped
    /// and the queue is drained.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn ExecutionSink>, retry_attempts: u32) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkRecord>();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                write_with_retry(sink.as_ref(), &record, retry_attempts).await;
            }
            debug!("sink writer drained");
        });
        (Self { tx }, handle)
    }

    /// Queues a node record.
    pub fn record_node(&self, snapshot: NodeSnapshot) {
        if self.tx.send(SinkRecord::Node(snapshot)).is_err() {
            warn!("sink writer stopped; node record dropped");
        }
    }

    /// Queues an execution record.
    pub fn record_execution(&self, execution: Execution) {
        if self
            .tx
            .send(SinkRecord::Execution(Box::new(execution)))
            .is_err()
        {
            warn!("sink writer stopped; execution record dropped");
        }
    }
}

async fn write_with_retry(sink: &dyn ExecutionSink, record: &SinkRecord, retries: u32) {
    let mut attempt = 0;
    loop {
        let result = match record {
            SinkRecord::Node(snapshot) => sink.record_node(snapshot).await,
            SinkRecord::Execution(execution) => sink.record_execution(execution).await,
        };
        match result {
            Ok(()) => return,
            Err(e) if attempt < retries => {
                attempt += 1;
                debug!(error = %e, attempt, "sink write failed, retrying");
            }
            Err(e) => {
                let (execution_id, node_id) = match record {
                    SinkRecord::Node(s) => (s.execution_id, Some(s.node_id.to_string())),
                    SinkRecord::Execution(exec) => (exec.id, None),
                };
                warn!(
                    %execution_id,
                    node_id = node_id.as_deref().unwrap_or("-"),
                    error = %e,
                    attempts = attempt + 1,
                    "dropping execution record after repeated sink failures"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weaver_core::WorkflowId;

    /// Fails the first `failures` writes.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        inner: InMemorySink,
    }

    #[async_trait]
    impl ExecutionSink for Flaky {
        async fn record_node(&self, snapshot: &NodeSnapshot) -> Result<(), SinkError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(SinkError::Unavailable {
                    reason: "down".to_string(),
                });
            }
            self.inner.record_node(snapshot).await
        }

        async fn record_execution(&self, execution: &Execution) -> Result<(), SinkError> {
            self.inner.record_execution(execution).await
        }
    }

    fn execution() -> Execution {
        Execution::new(
            WorkflowId::new(),
            "plan",
            [NodeId::from("a")],
            serde_json::Value::Null,
            None,
        )
    }

    fn snapshot(execution: &Execution) -> NodeSnapshot {
        NodeSnapshot {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            node_id: NodeId::from("a"),
            state: Default::default(),
        }
    }

    #[tokio::test]
    async fn records_arrive_in_order() {
        let sink = Arc::new(InMemorySink::new());
        let (writer, handle) = SinkWriter::spawn(sink.clone(), 0);
        let exec = execution();
        writer.record_node(snapshot(&exec));
        writer.record_execution(exec.clone());
        drop(writer);
        handle.await.expect("writer task");

        assert_eq!(sink.nodes().len(), 1);
        assert_eq!(sink.executions(), vec![exec]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: InMemorySink::new(),
        });
        let (writer, handle) = SinkWriter::spawn(sink.clone(), 2);
        writer.record_node(snapshot(&execution()));
        drop(writer);
        handle.await.expect("writer task");

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.inner.nodes().len(), 1);
    }

    #[tokio::test]
    async fn persistent_failures_are_dropped() {
        let sink = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            inner: InMemorySink::new(),
        });
        let (writer, handle) = SinkWriter::spawn(sink.clone(), 1);
        let exec = execution();
        writer.record_node(snapshot(&exec));
        writer.record_execution(exec);
        drop(writer);
        handle.await.expect("writer task");

        // Two attempts for the node record, then the queue moves on.
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert!(sink.inner.nodes().is_empty());
        assert_eq!(sink.inner.executions().len(), 1);
    }
}
