//! Workflow execution for weaver.
//!
//! A workflow is authored as a [`WorkflowGraph`] of typed nodes joined by
//! port-to-port connections. On submit the [`ExecutionEngine`] compiles the
//! graph into an [`ExecutionPlan`], checks it against the [`NodeProvider`]
//! and starts a coordinator task that dispatches nodes as their inputs
//! arrive. Progress is observable as [`LifecycleEvent`]s and as the
//! [`Execution`] record, which is also handed to an [`ExecutionSink`].

pub mod budget;
pub mod compiler;
pub mod config;
pub mod connection;
pub mod definition;
pub mod descriptor;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod execution;
pub mod graph;
pub mod nats;
pub mod node;
pub mod registry;
pub mod retry;
mod run_state;
pub mod runtime;
mod scheduler;
pub mod sink;

pub use budget::{BudgetPermit, ConcurrencyBudget, ConcurrencyConfig};
pub use compiler::{ExecutionPlan, PlanCache, PlannedEdge, compile};
pub use config::{DisabledNodePolicy, EngineConfig};
pub use connection::{Connection, MAIN_PORT};
pub use definition::{WorkflowDefinition, WorkflowMetadata};
pub use descriptor::{CredentialSlot, NodeDescriptor, PortSpec};
pub use engine::{ExecutionEngine, ExecutionEngineBuilder, InMemoryWorkflowSource, WorkflowSource};
pub use error::{
    EngineError, ErrorKind, GraphError, NodeError, PortDirection, RegistrationError, SinkError,
};
pub use events::{EventBroadcaster, EventKind, LifecycleEvent, OutputSummary};
pub use execution::{
    ErrorRecord, Execution, ExecutionFailure, ExecutionStatus, NodeExecutionState, NodeSnapshot,
    NodeStatus,
};
pub use graph::WorkflowGraph;
pub use nats::{NatsConfig, NatsExecutionSink, forward_events};
pub use node::{Node, NodeId, NodeSettings};
pub use registry::{NodeProvider, NodeRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use runtime::{
    Item, NodeExecutionContext, NodeLogic, OutputByPort, ParameterResolver, RuntimeServices,
};
pub use sink::{ExecutionSink, InMemorySink, NoopSink, SinkWriter};
