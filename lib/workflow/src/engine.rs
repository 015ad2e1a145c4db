//! The Execution API.
//!
//! [`ExecutionEngine`] validates and compiles a workflow on submit, starts a
//! coordinator task per execution and keeps a live view of every execution it
//! started until [`ExecutionEngine::prune_finished`] drops it. Collaborators
//! are injected once through [`ExecutionEngineBuilder`].

use crate::budget::ConcurrencyBudget;
use crate::compiler::PlanCache;
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use crate::events::{EventBroadcaster, LifecycleEvent};
use crate::execution::{Execution, ExecutionStatus};
use crate::registry::{NodeProvider, NodeRegistry};
use crate::runtime::{NodeLogic, ParameterResolver, RuntimeServices};
use crate::scheduler::{Coordinator, CoordinatorParts, DispatchGate};
use crate::sink::{ExecutionSink, NoopSink, SinkWriter};
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use weaver_core::{ExecutionId, UserId, WorkflowId};
use weaver_integration::{CredentialStore, Enforcer, HttpGateway, InMemoryCredentialStore};

/// Where workflow definitions come from.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    /// Loads the current definition of a workflow.
    ///
    /// Implementations report a missing workflow as
    /// [`EngineError::WorkflowNotFound`] and backend failures as
    /// [`EngineError::WorkflowSource`].
    async fn load(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, EngineError>;
}

/// Definitions held in memory.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowSource {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl InMemoryWorkflowSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a definition, superseding any previous revision. Returns its id.
    pub fn insert(&self, mut definition: WorkflowDefinition) -> WorkflowId {
        let id = definition.id;
        let mut workflows = self.workflows.write().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = workflows.get(&id) {
            definition.supersede(previous);
        }
        workflows.insert(id, definition);
        id
    }

    pub fn remove(&self, workflow_id: WorkflowId) -> Option<WorkflowDefinition> {
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&workflow_id)
    }
}

#[async_trait]
impl WorkflowSource for InMemoryWorkflowSource {
    async fn load(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, EngineError> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&workflow_id)
            .cloned()
            .ok_or(EngineError::WorkflowNotFound { workflow_id })
    }
}

#[derive(Clone)]
struct ExecutionHandle {
    state: Arc<watch::Sender<Execution>>,
    cancel: CancellationToken,
    gate: Arc<DispatchGate>,
}

struct EngineInner {
    workflows: Arc<dyn WorkflowSource>,
    provider: Arc<dyn NodeProvider>,
    credentials: Arc<dyn CredentialStore>,
    http: HttpGateway,
    sink: SinkWriter,
    broadcaster: EventBroadcaster,
    config: Arc<EngineConfig>,
    budget: ConcurrencyBudget,
    plans: PlanCache,
    resolver: Arc<ParameterResolver>,
    executions: RwLock<HashMap<ExecutionId, ExecutionHandle>>,
}

/// Runs workflows.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("executions", &self.execution_ids().len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    #[must_use]
    pub fn builder() -> ExecutionEngineBuilder {
        ExecutionEngineBuilder::default()
    }

    /// Starts an execution of the workflow's current definition.
    ///
    /// # Errors
    ///
    /// Fails when the workflow cannot be loaded or is invalid. No execution
    /// is created in that case.
    pub async fn submit(
        &self,
        workflow_id: WorkflowId,
        trigger_data: JsonValue,
    ) -> Result<ExecutionId, Report<EngineError>> {
        self.start(workflow_id, trigger_data, None).await
    }

    /// Like [`submit`](Self::submit), counted against `user_id`'s budget.
    ///
    /// # Errors
    ///
    /// Same as `submit`.
    pub async fn submit_as(
        &self,
        user_id: UserId,
        workflow_id: WorkflowId,
        trigger_data: JsonValue,
    ) -> Result<ExecutionId, Report<EngineError>> {
        self.start(workflow_id, trigger_data, Some(user_id)).await
    }

    #[instrument(skip(self, trigger_data), fields(workflow_id = %workflow_id))]
    async fn start(
        &self,
        workflow_id: WorkflowId,
        trigger_data: JsonValue,
        user_id: Option<UserId>,
    ) -> Result<ExecutionId, Report<EngineError>> {
        let inner = &self.inner;
        let definition = inner.workflows.load(workflow_id).await?;
        let plan = inner
            .plans
            .get_or_compile(workflow_id, &definition.graph)
            .map_err(|error| EngineError::InvalidWorkflow { workflow_id, error })?;
        plan.check_types(inner.provider.as_ref())
            .map_err(|error| EngineError::InvalidWorkflow { workflow_id, error })?;

        let logics: Vec<Option<Arc<dyn NodeLogic>>> = plan
            .nodes()
            .iter()
            .map(|node| {
                if node.disabled {
                    None
                } else {
                    inner.provider.get(&node.node_type)
                }
            })
            .collect();

        let execution = Execution::new(
            workflow_id,
            plan.plan_ref(),
            plan.nodes().iter().map(|node| node.id.clone()),
            trigger_data,
            user_id,
        );
        let execution_id = execution.id;
        inner.sink.record_execution(execution.clone());

        let state = Arc::new(watch::Sender::new(execution));
        let cancel = CancellationToken::new();
        let gate = Arc::new(DispatchGate::default());
        inner
            .executions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                execution_id,
                ExecutionHandle {
                    state: Arc::clone(&state),
                    cancel: cancel.clone(),
                    gate: Arc::clone(&gate),
                },
            );

        let services = RuntimeServices {
            resolver: Arc::clone(&inner.resolver),
            credentials: Arc::clone(&inner.credentials),
            http: inner.http.scoped(cancel.clone()),
        };
        let coordinator = Coordinator::new(CoordinatorParts {
            plan,
            logics,
            state,
            cancel,
            gate,
            services,
            budget: inner.budget.clone(),
            config: Arc::clone(&inner.config),
            broadcaster: inner.broadcaster.clone(),
            sink: inner.sink.clone(),
        });
        tokio::spawn(coordinator.run());

        info!(%execution_id, user_id = ?user_id, "execution submitted");
        Ok(execution_id)
    }

    /// Current snapshot of an execution.
    ///
    /// # Errors
    ///
    /// Fails for unknown or pruned ids.
    pub fn get_status(&self, execution_id: ExecutionId) -> Result<Execution, Report<EngineError>> {
        let handle = self.handle(execution_id)?;
        let execution = handle.state.borrow().clone();
        Ok(execution)
    }

    /// Requests cancellation.
    ///
    /// Once this returns no further node is dispatched. Running nodes see
    /// the cancellation token and are aborted after the grace period.
    /// Cancelling a finished execution, or cancelling twice, does nothing.
    ///
    /// # Errors
    ///
    /// Fails for unknown or pruned ids.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<(), Report<EngineError>> {
        let handle = self.handle(execution_id)?;
        let mut cancelled = handle.gate.lock();
        if *cancelled || handle.state.borrow().is_terminal() {
            return Ok(());
        }
        *cancelled = true;
        handle.state.send_modify(|execution| {
            if !execution.is_terminal() {
                execution.status = ExecutionStatus::Cancelling;
            }
        });
        handle.cancel.cancel();
        info!("cancellation requested");
        Ok(())
    }

    /// Resolves once the execution is terminal.
    ///
    /// # Errors
    ///
    /// Fails for unknown or pruned ids.
    pub async fn wait(&self, execution_id: ExecutionId) -> Result<Execution, Report<EngineError>> {
        let mut updates = self.handle(execution_id)?.state.subscribe();
        let execution = updates
            .wait_for(Execution::is_terminal)
            .await
            .map_err(|_| EngineError::ExecutionNotFound { execution_id })?
            .clone();
        Ok(execution)
    }

    /// Lifecycle events of every execution, from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.broadcaster.subscribe()
    }

    /// Forgets finished executions. Returns how many were dropped.
    pub fn prune_finished(&self) -> usize {
        let mut executions = self
            .inner
            .executions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = executions.len();
        executions.retain(|_, handle| !handle.state.borrow().is_terminal());
        before - executions.len()
    }

    /// Ids of the executions currently tracked.
    #[must_use]
    pub fn execution_ids(&self) -> Vec<ExecutionId> {
        self.inner
            .executions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The shared dispatch budget.
    #[must_use]
    pub fn budget(&self) -> &ConcurrencyBudget {
        &self.inner.budget
    }

    /// Drops the cached plan of a workflow, e.g. after it was edited.
    pub fn invalidate_plan(&self, workflow_id: WorkflowId) {
        self.inner.plans.invalidate(workflow_id);
    }

    fn handle(&self, execution_id: ExecutionId) -> Result<ExecutionHandle, EngineError> {
        self.inner
            .executions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&execution_id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound { execution_id })
    }
}

/// Assembles an [`ExecutionEngine`].
///
/// Every collaborator has an in-process default: an empty workflow source and
/// registry, an empty credential store, a gateway built from the configured
/// security policy and limits, and a sink that discards records.
#[derive(Default)]
pub struct ExecutionEngineBuilder {
    workflows: Option<Arc<dyn WorkflowSource>>,
    provider: Option<Arc<dyn NodeProvider>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    http: Option<HttpGateway>,
    sink: Option<Arc<dyn ExecutionSink>>,
    broadcaster: Option<EventBroadcaster>,
    config: EngineConfig,
}

impl ExecutionEngineBuilder {
    #[must_use]
    pub fn workflow_source(mut self, source: Arc<dyn WorkflowSource>) -> Self {
        self.workflows = Some(source);
        self
    }

    #[must_use]
    pub fn node_provider(mut self, provider: Arc<dyn NodeProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    #[must_use]
    pub fn http_gateway(mut self, gateway: HttpGateway) -> Self {
        self.http = Some(gateway);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn broadcaster(mut self, broadcaster: EventBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine and starts its sink writer.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> ExecutionEngine {
        let config = self.config;
        let http = self.http.unwrap_or_else(|| {
            HttpGateway::new(Enforcer::new(config.security.clone(), config.limits.clone()))
        });
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopSink));
        let (sink, _writer) = SinkWriter::spawn(sink, config.sink_retry_attempts);
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| EventBroadcaster::new(config.event_capacity));

        ExecutionEngine {
            inner: Arc::new(EngineInner {
                workflows: self
                    .workflows
                    .unwrap_or_else(|| Arc::new(InMemoryWorkflowSource::new())),
                provider: self.provider.unwrap_or_else(|| Arc::new(NodeRegistry::new())),
                credentials: self
                    .credentials
                    .unwrap_or_else(|| Arc::new(InMemoryCredentialStore::new())),
                http,
                sink,
                broadcaster,
                budget: ConcurrencyBudget::new(config.concurrency.clone()),
                plans: PlanCache::new(),
                resolver: Arc::new(ParameterResolver::new()),
                executions: RwLock::new(HashMap::new()),
                config: Arc::new(config),
            }),
        }
    }
}
