//! The per-execution coordinator.
//!
//! One [`Coordinator`] task owns all mutable state of an execution. Node
//! attempts run as separate tasks in a `JoinSet` and report back an outcome
//! value; retry backoffs are timer tasks in the same set. The coordinator
//! wakes on a task outcome, the cancellation token, the cancel grace
//! deadline or a released budget permit, and after each wake-up dispatches
//! whatever became ready.
//!
//! The authoritative [`Execution`] lives in a `watch` channel shared with the
//! engine: every change goes through [`Coordinator::update_node`], which also
//! queues a snapshot for the sink.

use crate::budget::{BudgetPermit, ConcurrencyBudget};
use crate::compiler::ExecutionPlan;
use crate::config::EngineConfig;
use crate::connection::MAIN_PORT;
use crate::descriptor::NodeDescriptor;
use crate::error::{ErrorKind, NodeError, PortDirection};
use crate::events::{EventBroadcaster, EventEmitter, EventKind, OutputSummary};
use crate::execution::{
    ErrorRecord, Execution, ExecutionFailure, ExecutionStatus, NodeExecutionState, NodeSnapshot,
};
use crate::retry::RetryDecision;
use crate::run_state::{RunState, Transition};
use crate::runtime::{Item, NodeExecutionContext, NodeLogic, OutputByPort, RuntimeServices};
use crate::sink::SinkWriter;
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use weaver_core::{ExecutionId, UserId, WorkflowId};

/// Serializes `cancel()` against dispatch.
///
/// The coordinator holds the lock while it checks the flag and spawns a node
/// task, and `cancel()` holds it while setting the flag, so once `cancel()`
/// returns no further dispatch can start.
#[derive(Debug, Default)]
pub(crate) struct DispatchGate {
    cancelled: Mutex<bool>,
}

impl DispatchGate {
    pub(crate) fn lock(&self) -> MutexGuard<'_, bool> {
        self.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything the engine hands a new coordinator.
pub(crate) struct CoordinatorParts {
    pub(crate) plan: Arc<ExecutionPlan>,
    pub(crate) logics: Vec<Option<Arc<dyn NodeLogic>>>,
    pub(crate) state: Arc<watch::Sender<Execution>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) gate: Arc<DispatchGate>,
    pub(crate) services: RuntimeServices,
    pub(crate) budget: ConcurrencyBudget,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) broadcaster: EventBroadcaster,
    pub(crate) sink: SinkWriter,
}

enum TaskOutcome {
    Finished {
        slot: usize,
        result: Result<OutputByPort, NodeError>,
    },
    RetryDue {
        slot: usize,
    },
}

enum Step {
    Cancel,
    GraceExpired,
    Joined(Result<(TaskId, TaskOutcome), JoinError>),
    BudgetReleased,
    Idle,
}

pub(crate) struct Coordinator {
    execution_id: ExecutionId,
    workflow_id: WorkflowId,
    user_id: Option<UserId>,
    plan: Arc<ExecutionPlan>,
    logics: Vec<Option<Arc<dyn NodeLogic>>>,
    descriptors: Vec<Option<NodeDescriptor>>,
    run_state: RunState,
    ready: VecDeque<usize>,
    running: HashMap<usize, AbortHandle>,
    /// Backoff timers with the error that caused them.
    backoffs: HashMap<usize, (AbortHandle, ErrorRecord)>,
    task_slots: HashMap<TaskId, usize>,
    tasks: JoinSet<TaskOutcome>,
    state: Arc<watch::Sender<Execution>>,
    emitter: EventEmitter,
    sink: SinkWriter,
    budget: ConcurrencyBudget,
    services: RuntimeServices,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    gate: Arc<DispatchGate>,
    cancelled: bool,
    failing: bool,
    grace_deadline: Option<Instant>,
}

impl Coordinator {
    pub(crate) fn new(parts: CoordinatorParts) -> Self {
        let (execution_id, workflow_id, user_id) = {
            let execution = parts.state.borrow();
            (execution.id, execution.workflow_id, execution.user_id)
        };
        let descriptors = parts
            .logics
            .iter()
            .map(|logic| logic.as_ref().map(|l| l.descriptor()))
            .collect();
        Self {
            execution_id,
            workflow_id,
            user_id,
            run_state: RunState::new(Arc::clone(&parts.plan), parts.config.disabled_nodes),
            plan: parts.plan,
            logics: parts.logics,
            descriptors,
            ready: VecDeque::new(),
            running: HashMap::new(),
            backoffs: HashMap::new(),
            task_slots: HashMap::new(),
            tasks: JoinSet::new(),
            state: parts.state,
            emitter: EventEmitter::new(execution_id, parts.broadcaster),
            sink: parts.sink,
            budget: parts.budget,
            services: parts.services,
            config: parts.config,
            cancel: parts.cancel,
            gate: parts.gate,
            cancelled: false,
            failing: false,
            grace_deadline: None,
        }
    }

    /// Drives the execution to a terminal status.
    #[instrument(
        name = "execution",
        skip(self),
        fields(execution_id = %self.execution_id, workflow_id = %self.workflow_id)
    )]
    pub(crate) async fn run(mut self) {
        self.begin();

        loop {
            let budget = self.budget.clone();
            let released = budget.released();
            tokio::pin!(released);
            released.as_mut().enable();

            let blocked = self.dispatch_ready();
            if self.tasks.is_empty() && (self.halted() || self.ready.is_empty()) {
                break;
            }

            let deadline = self.grace_deadline;
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled(), if !self.cancelled => Step::Cancel,
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => Step::GraceExpired,
                Some(joined) = self.tasks.join_next_with_id() => Step::Joined(joined),
                () = &mut released, if blocked => Step::BudgetReleased,
                else => Step::Idle,
            };

            match step {
                Step::Cancel => self.on_cancel(),
                Step::GraceExpired => self.on_grace_expired(),
                Step::Joined(joined) => self.on_joined(joined),
                Step::BudgetReleased => {}
                Step::Idle => break,
            }
        }

        self.finish();
    }

    fn halted(&self) -> bool {
        self.cancelled || self.failing
    }

    fn begin(&mut self) {
        let trigger_data = self.state.borrow().trigger_data.clone();
        self.state.send_modify(|execution| {
            if execution.status == ExecutionStatus::Pending {
                execution.status = ExecutionStatus::Running;
            }
        });
        self.emitter.emit(EventKind::ExecutionStart {
            workflow_id: self.workflow_id,
        });
        info!(nodes = self.plan.nodes().len(), "execution started");

        let transitions = self.run_state.start(&trigger_data);
        self.apply(transitions);
    }

    /// Dispatches ready nodes. Returns true when stopped by the shared budget.
    fn dispatch_ready(&mut self) -> bool {
        let limit = self.config.concurrency.per_execution;
        while !self.halted() && !self.ready.is_empty() {
            if limit != 0 && self.running.len() >= limit {
                return false;
            }
            let Some(permit) = self.budget.try_acquire(self.workflow_id, self.user_id) else {
                return true;
            };

            let gate = Arc::clone(&self.gate);
            let cancelled = gate.lock();
            if *cancelled {
                return false;
            }
            let Some(slot) = self.ready.pop_front() else {
                return false;
            };
            self.launch(slot, permit);
        }
        false
    }

    fn launch(&mut self, slot: usize, permit: BudgetPermit) {
        let Some(state) = self.update_node(slot, NodeExecutionState::start_attempt) else {
            return;
        };
        let node = self.plan.node(slot).clone();
        let attempt = state.attempts;
        debug!(node_id = %node.id, attempt, "dispatching node");
        self.emitter.emit(EventKind::NodeStart {
            node_id: node.id.clone(),
            attempt,
        });

        let timeout = node
            .settings
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.limits.node_timeout());
        let limit_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let items: Arc<[Item]> = state.input_buffer.into();
        let logic = self.logics[slot].clone();
        let ctx = NodeExecutionContext::new(
            self.execution_id,
            self.workflow_id,
            node,
            attempt,
            Arc::clone(&items),
            self.services.clone(),
        );

        let handle = self.tasks.spawn(async move {
            let _permit = permit;
            let result = match logic {
                None => Err(NodeError::validation(format!(
                    "node type '{}' is not registered",
                    ctx.node().node_type
                ))),
                Some(logic) => {
                    let run = tokio::time::timeout(timeout, logic.execute(items.to_vec(), &ctx));
                    match AssertUnwindSafe(run).catch_unwind().await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_elapsed)) => Err(NodeError::Timeout { limit_ms }),
                        Err(panic) => Err(NodeError::execution(panic_message(panic.as_ref()))),
                    }
                }
            };
            TaskOutcome::Finished { slot, result }
        });
        self.task_slots.insert(handle.id(), slot);
        self.running.insert(slot, handle);
    }

    fn on_joined(&mut self, joined: Result<(TaskId, TaskOutcome), JoinError>) {
        match joined {
            Ok((id, TaskOutcome::Finished { slot, result })) => {
                self.task_slots.remove(&id);
                // Absent when the grace period already recorded this node.
                if self.running.remove(&slot).is_some() {
                    self.on_finished(slot, result);
                }
            }
            Ok((id, TaskOutcome::RetryDue { slot })) => {
                self.task_slots.remove(&id);
                if self.backoffs.remove(&slot).is_some() {
                    self.ready.push_front(slot);
                }
            }
            Err(e) => {
                let Some(slot) = self.task_slots.remove(&e.id()) else {
                    return;
                };
                if self.running.remove(&slot).is_some() {
                    let error = NodeError::execution(format!("node task ended abnormally: {e}"));
                    self.on_finished(slot, Err(error));
                } else if let Some((_, record)) = self.backoffs.remove(&slot) {
                    self.fail_node(slot, record);
                }
            }
        }
    }

    fn on_finished(&mut self, slot: usize, result: Result<OutputByPort, NodeError>) {
        match result.and_then(|outputs| self.check_ports(slot, outputs)) {
            Ok(outputs) => self.succeed(slot, outputs, None),
            Err(error) => self.on_error(slot, error),
        }
    }

    /// Rejects output ports the node type does not declare.
    fn check_ports(&self, slot: usize, outputs: OutputByPort) -> Result<OutputByPort, NodeError> {
        let Some(descriptor) = &self.descriptors[slot] else {
            return Ok(outputs);
        };
        if let Some(port) = outputs
            .ports()
            .find(|port| !descriptor.has_port(PortDirection::Output, port))
        {
            return Err(NodeError::validation(format!(
                "node type '{}' has no output port '{port}'",
                descriptor.type_name
            )));
        }
        Ok(outputs)
    }

    fn succeed(&mut self, slot: usize, outputs: OutputByPort, error: Option<ErrorRecord>) {
        let transitions = self.run_state.complete(slot, &outputs);
        let output_summary = OutputSummary::from(&outputs);
        self.update_node(slot, move |state| {
            state.succeed(outputs);
            state.error = error;
        });
        self.emitter.emit(EventKind::NodeComplete {
            node_id: self.plan.node(slot).id.clone(),
            output_summary,
        });
        self.apply(transitions);
    }

    fn on_error(&mut self, slot: usize, error: NodeError) {
        let plan = Arc::clone(&self.plan);
        let node = plan.node(slot);
        let record = ErrorRecord::from(&error);

        if !self.halted() {
            let attempts = self
                .state
                .borrow()
                .node(node.id.as_str())
                .map_or(0, |s| s.attempts);
            let policy = node.settings.retry.as_ref().unwrap_or(&self.config.retry);
            if let RetryDecision::Retry { delay } = policy.decide(&error, attempts) {
                let last = record.clone();
                self.update_node(slot, |state| state.error = Some(last));
                self.emitter.emit(EventKind::NodeError {
                    node_id: node.id.clone(),
                    error: record.clone(),
                    will_retry: true,
                });
                info!(
                    node_id = %node.id,
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "retrying node"
                );
                let handle = self.tasks.spawn(async move {
                    tokio::time::sleep(delay).await;
                    TaskOutcome::RetryDue { slot }
                });
                self.task_slots.insert(handle.id(), slot);
                self.backoffs.insert(slot, (handle, record));
                return;
            }
        }

        let continue_on_fail = node.settings.continue_on_fail.unwrap_or_else(|| {
            self.descriptors[slot]
                .as_ref()
                .is_some_and(|d| d.continue_on_fail)
        });
        if continue_on_fail && record.kind != ErrorKind::Cancellation {
            self.emitter.emit(EventKind::NodeError {
                node_id: node.id.clone(),
                error: record.clone(),
                will_retry: false,
            });
            let port = self.descriptors[slot]
                .as_ref()
                .and_then(NodeDescriptor::first_output)
                .unwrap_or(MAIN_PORT)
                .to_string();
            let item = Item::new(json!({
                "error": {
                    "kind": record.kind.to_string(),
                    "message": record.message.clone(),
                }
            }));
            self.succeed(slot, OutputByPort::single(port, vec![item]), Some(record));
            return;
        }

        self.fail_node(slot, record);
    }

    /// Records a terminal node failure; the first one fails the execution.
    fn fail_node(&mut self, slot: usize, record: ErrorRecord) {
        let node_id = self.plan.node(slot).id.clone();
        let failed = record.clone();
        self.update_node(slot, move |state| state.fail(failed));
        self.emitter.emit(EventKind::NodeError {
            node_id: node_id.clone(),
            error: record.clone(),
            will_retry: false,
        });
        warn!(node_id = %node_id, kind = %record.kind, message = %record.message, "node failed");

        if self.halted() {
            return;
        }
        self.failing = true;
        let failure = ExecutionFailure::from_node(node_id, &record);
        self.state.send_modify(|execution| {
            execution.failure.get_or_insert(failure);
        });
        self.abandon_backoffs(None);
    }

    /// Stops pending retries. Each node keeps its last error, or `reason`
    /// as a cancellation error when given.
    fn abandon_backoffs(&mut self, reason: Option<&str>) {
        let mut pending: Vec<(usize, (AbortHandle, ErrorRecord))> = self.backoffs.drain().collect();
        pending.sort_by_key(|(slot, _)| *slot);
        for (slot, (handle, last)) in pending {
            handle.abort();
            let record = match reason {
                Some(reason) => ErrorRecord::from(&NodeError::Cancelled {
                    reason: reason.to_string(),
                }),
                None => last,
            };
            let node_id = self.plan.node(slot).id.clone();
            let failed = record.clone();
            self.update_node(slot, move |state| state.fail(failed));
            self.emitter.emit(EventKind::NodeError {
                node_id,
                error: record,
                will_retry: false,
            });
        }
    }

    fn on_cancel(&mut self) {
        self.cancelled = true;
        info!(running = self.running.len(), "cancelling execution");
        self.abandon_backoffs(Some("execution cancelled during retry backoff"));
        if !self.running.is_empty() {
            self.grace_deadline = Some(Instant::now() + self.config.cancel_grace());
        }
    }

    fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        let mut running: Vec<(usize, AbortHandle)> = self.running.drain().collect();
        running.sort_by_key(|(slot, _)| *slot);
        for (slot, handle) in running {
            handle.abort();
            let record = ErrorRecord::from(&NodeError::Cancelled {
                reason: "node did not stop within the cancellation grace period".to_string(),
            });
            let node_id = self.plan.node(slot).id.clone();
            warn!(node_id = %node_id, "aborting node after cancellation grace period");
            let failed = record.clone();
            self.update_node(slot, move |state| state.fail(failed));
            self.emitter.emit(EventKind::NodeError {
                node_id,
                error: record,
                will_retry: false,
            });
        }
    }

    fn apply(&mut self, transitions: Vec<Transition>) {
        for transition in transitions {
            match transition {
                Transition::Ready { node, input } => {
                    self.update_node(node, move |state| state.mark_ready(input));
                    self.ready.push_back(node);
                }
                Transition::Skipped { node, reason } => {
                    self.skip_node(node, reason);
                }
            }
        }
    }

    fn skip_node(&mut self, slot: usize, reason: String) {
        let node_id = self.plan.node(slot).id.clone();
        debug!(node_id = %node_id, reason = %reason, "node skipped");
        let recorded = reason.clone();
        self.update_node(slot, move |state| state.skip(recorded));
        self.emitter.emit(EventKind::NodeSkipped { node_id, reason });
    }

    fn finish(mut self) {
        let gate = Arc::clone(&self.gate);
        let cancel_requested = gate.lock();
        self.cancelled |= *cancel_requested;

        let reason = if self.cancelled {
            "execution was cancelled before this node ran"
        } else if self.failing {
            "execution failed before this node ran"
        } else {
            "node was never reached"
        };
        let leftovers: Vec<usize> = {
            let execution = self.state.borrow();
            (0..self.plan.nodes().len())
                .filter(|&slot| {
                    execution
                        .node(self.plan.node(slot).id.as_str())
                        .is_some_and(|s| !s.status.is_terminal())
                })
                .collect()
        };
        for slot in leftovers {
            self.skip_node(slot, reason.to_string());
        }

        let cancelled = self.cancelled;
        let mut finished = None;
        self.state.send_modify(|execution| {
            let status = if cancelled {
                ExecutionStatus::Cancelled
            } else if execution.failure.is_some() {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };
            execution.finish(status);
            finished = Some(execution.clone());
        });
        drop(cancel_requested);

        let Some(execution) = finished else {
            return;
        };
        let terminal = match (execution.status, &execution.failure) {
            (ExecutionStatus::Cancelled, _) => EventKind::ExecutionCancelled,
            (ExecutionStatus::Failed, Some(failure)) => EventKind::ExecutionFailed {
                failure: failure.clone(),
            },
            _ => EventKind::ExecutionComplete,
        };
        self.emitter.emit(terminal);
        info!(
            status = ?execution.status,
            duration_ms = execution.duration().num_milliseconds(),
            "execution finished"
        );
        self.sink.record_execution(execution);
    }

    /// Applies `change` to one node's state, publishes it and queues a
    /// snapshot for the sink. Returns the updated state.
    fn update_node(
        &self,
        slot: usize,
        change: impl FnOnce(&mut NodeExecutionState),
    ) -> Option<NodeExecutionState> {
        let node_id = &self.plan.node(slot).id;
        let mut updated = None;
        self.state.send_modify(|execution| {
            if let Some(state) = execution.nodes.get_mut(node_id.as_str()) {
                change(state);
                updated = Some(state.clone());
            }
        });
        if let Some(state) = &updated {
            self.sink.record_node(NodeSnapshot {
                execution_id: self.execution_id,
                workflow_id: self.workflow_id,
                node_id: node_id.clone(),
                state: state.clone(),
            });
        }
        updated
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("node panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_described() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(from_str.as_ref()), "node panicked: boom");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(panic_message(from_string.as_ref()), "node panicked: bad state");
        let opaque: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(opaque.as_ref()), "node panicked: unknown cause");
    }

    #[test]
    fn gate_survives_poisoning() {
        let gate = Arc::new(DispatchGate::default());
        let poisoner = Arc::clone(&gate);
        let _ = std::thread::spawn(move || {
            let _held = poisoner.lock();
            panic!("poison");
        })
        .join();
        *gate.lock() = true;
        assert!(*gate.lock());
    }
}
