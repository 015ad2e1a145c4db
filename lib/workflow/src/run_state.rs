//! Per-execution readiness bookkeeping.
//!
//! Every edge of the plan resolves exactly once: it either delivers the items
//! its source put on the edge's port, or it is dead because the port stayed
//! empty, the source was skipped, or the source was disabled under
//! [`DisabledNodePolicy::Skip`]. A waiting node becomes ready once all its
//! required edges have resolved and at least one edge delivered; if every
//! edge is dead it is skipped, which in turn kills its own outgoing edges.
//!
//! Nothing here is async and nothing here knows about tasks, which keeps the
//! coordinator loop small and the propagation rules unit-testable.

use crate::compiler::ExecutionPlan;
use crate::config::DisabledNodePolicy;
use crate::connection::MAIN_PORT;
use crate::runtime::{Item, OutputByPort};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outcome of resolving edges, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Transition {
    /// The node has its merged input and can be dispatched.
    Ready { node: usize, input: Vec<Item> },
    /// The node will never run.
    Skipped { node: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Settled,
}

#[derive(Debug)]
struct Slot {
    phase: Phase,
    pending_required: usize,
    pending_optional: usize,
    delivered: usize,
    /// Indexed by the edge's position among the node's incoming edges.
    inbox: Vec<Option<Vec<Item>>>,
}

enum Resolution {
    Deliver(Vec<Item>),
    Dead,
}

#[derive(Debug)]
pub(crate) struct RunState {
    plan: Arc<ExecutionPlan>,
    policy: DisabledNodePolicy,
    slots: Vec<Slot>,
}

impl RunState {
    pub(crate) fn new(plan: Arc<ExecutionPlan>, policy: DisabledNodePolicy) -> Self {
        let slots = (0..plan.nodes().len())
            .map(|index| Slot {
                phase: Phase::Waiting,
                pending_required: plan.required_inputs(index),
                pending_optional: plan.optional_inputs(index),
                delivered: 0,
                inbox: vec![None; plan.incoming(index).len()],
            })
            .collect();
        Self {
            plan,
            policy,
            slots,
        }
    }

    /// Feeds the trigger items to every start node.
    pub(crate) fn start(&mut self, trigger_data: &JsonValue) -> Vec<Transition> {
        let items = trigger_items(trigger_data);
        let mut transitions = Vec::new();
        let mut work = VecDeque::new();
        let plan = Arc::clone(&self.plan);
        for &node in plan.start_nodes() {
            self.settle(node, items.clone(), &mut work, &mut transitions);
        }
        self.drain(work, &mut transitions);
        transitions
    }

    /// Resolves the outgoing edges of a node that finished with `outputs`.
    pub(crate) fn complete(&mut self, node: usize, outputs: &OutputByPort) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let mut work = VecDeque::new();
        let plan = Arc::clone(&self.plan);
        for &edge in plan.outgoing(node) {
            let items = outputs.get(&plan.edge(edge).source_output);
            let resolution = if items.is_empty() {
                Resolution::Dead
            } else {
                Resolution::Deliver(items.to_vec())
            };
            self.resolve(edge, resolution, &mut work, &mut transitions);
        }
        self.drain(work, &mut transitions);
        transitions
    }

    /// Returns true while the node still waits on inputs.
    pub(crate) fn is_waiting(&self, node: usize) -> bool {
        self.slots[node].phase == Phase::Waiting
    }

    fn drain(&mut self, mut work: VecDeque<(usize, Vec<Resolution>)>, out: &mut Vec<Transition>) {
        while let Some((node, resolutions)) = work.pop_front() {
            let edges: Vec<usize> = self.plan.outgoing(node).to_vec();
            for (edge, resolution) in edges.into_iter().zip(resolutions) {
                self.resolve(edge, resolution, &mut work, out);
            }
        }
    }

    fn resolve(
        &mut self,
        edge: usize,
        resolution: Resolution,
        work: &mut VecDeque<(usize, Vec<Resolution>)>,
        out: &mut Vec<Transition>,
    ) {
        let planned = self.plan.edge(edge);
        let target = planned.target;
        let slot = &mut self.slots[target];
        if slot.phase != Phase::Waiting {
            return;
        }

        if planned.optional {
            slot.pending_optional = slot.pending_optional.saturating_sub(1);
        } else {
            slot.pending_required = slot.pending_required.saturating_sub(1);
        }
        if let Resolution::Deliver(items) = resolution {
            slot.delivered += 1;
            slot.inbox[planned.target_position] = Some(items);
        }

        if slot.pending_required > 0 {
            return;
        }
        if slot.delivered > 0 {
            let input: Vec<Item> = slot.inbox.iter_mut().filter_map(Option::take).flatten().collect();
            self.settle(target, input, work, out);
        } else if slot.pending_optional == 0 {
            slot.phase = Phase::Settled;
            out.push(Transition::Skipped {
                node: target,
                reason: "no input reached this node".to_string(),
            });
            work.push_back((target, self.dead_edges(target)));
        }
    }

    /// A node got its input: ready it, or handle it as disabled.
    fn settle(
        &mut self,
        node: usize,
        input: Vec<Item>,
        work: &mut VecDeque<(usize, Vec<Resolution>)>,
        out: &mut Vec<Transition>,
    ) {
        self.slots[node].phase = Phase::Settled;
        if !self.plan.node(node).disabled {
            out.push(Transition::Ready { node, input });
            return;
        }

        out.push(Transition::Skipped {
            node,
            reason: "node is disabled".to_string(),
        });
        let resolutions = match self.policy {
            DisabledNodePolicy::Skip => self.dead_edges(node),
            DisabledNodePolicy::PassThrough => self
                .plan
                .outgoing(node)
                .iter()
                .map(|&edge| {
                    if self.plan.edge(edge).source_output == MAIN_PORT && !input.is_empty() {
                        Resolution::Deliver(input.clone())
                    } else {
                        Resolution::Dead
                    }
                })
                .collect(),
        };
        work.push_back((node, resolutions));
    }

    fn dead_edges(&self, node: usize) -> Vec<Resolution> {
        self.plan.outgoing(node).iter().map(|_| Resolution::Dead).collect()
    }
}

/// Turns trigger data into the items start nodes receive.
///
/// An array yields one item per element, `null` a single empty item, and
/// any other value a single item.
pub(crate) fn trigger_items(trigger_data: &JsonValue) -> Vec<Item> {
    match trigger_data {
        JsonValue::Array(values) => values.iter().cloned().map(Item::new).collect(),
        JsonValue::Null => vec![Item::empty()],
        other => vec![Item::new(other.clone())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::connection::Connection;
    use crate::graph::WorkflowGraph;
    use crate::node::Node;
    use serde_json::json;

    fn plan(graph: WorkflowGraph) -> Arc<ExecutionPlan> {
        Arc::new(compile(&graph).expect("compile"))
    }

    fn node_named(plan: &ExecutionPlan, id: &str) -> usize {
        plan.index_of(id).expect("node exists")
    }

    fn ready_names(plan: &ExecutionPlan, transitions: &[Transition]) -> Vec<String> {
        transitions
            .iter()
            .filter_map(|t| match t {
                Transition::Ready { node, .. } => Some(plan.node(*node).id.to_string()),
                Transition::Skipped { .. } => None,
            })
            .collect()
    }

    fn skipped_names(plan: &ExecutionPlan, transitions: &[Transition]) -> Vec<String> {
        transitions
            .iter()
            .filter_map(|t| match t {
                Transition::Skipped { node, .. } => Some(plan.node(*node).id.to_string()),
                Transition::Ready { .. } => None,
            })
            .collect()
    }

    fn data(transitions: &[Transition], index: usize) -> Vec<JsonValue> {
        transitions
            .iter()
            .find_map(|t| match t {
                Transition::Ready { node, input } if *node == index => {
                    Some(input.iter().map(|i| i.data.clone()).collect())
                }
                _ => None,
            })
            .expect("node became ready")
    }

    #[test]
    fn trigger_data_shapes() {
        assert_eq!(trigger_items(&json!([1, 2])).len(), 2);
        assert_eq!(trigger_items(&JsonValue::Null), vec![Item::empty()]);
        assert_eq!(trigger_items(&json!({"a": 1})), vec![Item::new(json!({"a": 1}))]);
    }

    #[test]
    fn linear_chain_becomes_ready_step_by_step() {
        let plan = plan(
            WorkflowGraph::new()
                .with_node(Node::new("a", "noop"))
                .with_node(Node::new("b", "noop"))
                .with_connection(Connection::new("a", "b")),
        );
        let mut state = RunState::new(Arc::clone(&plan), DisabledNodePolicy::Skip);
        let started = state.start(&json!({"x": 1}));
        assert_eq!(ready_names(&plan, &started), vec!["a"]);

        let a = node_named(&plan, "a");
        let b = node_named(&plan, "b");
        let next = state.complete(a, &OutputByPort::main(vec![Item::new(json!({"x": 2}))]));
        assert_eq!(data(&next, b), vec![json!({"x": 2})]);
        assert!(!state.is_waiting(b));
    }

    #[test]
    fn merge_follows_declaration_order() {
        // c's connections are declared b first, then a.
        let plan = plan(
            WorkflowGraph::new()
                .with_node(Node::new("a", "noop"))
                .with_node(Node::new("b", "noop"))
                .with_node(Node::new("c", "noop"))
                .with_connection(Connection::new("b", "c"))
                .with_connection(Connection::new("a", "c")),
        );
        let mut state = RunState::new(Arc::clone(&plan), DisabledNodePolicy::Skip);
        state.start(&JsonValue::Null);
        let (a, b, c) = (
            node_named(&plan, "a"),
            node_named(&plan, "b"),
            node_named(&plan, "c"),
        );

        // a finishes first, but b's items still come first.
        assert!(state.complete(a, &OutputByPort::main(vec![Item::new(json!("a"))])).is_empty());
        let next = state.complete(b, &OutputByPort::main(vec![Item::new(json!("b"))]));
        assert_eq!(data(&next, c), vec![json!("b"), json!("a")]);
    }

    #[test]
    fn untaken_branch_is_skipped_transitively() {
        let plan = plan(
            WorkflowGraph::new()
                .with_node(Node::new("if", "if"))
                .with_node(Node::new("yes", "noop"))
                .with_node(Node::new("no", "noop"))
                .with_node(Node::new("after_no", "noop"))
                .with_connection(Connection::new("if", "yes").from_port("true"))
                .with_connection(Connection::new("if", "no").from_port("false"))
                .with_connection(Connection::new("no", "after_no")),
        );
        let mut state = RunState::new(Arc::clone(&plan), DisabledNodePolicy::Skip);
        state.start(&JsonValue::Null);

        let mut outputs = OutputByPort::new();
        outputs.extend("true", vec![Item::empty()]);
        outputs.extend("false", Vec::new());
        let next = state.complete(node_named(&plan, "if"), &outputs);
        assert_eq!(ready_names(&plan, &next), vec!["yes"]);
        assert_eq!(skipped_names(&plan, &next), vec!["no", "after_no"]);
    }

    #[test]
    fn join_runs_with_partial_input_when_one_side_is_dead() {
        let plan = plan(
            WorkflowGraph::new()
                .with_node(Node::new("a", "noop"))
                .with_node(Node::new("b", "noop"))
                .with_node(Node::new("join", "noop"))
                .with_connection(Connection::new("a", "join"))
                .with_connection(Connection::new("b", "join")),
        );
        let mut state = RunState::new(Arc::clone(&plan), DisabledNodePolicy::Skip);
        state.start(&JsonValue::Null);
        let join = node_named(&plan, "join");

        assert!(state.complete(node_named(&plan, "a"), &OutputByPort::main(Vec::new())).is_empty());
        let next = state.complete(
            node_named(&plan, "b"),
            &OutputByPort::main(vec![Item::new(json!(1))]),
        );
        assert_eq!(data(&next, join), vec![json!(1)]);
    }

    #[test]
    fn optional_edge_does_not_block() {
        let plan = plan(
            WorkflowGraph::new()
                .with_node(Node::new("a", "noop"))
                .with_node(Node::new("slow", "noop"))
                .with_node(Node::new("c", "noop"))
                .with_connection(Connection::new("a", "c"))
                .with_connection(Connection::new("slow", "c").optional()),
        );
        let mut state = RunState::new(Arc::clone(&plan), DisabledNodePolicy::Skip);
        state.start(&JsonValue::Null);
        let c = node_named(&plan, "c");

        let next = state.complete(
            node_named(&plan, "a"),
            &OutputByPort::main(vec![Item::new(json!("a"))]),
        );
        assert_eq!(data(&next, c), vec![json!("a")]);

        // Late items are dropped.
        let late = state.complete(
            node_named(&plan, "slow"),
            &OutputByPort::main(vec![Item::new(json!("late"))]),
        );
        assert!(late.is_empty());
    }

    #[test]
    fn disabled_node_skip_policy_kills_downstream() {
        let plan = plan(
            WorkflowGraph::new()
                .with_node(Node::new("a", "noop"))
                .with_node(Node::new("off", "noop").disabled())
                .with_node(Node::new("c", "noop"))
                .with_connection(Connection::new("a", "off"))
                .with_connection(Connection::new("off", "c")),
        );
        let mut state = RunState::new(Arc::clone(&plan), DisabledNodePolicy::Skip);
        state.start(&JsonValue::Null);
        let next = state.complete(
            node_named(&plan, "a"),
            &OutputByPort::main(vec![Item::new(json!(1))]),
        );
        assert!(ready_names(&plan, &next).is_empty());
        assert_eq!(skipped_names(&plan, &next), vec!["off", "c"]);
    }

    #[test]
    fn disabled_node_pass_through_forwards_input() {
        let plan = plan(
            WorkflowGraph::new()
                .with_node(Node::new("off", "noop").disabled())
                .with_node(Node::new("c", "noop"))
                .with_connection(Connection::new("off", "c")),
        );
        let mut state = RunState::new(Arc::clone(&plan), DisabledNodePolicy::PassThrough);
        let started = state.start(&json!([{"n": 1}, {"n": 2}]));
        assert_eq!(skipped_names(&plan, &started), vec!["off"]);
        assert_eq!(
            data(&started, node_named(&plan, "c")),
            vec![json!({"n": 1}), json!({"n": 2})]
        );
    }
}
