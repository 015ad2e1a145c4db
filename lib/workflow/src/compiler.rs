//! Graph compilation.
//!
//! [`compile`] turns an authored [`WorkflowGraph`] into an immutable
//! [`ExecutionPlan`]: node arena, id index, planned edges with forward and
//! reverse adjacency, per-node input counts, start nodes and a topological
//! ordering hint. Compilation is pure; [`PlanCache`] memoizes it per workflow
//! and content hash.

use crate::connection::Connection;
use crate::error::{GraphError, PortDirection};
use crate::graph::WorkflowGraph;
use crate::node::{Node, NodeId};
use crate::registry::NodeProvider;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use weaver_core::WorkflowId;

/// A connection resolved to arena indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEdge {
    pub source: usize,
    pub source_output: String,
    pub target: usize,
    pub target_input: String,
    pub optional: bool,
    /// Position among the target's incoming edges, in declaration order.
    pub target_position: usize,
}

/// The executable form of a workflow graph.
#[derive(Debug)]
pub struct ExecutionPlan {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    edges: Vec<PlannedEdge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    required_inputs: Vec<usize>,
    optional_inputs: Vec<usize>,
    start_nodes: Vec<usize>,
    topological_order: Vec<usize>,
    content_hash: u64,
}

impl ExecutionPlan {
    /// Nodes in declaration order. Arena indices refer to this slice.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node at an arena index.
    #[must_use]
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Arena index of a node id.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// All planned edges, in connection declaration order.
    #[must_use]
    pub fn edges(&self) -> &[PlannedEdge] {
        &self.edges
    }

    /// Planned edge by index.
    #[must_use]
    pub fn edge(&self, edge: usize) -> &PlannedEdge {
        &self.edges[edge]
    }

    /// Edge indices leaving a node.
    #[must_use]
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    /// Edge indices entering a node, in declaration order.
    #[must_use]
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    /// Number of non-optional incoming edges.
    #[must_use]
    pub fn required_inputs(&self, node: usize) -> usize {
        self.required_inputs[node]
    }

    /// Number of optional incoming edges.
    #[must_use]
    pub fn optional_inputs(&self, node: usize) -> usize {
        self.optional_inputs[node]
    }

    /// Nodes with no incoming edges.
    #[must_use]
    pub fn start_nodes(&self) -> &[usize] {
        &self.start_nodes
    }

    /// A valid topological order of all nodes.
    #[must_use]
    pub fn topological_order(&self) -> &[usize] {
        &self.topological_order
    }

    /// Content hash of the source graph.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    /// Content hash rendered as a fixed-width hex reference.
    #[must_use]
    pub fn plan_ref(&self) -> String {
        format!("{:016x}", self.content_hash)
    }

    /// Checks the plan against registered node types.
    ///
    /// Disabled nodes are never dispatched, so their type and ports are not
    /// checked.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNodeType`, `UnknownPort` or `MissingCredential` for
    /// the first offending node or connection.
    pub fn check_types(&self, provider: &dyn NodeProvider) -> Result<(), GraphError> {
        let mut descriptors = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.disabled {
                descriptors.push(None);
                continue;
            }
            let Some(logic) = provider.get(&node.node_type) else {
                return Err(GraphError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            };
            let descriptor = logic.descriptor();

            let mut refs = node.credential_refs.iter();
            for slot in &descriptor.credentials {
                if refs.next().is_none() && slot.required {
                    return Err(GraphError::MissingCredential {
                        node_id: node.id.clone(),
                        credential: slot.name.clone(),
                    });
                }
            }
            descriptors.push(Some(descriptor));
        }

        for edge in &self.edges {
            let ends = [
                (edge.source, PortDirection::Output, &edge.source_output),
                (edge.target, PortDirection::Input, &edge.target_input),
            ];
            for (node, direction, port) in ends {
                if let Some(descriptor) = &descriptors[node]
                    && !descriptor.has_port(direction, port)
                {
                    return Err(GraphError::UnknownPort {
                        node_id: self.nodes[node].id.clone(),
                        port: port.clone(),
                        direction,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Hashes the graph's canonical content.
///
/// JSON objects hash by their serialized form, which has sorted keys.
#[must_use]
pub fn content_hash(graph: &WorkflowGraph) -> u64 {
    let mut hasher = DefaultHasher::new();
    graph.nodes.len().hash(&mut hasher);
    for node in &graph.nodes {
        node.id.hash(&mut hasher);
        node.node_type.hash(&mut hasher);
        node.parameters.to_string().hash(&mut hasher);
        node.disabled.hash(&mut hasher);
        node.credential_refs.hash(&mut hasher);
        format!("{:?}", node.settings).hash(&mut hasher);
    }
    graph.connections.hash(&mut hasher);
    hasher.finish()
}

/// Compiles a graph into an execution plan.
///
/// # Errors
///
/// - `DuplicateNode` when two nodes share an id
/// - `DanglingConnection` when a connection names an unknown node
/// - `CyclicDependency` naming the nodes of the first cycle found
pub fn compile(graph: &WorkflowGraph) -> Result<ExecutionPlan, GraphError> {
    let mut index = HashMap::with_capacity(graph.nodes.len());
    for (i, node) in graph.nodes.iter().enumerate() {
        if index.insert(node.id.clone(), i).is_some() {
            return Err(GraphError::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
    }

    let node_count = graph.nodes.len();
    let mut edges = Vec::with_capacity(graph.connections.len());
    let mut outgoing = vec![Vec::new(); node_count];
    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    let mut required_inputs = vec![0; node_count];
    let mut optional_inputs = vec![0; node_count];

    for (position, connection) in graph.connections.iter().enumerate() {
        let (source, target) = resolve_endpoints(&index, position, connection)?;
        let edge = edges.len();
        edges.push(PlannedEdge {
            source,
            source_output: connection.source_output.clone(),
            target,
            target_input: connection.target_input.clone(),
            optional: connection.optional,
            target_position: incoming[target].len(),
        });
        outgoing[source].push(edge);
        incoming[target].push(edge);
        if connection.optional {
            optional_inputs[target] += 1;
        } else {
            required_inputs[target] += 1;
        }
    }

    if let Some(cycle) = find_cycle(node_count, &edges, &outgoing) {
        return Err(GraphError::CyclicDependency {
            cycle: cycle.into_iter().map(|i| graph.nodes[i].id.clone()).collect(),
        });
    }

    let topological_order = topological_hint(node_count, &edges).map_err(|node| {
        GraphError::CyclicDependency {
            cycle: vec![graph.nodes[node].id.clone()],
        }
    })?;

    let start_nodes = (0..node_count).filter(|&i| incoming[i].is_empty()).collect();

    Ok(ExecutionPlan {
        nodes: graph.nodes.clone(),
        index,
        edges,
        outgoing,
        incoming,
        required_inputs,
        optional_inputs,
        start_nodes,
        topological_order,
        content_hash: content_hash(graph),
    })
}

fn resolve_endpoints(
    index: &HashMap<NodeId, usize>,
    position: usize,
    connection: &Connection,
) -> Result<(usize, usize), GraphError> {
    let lookup = |id: &NodeId| {
        index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::DanglingConnection {
                connection: position,
                node_id: id.clone(),
            })
    };
    Ok((
        lookup(&connection.source_node_id)?,
        lookup(&connection.target_node_id)?,
    ))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with an explicit stack. Returns the nodes of the first
/// back-edge's cycle, in traversal order.
fn find_cycle(node_count: usize, edges: &[PlannedEdge], outgoing: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; node_count];
    // (node, next outgoing edge to look at)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..node_count {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::OnStack;
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            let Some(&edge) = outgoing[node].get(cursor) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            frame.1 += 1;

            let next = edges[edge].target;
            match marks[next] {
                Mark::Unvisited => {
                    marks[next] = Mark::OnStack;
                    stack.push((next, 0));
                }
                Mark::OnStack => {
                    let start = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    return Some(stack[start..].iter().map(|&(n, _)| n).collect());
                }
                Mark::Done => {}
            }
        }
    }
    None
}

fn topological_hint(node_count: usize, edges: &[PlannedEdge]) -> Result<Vec<usize>, usize> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(node_count, edges.len());
    let indices: Vec<NodeIndex> = (0..node_count).map(|i| graph.add_node(i)).collect();
    for edge in edges {
        graph.add_edge(indices[edge.source], indices[edge.target], ());
    }
    petgraph::algo::toposort(&graph, None)
        .map(|order| order.into_iter().map(|ix| graph[ix]).collect())
        .map_err(|cycle| graph[cycle.node_id()])
}

/// Compiled plans keyed by workflow id.
///
/// Each workflow keeps at most one plan. A lookup with a graph whose content
/// hash differs from the cached plan recompiles and replaces the entry.
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: Mutex<HashMap<WorkflowId, Arc<ExecutionPlan>>>,
}

impl PlanCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached plan for this graph version, compiling on a miss.
    ///
    /// # Errors
    ///
    /// Returns the compile error; nothing is cached in that case.
    pub fn get_or_compile(
        &self,
        workflow_id: WorkflowId,
        graph: &WorkflowGraph,
    ) -> Result<Arc<ExecutionPlan>, GraphError> {
        let hash = content_hash(graph);
        if let Ok(plans) = self.plans.lock()
            && let Some(plan) = plans.get(&workflow_id)
            && plan.content_hash() == hash
        {
            return Ok(Arc::clone(plan));
        }

        let plan = Arc::new(compile(graph)?);
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert(workflow_id, Arc::clone(&plan));
        }
        Ok(plan)
    }

    /// Drops the plan of a workflow.
    pub fn invalidate(&self, workflow_id: WorkflowId) {
        if let Ok(mut plans) = self.plans.lock() {
            plans.remove(&workflow_id);
        }
    }

    /// Number of cached plans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Returns true when no plan is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::descriptor::NodeDescriptor;
    use crate::registry::NodeRegistry;
    use crate::runtime::{Item, NodeExecutionContext, NodeLogic, OutputByPort};
    use crate::error::NodeError;
    use async_trait::async_trait;
    use serde_json::json;

    fn ids(nodes: &[NodeId]) -> Vec<&str> {
        nodes.iter().map(NodeId::as_str).collect()
    }

    fn chain(names: &[&str]) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        for name in names {
            graph.add_node(Node::new(*name, "noop"));
        }
        for pair in names.windows(2) {
            graph.connect(Connection::new(pair[0], pair[1]));
        }
        graph
    }

    #[test]
    fn compiles_diamond() {
        let graph = WorkflowGraph::new()
            .with_node(Node::new("a", "noop"))
            .with_node(Node::new("b", "noop"))
            .with_node(Node::new("c", "noop"))
            .with_node(Node::new("d", "noop"))
            .with_connection(Connection::new("a", "b"))
            .with_connection(Connection::new("a", "c"))
            .with_connection(Connection::new("c", "d"))
            .with_connection(Connection::new("b", "d").optional());
        let plan = compile(&graph).expect("acyclic");

        assert_eq!(plan.start_nodes(), &[0]);
        let d = plan.index_of("d").expect("d");
        assert_eq!(plan.required_inputs(d), 1);
        assert_eq!(plan.optional_inputs(d), 1);

        // c -> d was declared before b -> d
        let positions: Vec<(usize, usize)> = plan
            .incoming(d)
            .iter()
            .map(|&e| (plan.edge(e).source, plan.edge(e).target_position))
            .collect();
        assert_eq!(positions, vec![(2, 0), (1, 1)]);

        let order = plan.topological_order();
        let pos = |n: usize| order.iter().position(|&x| x == n).expect("present");
        assert!(pos(0) < pos(1) && pos(0) < pos(2) && pos(2) < pos(3));
    }

    #[test]
    fn rejects_cycles_naming_the_nodes() {
        let mut graph = chain(&["a", "b", "c"]);
        graph.add_node(Node::new("d", "noop"));
        graph.connect(Connection::new("c", "a"));

        let err = compile(&graph).expect_err("cyclic");
        match err {
            GraphError::CyclicDependency { cycle } => assert_eq!(ids(&cycle), vec!["a", "b", "c"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_self_loops() {
        let graph = chain(&["a"]).with_connection(Connection::new("a", "a"));
        let err = compile(&graph).expect_err("cyclic");
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec![NodeId::from("a")]
            }
        );
    }

    #[test]
    fn rejects_dangling_connections() {
        let graph = chain(&["a"]).with_connection(Connection::new("a", "ghost"));
        let err = compile(&graph).expect_err("dangling");
        assert_eq!(
            err,
            GraphError::DanglingConnection {
                connection: 0,
                node_id: NodeId::from("ghost")
            }
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let graph = chain(&["a", "b"]).with_node(Node::new("a", "noop"));
        assert!(matches!(
            compile(&graph),
            Err(GraphError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn hash_tracks_content() {
        let a = chain(&["a", "b"]);
        let mut b = chain(&["a", "b"]);
        assert_eq!(content_hash(&a), content_hash(&b));

        b.nodes[1].parameters = json!({"value": 1});
        assert_ne!(content_hash(&a), content_hash(&b));
        assert_eq!(compile(&a).expect("plan").plan_ref().len(), 16);
    }

    #[test]
    fn cache_reuses_and_replaces_plans() {
        let cache = PlanCache::new();
        let workflow = WorkflowId::new();
        let graph = chain(&["a", "b"]);

        let first = cache.get_or_compile(workflow, &graph).expect("plan");
        let again = cache.get_or_compile(workflow, &graph).expect("plan");
        assert!(Arc::ptr_eq(&first, &again));

        let changed = chain(&["a", "b", "c"]);
        let replaced = cache.get_or_compile(workflow, &changed).expect("plan");
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert_eq!(cache.len(), 1);

        let cyclic = changed.with_connection(Connection::new("c", "a"));
        assert!(cache.get_or_compile(workflow, &cyclic).is_err());
        let still = cache.get_or_compile(workflow, &chain(&["a", "b", "c"])).expect("plan");
        assert!(Arc::ptr_eq(&replaced, &still));
    }

    struct Fixed(NodeDescriptor);

    #[async_trait]
    impl NodeLogic for Fixed {
        fn descriptor(&self) -> NodeDescriptor {
            self.0.clone()
        }

        async fn execute(
            &self,
            _items: Vec<Item>,
            _ctx: &NodeExecutionContext,
        ) -> Result<OutputByPort, NodeError> {
            Ok(OutputByPort::new())
        }
    }

    fn registry() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry
            .register(Arc::new(Fixed(NodeDescriptor::new("noop"))))
            .expect("noop");
        registry
            .register(Arc::new(Fixed(
                NodeDescriptor::new("if").with_outputs(["true", "false"]),
            )))
            .expect("if");
        registry
            .register(Arc::new(Fixed(
                NodeDescriptor::new("api").with_credential("token", true),
            )))
            .expect("api");
        registry
    }

    #[test]
    fn type_checks_against_registry() {
        let registry = registry();

        let ok = WorkflowGraph::new()
            .with_node(Node::new("check", "if"))
            .with_node(Node::new("yes", "noop"))
            .with_connection(Connection::new("check", "yes").from_port("true"));
        compile(&ok).expect("plan").check_types(&registry).expect("valid");

        let bad_port = WorkflowGraph::new()
            .with_node(Node::new("check", "if"))
            .with_node(Node::new("next", "noop"))
            .with_connection(Connection::new("check", "next").from_port("maybe"));
        let err = compile(&bad_port).expect("plan").check_types(&registry).expect_err("port");
        assert!(matches!(err, GraphError::UnknownPort { direction: PortDirection::Output, .. }));

        let unknown = WorkflowGraph::new().with_node(Node::new("x", "nope"));
        let err = compile(&unknown).expect("plan").check_types(&registry).expect_err("type");
        assert!(matches!(err, GraphError::UnknownNodeType { .. }));

        let disabled = WorkflowGraph::new().with_node(Node::new("x", "nope").disabled());
        compile(&disabled).expect("plan").check_types(&registry).expect("disabled skipped");
    }

    #[test]
    fn required_credentials_need_a_reference() {
        let registry = registry();
        let missing = WorkflowGraph::new().with_node(Node::new("call", "api"));
        let err = compile(&missing).expect("plan").check_types(&registry).expect_err("missing");
        assert_eq!(
            err,
            GraphError::MissingCredential {
                node_id: NodeId::from("call"),
                credential: "token".to_string()
            }
        );

        let present = WorkflowGraph::new().with_node(Node::new("call", "api").with_credential("gh"));
        compile(&present).expect("plan").check_types(&registry).expect("valid");
    }
}
