//! Workflow graph storage.
//!
//! The graph is two flat arenas: nodes and connections, both in declaration
//! order. Nothing here is validated; [`crate::compiler::compile`] checks
//! endpoints and acyclicity and builds the index structures the scheduler
//! runs on.

use crate::connection::Connection;
use crate::node::{Node, NodeId};
use serde::{Deserialize, Serialize};

/// A workflow graph as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends a connection.
    #[must_use]
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Appends a node in place.
    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Appends a connection in place.
    pub fn connect(&mut self, connection: Connection) -> &mut Self {
        self.connections.push(connection);
        self
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Connections leaving `id`, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .iter()
            .filter(move |c| &c.source_node_id == id)
    }

    /// Connections entering `id`, in declaration order.
    pub fn incoming<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .iter()
            .filter(move |c| &c.target_node_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(Node::new("start", "trigger.manual"))
            .with_node(Node::new("check", "if"))
            .with_node(Node::new("yes", "noop"))
            .with_connection(Connection::new("start", "check"))
            .with_connection(Connection::new("check", "yes").from_port("true"))
    }

    #[test]
    fn lookup_and_adjacency() {
        let graph = sample();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node("check").map(|n| n.node_type.as_str()), Some("if"));
        assert!(graph.node("missing").is_none());

        let check = NodeId::from("check");
        assert_eq!(graph.incoming(&check).count(), 1);
        let out: Vec<_> = graph.outgoing(&check).map(|c| c.source_output.as_str()).collect();
        assert_eq!(out, vec!["true"]);
    }

    #[test]
    fn parses_authored_json() {
        let graph: WorkflowGraph = serde_json::from_value(json!({
            "nodes": [
                {"id": "start", "type": "trigger.manual"},
                {"id": "check", "type": "if"},
                {"id": "yes", "type": "noop"}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "check"},
                {"sourceNodeId": "check", "sourceOutput": "true", "targetNodeId": "yes"}
            ]
        }))
        .expect("deserialize");
        assert_eq!(graph, sample());
    }

    #[test]
    fn in_place_builders() {
        let mut graph = WorkflowGraph::new();
        graph
            .add_node(Node::new("a", "noop"))
            .add_node(Node::new("b", "noop"))
            .connect(Connection::new("a", "b"));
        assert_eq!(graph.connections.len(), 1);
    }
}
