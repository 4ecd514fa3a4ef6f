use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::node::PortKind;
use crate::registry::NodeRegistry;
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: String,
    pub node_type: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl NodeInstance {
    pub fn new(id: &str, node_type: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConnection {
    pub source_port: String,
    pub target_port: String,
    pub kind: PortKind,
}

impl PortConnection {
    pub fn data(source_port: &str, target_port: &str) -> Self {
        Self {
            source_port: source_port.to_string(),
            target_port: target_port.to_string(),
            kind: PortKind::Data,
        }
    }

    pub fn control(source_port: &str, target_port: &str) -> Self {
        Self {
            source_port: source_port.to_string(),
            target_port: target_port.to_string(),
            kind: PortKind::Control,
        }
    }
}

/// Editable, serialisable description of a workspace: node instances plus the
/// wires between their ports. [`Workspace::from_workflow`] turns it into the
/// immutable runtime topology.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: StableDiGraph<NodeInstance, PortConnection>,
    node_ids: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_ids: HashMap::new(),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse workflow JSON: {}", path.display()))
    }

    pub fn add_node(&mut self, instance: NodeInstance) -> Result<NodeIndex> {
        if self.node_ids.contains_key(&instance.id) {
            bail!("duplicate node id: {}", instance.id);
        }

        let node_id = instance.id.clone();
        let index = self.graph.add_node(instance);
        self.node_ids.insert(node_id, index);
        Ok(index)
    }

    pub fn add_connection(
        &mut self,
        from_id: &str,
        connection: PortConnection,
        to_id: &str,
    ) -> Result<()> {
        let from_idx = self
            .node_ids
            .get(from_id)
            .copied()
            .ok_or_else(|| anyhow!("unknown source node id: {from_id}"))?;
        let to_idx = self
            .node_ids
            .get(to_id)
            .copied()
            .ok_or_else(|| anyhow!("unknown target node id: {to_id}"))?;

        self.graph.add_edge(from_idx, to_idx, connection);
        Ok(())
    }

    /// Check the workflow against the node registry without keeping the result.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<()> {
        Workspace::from_workflow(self, registry).map(|_| ())
    }

    /// Feedback loops are legal (they stream), but worth reporting.
    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node(&self, idx: NodeIndex) -> &NodeInstance {
        self.graph
            .node_weight(idx)
            .expect("node index should be valid")
    }

    /// Node instances in a deterministic (id-sorted) order.
    pub fn nodes(&self) -> Vec<&NodeInstance> {
        let mut nodes: Vec<&NodeInstance> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Every connection as `(from_node, connection, to_node)`.
    pub fn connections(&self) -> Vec<(&str, &PortConnection, &str)> {
        self.graph
            .edge_references()
            .map(|edge| {
                (
                    self.node(edge.source()).id.as_str(),
                    edge.weight(),
                    self.node(edge.target()).id.as_str(),
                )
            })
            .collect()
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkflowGraphSerde {
    nodes: Vec<NodeInstance>,
    #[serde(default)]
    connections: Vec<WorkflowConnectionSerde>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkflowConnectionSerde {
    from_node: String,
    from_port: String,
    to_node: String,
    to_port: String,
    #[serde(default)]
    kind: PortKind,
}

impl Serialize for WorkflowGraph {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let nodes: Vec<NodeInstance> = self.nodes().into_iter().cloned().collect();

        let mut connections: Vec<WorkflowConnectionSerde> = self
            .connections()
            .into_iter()
            .map(|(from_node, weight, to_node)| WorkflowConnectionSerde {
                from_node: from_node.to_string(),
                from_port: weight.source_port.clone(),
                to_node: to_node.to_string(),
                to_port: weight.target_port.clone(),
                kind: weight.kind,
            })
            .collect();

        connections.sort_by(|a, b| {
            a.from_node
                .cmp(&b.from_node)
                .then_with(|| a.from_port.cmp(&b.from_port))
                .then_with(|| a.to_node.cmp(&b.to_node))
                .then_with(|| a.to_port.cmp(&b.to_port))
        });

        WorkflowGraphSerde { nodes, connections }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let serialized = WorkflowGraphSerde::deserialize(deserializer)?;
        let mut graph = WorkflowGraph::new();

        for node in serialized.nodes {
            graph.add_node(node).map_err(D::Error::custom)?;
        }

        for connection in serialized.connections {
            graph
                .add_connection(
                    &connection.from_node,
                    PortConnection {
                        source_port: connection.from_port,
                        target_port: connection.to_port,
                        kind: connection.kind,
                    },
                    &connection.to_node,
                )
                .map_err(D::Error::custom)?;
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(ids: &[&str]) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        for id in ids {
            graph
                .add_node(NodeInstance::new(id, "Print"))
                .expect("node should be added");
        }
        for pair in ids.windows(2) {
            graph
                .add_connection(pair[0], PortConnection::data("value", "value"), pair[1])
                .expect("connection should be added");
        }
        graph
    }

    #[test]
    fn test_duplicate_node_id_rejected() {
        let mut graph = WorkflowGraph::new();
        graph
            .add_node(NodeInstance::new("node", "Constant"))
            .expect("first node should be added");

        let err = graph
            .add_node(NodeInstance::new("node", "Print"))
            .expect_err("duplicate node id should error");

        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn test_connection_to_unknown_node_rejected() {
        let mut graph = chain(&["a"]);
        let err = graph
            .add_connection("a", PortConnection::data("value", "value"), "ghost")
            .expect_err("unknown target should error");
        assert_eq!(err.to_string(), "unknown target node id: ghost");
    }

    #[test]
    fn test_has_cycle_reports_feedback_loop() {
        let mut graph = chain(&["a", "b", "c"]);
        assert!(!graph.has_cycle());

        graph
            .add_connection("c", PortConnection::data("value", "value"), "a")
            .expect("back edge should be added");
        assert!(graph.has_cycle());
    }

    #[test]
    fn test_workflow_json_roundtrip() {
        let mut graph = WorkflowGraph::new();
        graph
            .add_node(
                NodeInstance::new("source", "Constant")
                    .with_param("value", serde_json::json!("X")),
            )
            .expect("source node should be added");
        graph
            .add_node(NodeInstance::new("sink", "Print"))
            .expect("sink node should be added");
        graph
            .add_connection("source", PortConnection::data("value", "value"), "sink")
            .expect("connection should be added");

        let serialized = serde_json::to_value(&graph).expect("graph should serialize");
        assert_eq!(serialized["connections"][0]["kind"], serde_json::json!("Data"));

        let restored: WorkflowGraph =
            serde_json::from_value(serialized.clone()).expect("graph should deserialize");
        let reserialized = serde_json::to_value(&restored).expect("graph should reserialize");

        assert_eq!(serialized, reserialized);
    }

    #[test]
    fn test_connection_kind_defaults_to_data() {
        let graph: WorkflowGraph = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"id": "a", "node_type": "Constant"},
                {"id": "b", "node_type": "Print"}
            ],
            "connections": [
                {"from_node": "a", "from_port": "value", "to_node": "b", "to_port": "value"}
            ]
        }))
        .expect("workflow without kinds should deserialize");

        let connections = graph.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].1.kind, PortKind::Data);
    }
}
