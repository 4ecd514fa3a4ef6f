//! Immutable runtime topology of a workspace.
//!
//! A [`Workspace`] is built once per load and shared (behind an `Arc`) by every
//! run executed from it. Node port tables are snapshotted here: `input_ports`
//! and `output_ports` are called exactly once per node.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::graph::WorkflowGraph;
use crate::node::{Node, PortDefinition, PortKind};
use crate::registry::NodeRegistry;
use crate::types::{port_data_from_json, PortData};

pub type NodeIdx = usize;

/// A port addressed by node index and its position in that node's port table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: NodeIdx,
    pub port: usize,
}

/// All bindings leaving one output port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: PortRef,
    pub destinations: Vec<PortRef>,
    pub kind: PortKind,
}

pub struct NodeEntry {
    pub id: String,
    pub node: Arc<dyn Node>,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    /// Configured value of every input: node param, else the port default.
    pub defaults: Vec<Option<PortData>>,
    /// Edge feeding each input, if any.
    pub inbound: Vec<Option<usize>>,
    /// Edge leaving each output, if any.
    pub outbound: Vec<Option<usize>>,
}

impl NodeEntry {
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|port| port.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|port| port.name == name)
    }

    pub fn has_connected_inputs(&self) -> bool {
        self.inbound.iter().any(Option::is_some)
    }

    /// Nodes slaved to a controlling node through a connected control input.
    pub fn is_control_dependent(&self) -> bool {
        self.inputs
            .iter()
            .zip(&self.inbound)
            .any(|(port, edge)| port.kind == PortKind::Control && edge.is_some())
    }
}

pub struct Workspace {
    nodes: Vec<NodeEntry>,
    edges: Vec<Edge>,
    ids: HashMap<String, NodeIdx>,
    has_cycle: bool,
}

impl Workspace {
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::default()
    }

    /// Instantiate every node of a workflow document through the registry and
    /// compile the result.
    pub fn from_workflow(workflow: &WorkflowGraph, registry: &NodeRegistry) -> Result<Self> {
        let mut builder = Workspace::builder();

        for instance in workflow.nodes() {
            let node = registry
                .create(&instance.node_type, &instance.params)
                .with_context(|| {
                    format!(
                        "failed to create node '{}' of type '{}'",
                        instance.id, instance.node_type
                    )
                })?;
            builder = builder.add_node_with_params(&instance.id, node, instance.params.clone());
        }

        for (from_node, connection, to_node) in workflow.connections() {
            builder = builder.connect_kind(
                from_node,
                &connection.source_port,
                to_node,
                &connection.target_port,
                connection.kind,
            );
        }

        builder.build()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: NodeIdx) -> &NodeEntry {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIdx, &NodeEntry)> {
        self.nodes.iter().enumerate()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, idx: usize) -> &Edge {
        &self.edges[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIdx> {
        self.ids.get(id).copied()
    }

    pub fn has_cycle(&self) -> bool {
        self.has_cycle
    }
}

struct PendingNode {
    id: String,
    node: Arc<dyn Node>,
    params: HashMap<String, serde_json::Value>,
}

struct PendingConnection {
    from_node: String,
    from_port: String,
    to_node: String,
    to_port: String,
    kind: Option<PortKind>,
}

/// Collects nodes and connections; every check runs in [`WorkspaceBuilder::build`].
#[derive(Default)]
pub struct WorkspaceBuilder {
    nodes: Vec<PendingNode>,
    connections: Vec<PendingConnection>,
}

impl WorkspaceBuilder {
    pub fn add_node(self, id: &str, node: Arc<dyn Node>) -> Self {
        self.add_node_with_params(id, node, HashMap::new())
    }

    pub fn add_node_with_params(
        mut self,
        id: &str,
        node: Arc<dyn Node>,
        params: HashMap<String, serde_json::Value>,
    ) -> Self {
        self.nodes.push(PendingNode {
            id: id.to_string(),
            node,
            params,
        });
        self
    }

    /// Bind an output port to an input port. The kind follows the ports.
    pub fn connect(self, from_node: &str, from_port: &str, to_node: &str, to_port: &str) -> Self {
        self.push_connection(from_node, from_port, to_node, to_port, None)
    }

    /// Like [`connect`](Self::connect), but the declared kind must match both ports.
    pub fn connect_kind(
        self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        kind: PortKind,
    ) -> Self {
        self.push_connection(from_node, from_port, to_node, to_port, Some(kind))
    }

    fn push_connection(
        mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        kind: Option<PortKind>,
    ) -> Self {
        self.connections.push(PendingConnection {
            from_node: from_node.to_string(),
            from_port: from_port.to_string(),
            to_node: to_node.to_string(),
            to_port: to_port.to_string(),
            kind,
        });
        self
    }

    pub fn build(self) -> Result<Workspace> {
        let mut ids = HashMap::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());

        for pending in self.nodes {
            if ids.contains_key(&pending.id) {
                bail!("duplicate node id: {}", pending.id);
            }
            ids.insert(pending.id.clone(), nodes.len());
            nodes.push(compile_node(pending)?);
        }

        let mut edges: Vec<Edge> = Vec::new();
        for connection in &self.connections {
            bind(&mut nodes, &mut edges, &ids, connection)?;
        }

        for entry in &nodes {
            for (idx, port) in entry.inputs.iter().enumerate() {
                if port.kind == PortKind::Data
                    && port.required
                    && entry.inbound[idx].is_none()
                    && entry.defaults[idx].is_none()
                {
                    bail!(
                        "node '{}': required input '{}' is not connected and has no default",
                        entry.id,
                        port.name
                    );
                }
            }
        }

        let has_cycle = detect_cycle(nodes.len(), &edges);
        if has_cycle {
            tracing::warn!(
                nodes = nodes.len(),
                "Workspace contains a feedback loop; nodes on it re-fire for as long as values circulate"
            );
        }

        Ok(Workspace {
            nodes,
            edges,
            ids,
            has_cycle,
        })
    }
}

fn compile_node(pending: PendingNode) -> Result<NodeEntry> {
    let inputs = pending.node.input_ports();
    let outputs = pending.node.output_ports();

    let defaults = inputs
        .iter()
        .map(|port| {
            if port.kind == PortKind::Control {
                return Ok(None);
            }
            let configured = pending
                .params
                .get(&port.name)
                .or(port.default_value.as_ref());
            match configured {
                None => Ok(None),
                Some(value) => port_data_from_json(&port.port_type, value)
                    .map(Some)
                    .with_context(|| {
                        format!(
                            "node '{}': invalid value for input '{}'",
                            pending.id, port.name
                        )
                    }),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NodeEntry {
        id: pending.id,
        node: pending.node,
        inbound: vec![None; inputs.len()],
        outbound: vec![None; outputs.len()],
        inputs,
        outputs,
        defaults,
    })
}

fn bind(
    nodes: &mut [NodeEntry],
    edges: &mut Vec<Edge>,
    ids: &HashMap<String, NodeIdx>,
    connection: &PendingConnection,
) -> Result<()> {
    let from = ids
        .get(&connection.from_node)
        .copied()
        .ok_or_else(|| anyhow!("unknown source node id: {}", connection.from_node))?;
    let to = ids
        .get(&connection.to_node)
        .copied()
        .ok_or_else(|| anyhow!("unknown target node id: {}", connection.to_node))?;

    let out_idx = nodes[from].output_index(&connection.from_port).ok_or_else(|| {
        anyhow!(
            "node '{}' has no output port '{}'",
            connection.from_node,
            connection.from_port
        )
    })?;
    let in_idx = nodes[to].input_index(&connection.to_port).ok_or_else(|| {
        anyhow!(
            "node '{}' has no input port '{}'",
            connection.to_node,
            connection.to_port
        )
    })?;

    let source_port = &nodes[from].outputs[out_idx];
    let target_port = &nodes[to].inputs[in_idx];
    let label = format!(
        "{}.{} -> {}.{}",
        connection.from_node, connection.from_port, connection.to_node, connection.to_port
    );

    if source_port.kind != target_port.kind {
        bail!(
            "connection {label}: cannot bind {:?} output to {:?} input",
            source_port.kind,
            target_port.kind
        );
    }
    if let Some(declared) = connection.kind {
        if declared != source_port.kind {
            bail!(
                "connection {label}: declared as {declared:?} but the ports are {:?}",
                source_port.kind
            );
        }
    }
    if source_port.kind == PortKind::Data && !target_port.port_type.accepts(&source_port.port_type)
    {
        bail!(
            "connection {label}: type mismatch ({} -> {})",
            source_port.port_type.name(),
            target_port.port_type.name()
        );
    }
    if nodes[to].inbound[in_idx].is_some() {
        bail!(
            "connection {label}: input '{}' already has an inbound connection",
            connection.to_port
        );
    }

    let kind = source_port.kind;
    let destination = PortRef {
        node: to,
        port: in_idx,
    };

    let edge_idx = match nodes[from].outbound[out_idx] {
        Some(existing) => {
            edges[existing].destinations.push(destination);
            existing
        }
        None => {
            edges.push(Edge {
                source: PortRef {
                    node: from,
                    port: out_idx,
                },
                destinations: vec![destination],
                kind,
            });
            let created = edges.len() - 1;
            nodes[from].outbound[out_idx] = Some(created);
            created
        }
    };
    nodes[to].inbound[in_idx] = Some(edge_idx);

    Ok(())
}

fn detect_cycle(node_count: usize, edges: &[Edge]) -> bool {
    let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(node_count, edges.len());
    let indices: Vec<_> = (0..node_count).map(|_| graph.add_node(())).collect();
    for edge in edges {
        for destination in &edge.destinations {
            graph.add_edge(indices[edge.source.node], indices[destination.node], ());
        }
    }
    is_cyclic_directed(&graph)
}
