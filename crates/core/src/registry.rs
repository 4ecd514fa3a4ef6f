//! Lookup from node type names to factories that build a node from its params.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::node::Node;

pub type NodeParams = HashMap<String, serde_json::Value>;

type NodeFactory = dyn Fn(&NodeParams) -> Result<Arc<dyn Node>> + Send + Sync;

#[derive(Default)]
pub struct NodeRegistry {
    factories: BTreeMap<String, Box<NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `node_type`. A later registration replaces an
    /// earlier one.
    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(&NodeParams) -> Result<Arc<dyn Node>> + Send + Sync + 'static,
    {
        if self
            .factories
            .insert(node_type.to_string(), Box::new(factory))
            .is_some()
        {
            tracing::warn!(node_type, "Node factory replaced");
        }
    }

    pub fn create(&self, node_type: &str, params: &NodeParams) -> Result<Arc<dyn Node>> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| anyhow!("unknown node type: {node_type}"))?;
        factory(params)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Registered type names in sorted order.
    pub fn list_node_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Register the demonstration nodes shipped with the crate.
pub fn register_builtin_nodes(registry: &mut NodeRegistry) {
    use crate::nodes::concat::ConcatNode;
    use crate::nodes::constant::ConstantNode;
    use crate::nodes::counter::CounterNode;
    use crate::nodes::print::PrintNode;

    registry.register("Constant", |params| {
        Ok(Arc::new(ConstantNode::from_params(params)?))
    });
    registry.register("Concat", |params| Ok(Arc::new(ConcatNode::from_params(params))));
    registry.register("Counter", |params| {
        Ok(Arc::new(CounterNode::from_params(params)?))
    });
    registry.register("Print", |_params| Ok(Arc::new(PrintNode::new())));
}

pub fn build_default_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtin_nodes(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FireContext, PortDefinition};
    use crate::types::{PortData, PortType};

    struct DummyNode;

    impl Node for DummyNode {
        fn node_type(&self) -> &str {
            "dummy"
        }

        fn input_ports(&self) -> Vec<PortDefinition> {
            vec![PortDefinition::required("in", PortType::Str)]
        }

        fn output_ports(&self) -> Vec<PortDefinition> {
            vec![PortDefinition::required("out", PortType::Str)]
        }

        fn fire(
            &self,
            _inputs: &HashMap<String, PortData>,
            _ctx: &FireContext<'_>,
        ) -> Result<HashMap<String, PortData>> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn test_node_registry_register_and_create() {
        let mut registry = NodeRegistry::new();
        registry.register("dummy", |_| Ok(Arc::new(DummyNode)));

        let node = registry
            .create("dummy", &HashMap::new())
            .expect("dummy node should be created");

        assert_eq!(node.node_type(), "dummy");
        assert_eq!(node.input_ports().len(), 1);
        assert_eq!(node.output_ports().len(), 1);
        assert!(registry.contains("dummy"));
        assert_eq!(registry.list_node_types(), vec!["dummy"]);
    }

    #[test]
    fn test_later_registration_replaces_factory() {
        let mut registry = build_default_registry();
        registry.register("Print", |_| Ok(Arc::new(DummyNode)));

        let node = registry
            .create("Print", &HashMap::new())
            .expect("replacement factory should be used");
        assert_eq!(node.node_type(), "dummy");
        assert_eq!(registry.list_node_types().len(), 4);
    }

    #[test]
    fn test_node_registry_unknown_type_errors() {
        let registry = NodeRegistry::new();

        let err = match registry.create("Enigma", &HashMap::new()) {
            Ok(_) => panic!("unknown node type should error"),
            Err(err) => err,
        };

        assert_eq!(err.to_string(), "unknown node type: Enigma");
    }

    #[test]
    fn test_register_builtin_nodes_expected_set() {
        let registry = build_default_registry();

        assert_eq!(
            registry.list_node_types(),
            vec!["Concat", "Constant", "Counter", "Print"]
        );
    }

    #[test]
    fn test_constant_factory_rejects_invalid_type_param() {
        let registry = build_default_registry();
        let params = HashMap::from([("type".to_string(), serde_json::json!("Frames"))]);

        let err = match registry.create("Constant", &params) {
            Ok(_) => panic!("invalid constant type should fail"),
            Err(err) => err,
        };

        assert!(err.to_string().contains("Constant: unsupported port type 'Frames'"));
    }
}
