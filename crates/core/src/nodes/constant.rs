//! Constant node: emits one configured value with a parameter-selected port type.
//!
//! The `type` parameter picks the output type (Int, Float, Str, Bool, Bytes, Any,
//! default Str). The `value` parameter becomes the default of the node's only
//! input, so a wire into `value` overrides the configured constant.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

use crate::node::{FireContext, Node, PortDefinition};
use crate::types::{PortData, PortType};

pub struct ConstantNode {
    output_type: PortType,
}

impl ConstantNode {
    pub fn new(output_type: PortType) -> Self {
        Self { output_type }
    }

    pub fn from_params(params: &HashMap<String, serde_json::Value>) -> Result<Self> {
        let output_type = parse_param_type(params)?.unwrap_or(PortType::Str);
        Ok(Self { output_type })
    }
}

impl Default for ConstantNode {
    fn default() -> Self {
        Self::new(PortType::Str)
    }
}

impl Node for ConstantNode {
    fn node_type(&self) -> &str {
        "Constant"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional(
            "value",
            self.output_type,
            default_for(self.output_type),
        )]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value", self.output_type)]
    }

    fn fire(
        &self,
        inputs: &HashMap<String, PortData>,
        _ctx: &FireContext<'_>,
    ) -> Result<HashMap<String, PortData>> {
        let value = inputs
            .get("value")
            .cloned()
            .ok_or_else(|| anyhow!("Constant: input 'value' is missing"))?;

        Ok(HashMap::from([("value".to_string(), value)]))
    }
}

fn parse_param_type(params: &HashMap<String, serde_json::Value>) -> Result<Option<PortType>> {
    let Some(value) = params.get("type") else {
        return Ok(None);
    };

    let Some(raw) = value.as_str() else {
        bail!("Constant: param 'type' must be a string type name (Int|Float|Str|Bool|Bytes|Any)");
    };

    PortType::parse(raw)
        .map(Some)
        .map_err(|err| anyhow!("Constant: {err}"))
}

fn default_for(port_type: PortType) -> serde_json::Value {
    match port_type {
        PortType::Int => serde_json::json!(0),
        PortType::Float => serde_json::json!(0.0),
        PortType::Bool => serde_json::json!(false),
        PortType::Bytes => serde_json::json!([]),
        PortType::Str | PortType::Any => serde_json::json!(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ProgressCell;
    use tokio_util::sync::CancellationToken;

    fn fire(node: &ConstantNode, inputs: HashMap<String, PortData>) -> Result<HashMap<String, PortData>> {
        let stop = CancellationToken::new();
        let progress = ProgressCell::default();
        let emit = |_: &str, _: PortData| Ok(());
        let ctx = FireContext::new("constant", &stop, &progress, &emit);
        node.fire(&inputs, &ctx)
    }

    #[test]
    fn test_constant_default_is_str() {
        let node = ConstantNode::default();
        assert_eq!(node.node_type(), "Constant");
        assert_eq!(node.output_ports()[0].port_type, PortType::Str);
        assert_eq!(node.input_ports()[0].default_value, Some(serde_json::json!("")));
    }

    #[test]
    fn test_constant_from_params_sets_output_type() {
        let params = HashMap::from([("type".to_string(), serde_json::json!("Int"))]);
        let node = ConstantNode::from_params(&params).expect("params should initialize Constant");

        assert_eq!(node.output_ports()[0].port_type, PortType::Int);
        assert_eq!(node.input_ports()[0].default_value, Some(serde_json::json!(0)));
    }

    #[test]
    fn test_constant_from_params_rejects_non_string_type() {
        let params = HashMap::from([("type".to_string(), serde_json::json!(3))]);
        let err = match ConstantNode::from_params(&params) {
            Ok(_) => panic!("numeric params.type should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().starts_with("Constant: param 'type' must be a string"));
    }

    #[test]
    fn test_constant_fire_passes_value_through() {
        let node = ConstantNode::new(PortType::Int);
        let outputs = fire(
            &node,
            HashMap::from([("value".to_string(), PortData::Int(42))]),
        )
        .expect("constant should fire");

        assert_eq!(outputs.get("value"), Some(&PortData::Int(42)));
    }

    #[test]
    fn test_constant_fire_without_value_errors() {
        let node = ConstantNode::default();
        let err = fire(&node, HashMap::new()).expect_err("missing value should error");
        assert_eq!(err.to_string(), "Constant: input 'value' is missing");
    }
}
