use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::node::{FireContext, Node, PortDefinition};
use crate::types::{PortData, PortType};

/// Joins two strings, optionally with a separator taken from the `separator`
/// parameter.
pub struct ConcatNode {
    separator: String,
}

impl ConcatNode {
    pub fn new() -> Self {
        Self {
            separator: String::new(),
        }
    }

    pub fn from_params(params: &HashMap<String, serde_json::Value>) -> Self {
        let separator = params
            .get("separator")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        Self { separator }
    }
}

impl Default for ConcatNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for ConcatNode {
    fn node_type(&self) -> &str {
        "Concat"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("a", PortType::Str),
            PortDefinition::required("b", PortType::Str),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value", PortType::Str)]
    }

    fn fire(
        &self,
        inputs: &HashMap<String, PortData>,
        _ctx: &FireContext<'_>,
    ) -> Result<HashMap<String, PortData>> {
        let a = read_str(inputs, "a")?;
        let b = read_str(inputs, "b")?;

        Ok(HashMap::from([(
            "value".to_string(),
            PortData::Str(format!("{a}{}{b}", self.separator)),
        )]))
    }
}

fn read_str<'a>(inputs: &'a HashMap<String, PortData>, port: &str) -> Result<&'a str> {
    inputs
        .get(port)
        .and_then(PortData::as_str)
        .ok_or_else(|| anyhow!("Concat: input '{port}' must be Str"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ProgressCell;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_concat_joins_with_separator() {
        let params = HashMap::from([("separator".to_string(), serde_json::json!("-"))]);
        let node = ConcatNode::from_params(&params);
        let stop = CancellationToken::new();
        let progress = ProgressCell::default();
        let emit = |_: &str, _: PortData| Ok(());
        let ctx = FireContext::new("concat", &stop, &progress, &emit);

        let inputs = HashMap::from([
            ("a".to_string(), PortData::Str("X".to_string())),
            ("b".to_string(), PortData::Str("Y".to_string())),
        ]);
        let outputs = node.fire(&inputs, &ctx).expect("concat should fire");

        assert_eq!(outputs.get("value"), Some(&PortData::Str("X-Y".to_string())));
    }

    #[test]
    fn test_concat_rejects_non_string_input() {
        let node = ConcatNode::new();
        let stop = CancellationToken::new();
        let progress = ProgressCell::default();
        let emit = |_: &str, _: PortData| Ok(());
        let ctx = FireContext::new("concat", &stop, &progress, &emit);

        let inputs = HashMap::from([
            ("a".to_string(), PortData::Int(1)),
            ("b".to_string(), PortData::Str("Y".to_string())),
        ]);
        let err = node.fire(&inputs, &ctx).expect_err("int input should fail");

        assert_eq!(err.to_string(), "Concat: input 'a' must be Str");
    }
}
