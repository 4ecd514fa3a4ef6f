use std::collections::HashMap;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::node::{FireContext, Node, PortDefinition};
use crate::types::{PortData, PortType};

const PREVIEW_CHARS: usize = 120;

pub struct PrintNode;

impl PrintNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PrintNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for PrintNode {
    fn node_type(&self) -> &str {
        "Print"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value", PortType::Any)]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value", PortType::Any)]
    }

    fn fire(
        &self,
        inputs: &HashMap<String, PortData>,
        ctx: &FireContext<'_>,
    ) -> Result<HashMap<String, PortData>> {
        let value = inputs
            .get("value")
            .ok_or_else(|| anyhow!("Print: input 'value' is required"))?;

        info!(
            node_id = ctx.node_id(),
            value_type = value.port_type().name(),
            "{}",
            value.preview(PREVIEW_CHARS)
        );

        Ok(HashMap::from([("value".to_string(), value.clone())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ProgressCell;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_print_passes_value_through() {
        let node = PrintNode::new();
        let stop = CancellationToken::new();
        let progress = ProgressCell::default();
        let emit = |_: &str, _: PortData| Ok(());
        let ctx = FireContext::new("print", &stop, &progress, &emit);

        let inputs = HashMap::from([("value".to_string(), PortData::Bool(true))]);
        let outputs = node.fire(&inputs, &ctx).expect("print should fire");

        assert_eq!(outputs.get("value"), Some(&PortData::Bool(true)));
    }
}
