use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{PortData, PortType};

/// Whether a port carries values or expresses a scheduling dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    #[default]
    Data,
    Control,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortDefinition {
    pub name: String,
    pub port_type: PortType,
    pub kind: PortKind,
    pub required: bool,
    pub default_value: Option<serde_json::Value>,
}

impl PortDefinition {
    pub fn required(name: &str, port_type: PortType) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            kind: PortKind::Data,
            required: true,
            default_value: None,
        }
    }

    pub fn optional(name: &str, port_type: PortType, default_value: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            kind: PortKind::Data,
            required: false,
            default_value: Some(default_value),
        }
    }

    /// A control port. On the input side it makes the owning node a dependent
    /// of whichever node drives it.
    pub fn control(name: &str) -> Self {
        Self {
            name: name.to_string(),
            port_type: PortType::Any,
            kind: PortKind::Control,
            required: false,
            default_value: None,
        }
    }
}

/// Execution state of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeState {
    Idle = 0,
    WaitingForInputs = 1,
    Executing = 2,
    Finished = 3,
    Error = 4,
    Stopped = 5,
}

impl NodeState {
    pub fn from_u8(raw: u8) -> NodeState {
        match raw {
            1 => NodeState::WaitingForInputs,
            2 => NodeState::Executing,
            3 => NodeState::Finished,
            4 => NodeState::Error,
            5 => NodeState::Stopped,
            _ => NodeState::Idle,
        }
    }

    /// Error and Stopped end a node's participation in the current run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Error | NodeState::Stopped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Idle => "idle",
            NodeState::WaitingForInputs => "waiting",
            NodeState::Executing => "executing",
            NodeState::Finished => "finished",
            NodeState::Error => "error",
            NodeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Completion fraction in [0, 1], shared between a node's worker and the
/// progress aggregator.
#[derive(Debug, Default)]
pub struct ProgressCell {
    bits: AtomicU64,
}

impl ProgressCell {
    pub fn set(&self, fraction: f64) {
        let clamped = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.bits.store(clamped.to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

pub type EmitFn<'a> = dyn Fn(&str, PortData) -> Result<()> + Sync + 'a;

/// Handle passed to [`Node::fire`].
pub struct FireContext<'a> {
    node_id: &'a str,
    stop: &'a CancellationToken,
    progress: &'a ProgressCell,
    emit: &'a EmitFn<'a>,
}

impl<'a> FireContext<'a> {
    pub fn new(
        node_id: &'a str,
        stop: &'a CancellationToken,
        progress: &'a ProgressCell,
        emit: &'a EmitFn<'a>,
    ) -> Self {
        Self {
            node_id,
            stop,
            progress,
            emit,
        }
    }

    pub fn node_id(&self) -> &str {
        self.node_id
    }

    /// Long-running fire hooks are expected to poll this and return early.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn report_progress(&self, fraction: f64) {
        self.progress.set(fraction);
    }

    /// Write an output port while still executing. The value is queued on
    /// every bound input immediately instead of after `fire` returns, and the
    /// call blocks while a consumer's queue is full.
    pub fn emit(&self, port: &str, value: PortData) -> Result<()> {
        (self.emit)(port, value)
    }
}

/// Core node trait that all nodes implement.
///
/// Every hook takes `&self`: the stop hook runs on the thread calling
/// `Engine::stop` while `fire` may still be running on the node's worker.
pub trait Node: Send + Sync {
    fn node_type(&self) -> &str;
    fn input_ports(&self) -> Vec<PortDefinition>;
    fn output_ports(&self) -> Vec<PortDefinition>;

    fn pre_run(&self) -> Result<()> {
        Ok(())
    }

    fn fire(
        &self,
        inputs: &HashMap<String, PortData>,
        ctx: &FireContext<'_>,
    ) -> Result<HashMap<String, PortData>>;

    fn post_run(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_definition_creation() {
        let input = PortDefinition::required("input", PortType::Str);
        let shift = PortDefinition::optional("shift", PortType::Int, serde_json::json!(3));
        let control = PortDefinition::control("master");

        assert_eq!(input.name, "input");
        assert_eq!(input.kind, PortKind::Data);
        assert!(input.required);
        assert!(input.default_value.is_none());

        assert!(!shift.required);
        assert_eq!(shift.default_value, Some(serde_json::json!(3)));

        assert_eq!(control.kind, PortKind::Control);
        assert!(!control.required);
    }

    #[test]
    fn test_node_state_u8_roundtrip() {
        for state in [
            NodeState::Idle,
            NodeState::WaitingForInputs,
            NodeState::Executing,
            NodeState::Finished,
            NodeState::Error,
            NodeState::Stopped,
        ] {
            assert_eq!(NodeState::from_u8(state as u8), state);
        }
        assert!(NodeState::Error.is_terminal());
        assert!(!NodeState::Finished.is_terminal());
    }

    #[test]
    fn test_progress_cell_clamps() {
        let cell = ProgressCell::default();
        assert_eq!(cell.get(), 0.0);
        cell.set(1.7);
        assert_eq!(cell.get(), 1.0);
        cell.set(-0.5);
        assert_eq!(cell.get(), 0.0);
        cell.set(0.25);
        assert_eq!(cell.get(), 0.25);
    }

    #[test]
    fn test_fire_context_forwards_emit_and_stop() {
        let stop = CancellationToken::new();
        let progress = ProgressCell::default();
        let emitted = std::sync::Mutex::new(Vec::new());
        let emit = |port: &str, value: PortData| {
            emitted
                .lock()
                .expect("emit log lock")
                .push((port.to_string(), value));
            Ok(())
        };
        let ctx = FireContext::new("n1", &stop, &progress, &emit);

        ctx.emit("out", PortData::Int(1)).expect("emit should succeed");
        ctx.report_progress(0.5);
        assert!(!ctx.is_stop_requested());
        stop.cancel();

        assert!(ctx.is_stop_requested());
        assert_eq!(ctx.node_id(), "n1");
        assert_eq!(progress.get(), 0.5);
        assert_eq!(
            emitted.lock().expect("emit log lock").as_slice(),
            &[("out".to_string(), PortData::Int(1))]
        );
    }
}
