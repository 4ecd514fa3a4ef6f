//! Port slots and value propagation along edges.
//!
//! Each node owns one [`InputBank`] behind a mutex. Every data slot buffers
//! the values delivered to it in arrival order and a firing takes at most one
//! value per slot, so nothing a producer emits is lost. Propagation blocks
//! while the destination slot is full, and a node does not fire while one of
//! its consumers still holds unconsumed data.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::engine::RunState;
use crate::node::PortKind;
use crate::types::{coerce, PortData, PortType};
use crate::workspace::{NodeEntry, NodeIdx};

/// Upper bound on one wait for room, so stop is noticed without a wakeup.
const ROOM_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct InputSlot {
    pub name: String,
    pub port_type: PortType,
    pub kind: PortKind,
    /// Value handed to the last firing, initially the configured default.
    pub value: Option<PortData>,
    /// Delivered values not yet consumed, oldest first.
    queue: VecDeque<PortData>,
    pub connected: bool,
    /// Data: a value arrived this run. Control: the driver finished once.
    pub received: bool,
    /// Control: a driver signal not yet consumed by a firing.
    signalled: bool,
}

impl InputSlot {
    fn has_pending(&self) -> bool {
        !self.queue.is_empty() || self.signalled
    }
}

/// Input side of one node for one run.
#[derive(Debug, Clone)]
pub struct InputBank {
    slots: Vec<InputSlot>,
    /// A pure source that has not fired yet.
    primed: bool,
}

/// Values handed to one firing, not yet converted to the port types.
#[derive(Debug)]
pub struct InputSnapshot {
    values: Vec<(String, PortType, PortData)>,
}

impl InputSnapshot {
    /// Apply the implicit conversions to the consuming port types.
    pub fn into_inputs(self) -> Result<HashMap<String, PortData>> {
        self.values
            .into_iter()
            .map(|(name, port_type, value)| {
                let converted = coerce(value, &port_type)
                    .with_context(|| format!("input '{name}'"))?;
                Ok((name, converted))
            })
            .collect()
    }
}

impl InputBank {
    pub fn new(entry: &NodeEntry) -> Self {
        let slots: Vec<InputSlot> = entry
            .inputs
            .iter()
            .enumerate()
            .map(|(idx, port)| InputSlot {
                name: port.name.clone(),
                port_type: port.port_type,
                kind: port.kind,
                value: entry.defaults[idx].clone(),
                queue: VecDeque::new(),
                connected: entry.inbound[idx].is_some(),
                received: false,
                signalled: false,
            })
            .collect();
        let primed = !slots.iter().any(|slot| slot.connected);

        Self { slots, primed }
    }

    fn slot_mut(&mut self, input: usize) -> Result<&mut InputSlot> {
        self.slots
            .get_mut(input)
            .ok_or_else(|| anyhow!("input index {input} out of range"))
    }

    /// Append a value to the input's queue.
    pub fn store(&mut self, input: usize, value: PortData) -> Result<()> {
        let slot = self.slot_mut(input)?;
        if slot.kind != PortKind::Data {
            bail!("input '{}' is a control port", slot.name);
        }
        slot.queue.push_back(value);
        slot.received = true;
        Ok(())
    }

    pub fn signal_control(&mut self, input: usize) -> Result<()> {
        let slot = self.slot_mut(input)?;
        if slot.kind != PortKind::Control {
            bail!("input '{}' is a data port", slot.name);
        }
        slot.received = true;
        slot.signalled = true;
        Ok(())
    }

    /// Number of values waiting on `input`.
    pub fn queued(&self, input: usize) -> usize {
        self.slots.get(input).map_or(0, |slot| slot.queue.len())
    }

    /// Every connected input has been fed at least once and there is
    /// something new to consume.
    pub fn is_satisfied(&self) -> bool {
        let all_received = self
            .slots
            .iter()
            .filter(|slot| slot.connected)
            .all(|slot| slot.received);

        all_received && (self.primed || self.slots.iter().any(InputSlot::has_pending))
    }

    /// Consume the pending inputs if satisfied: the oldest queued value of
    /// every data slot. Slots with nothing queued keep their last value.
    pub fn take_snapshot(&mut self) -> Option<InputSnapshot> {
        if !self.is_satisfied() {
            return None;
        }

        self.primed = false;
        let mut values = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            slot.signalled = false;
            if slot.kind != PortKind::Data {
                continue;
            }
            if let Some(next) = slot.queue.pop_front() {
                slot.value = Some(next);
            }
            if let Some(value) = &slot.value {
                values.push((slot.name.clone(), slot.port_type, value.clone()));
            }
        }

        Some(InputSnapshot { values })
    }

    pub fn value(&self, input: usize) -> Option<&PortData> {
        self.slots.get(input).and_then(|slot| slot.value.as_ref())
    }
}

impl RunState {
    /// Write an output port of `source`: record it as the node's latest output
    /// and queue it on every bound input, waiting for room where a consumer
    /// is behind.
    pub(crate) fn propagate(&self, source: NodeIdx, port: &str, value: PortData) -> Result<()> {
        let entry = self.workspace.node(source);
        let out_idx = entry
            .output_index(port)
            .ok_or_else(|| anyhow!("node '{}' has no output port '{port}'", entry.id))?;
        if entry.outputs[out_idx].kind != PortKind::Data {
            bail!(
                "output '{port}' of node '{}' is a control port and carries no values",
                entry.id
            );
        }
        if self.is_stopping() {
            return Ok(());
        }

        self.nodes[source].record_output(port, value.clone());

        let Some(edge_idx) = entry.outbound[out_idx] else {
            return Ok(());
        };
        let edge = self.workspace.edge(edge_idx);
        for destination in &edge.destinations {
            let satisfied = {
                let Some(mut bank) = self.lock_with_room(source, destination.node, destination.port)
                else {
                    if self.is_stopping() {
                        return Ok(());
                    }
                    continue;
                };
                bank.store(destination.port, value.clone())?;
                bank.is_satisfied()
            };
            self.edges[edge_idx].active.store(true, Ordering::Release);
            if satisfied {
                self.release(destination.node);
            }
        }

        Ok(())
    }

    /// Lock the input bank of `target` once `input` has room for another
    /// value. `None` when the run is stopping or `target` can no longer
    /// consume. A node feeding itself never waits, since it cannot drain its
    /// own queue mid-fire.
    fn lock_with_room(
        &self,
        source: NodeIdx,
        target: NodeIdx,
        input: usize,
    ) -> Option<MutexGuard<'_, InputBank>> {
        let node = &self.nodes[target];
        let capacity = self.config.input_queue_capacity();
        let mut bank = node.lock_inputs();
        loop {
            if self.is_stopping() || node.state().is_terminal() {
                return None;
            }
            if target == source || bank.queued(input) < capacity {
                return Some(bank);
            }
            bank = node.wait_drained(bank, ROOM_POLL);
        }
    }

    /// No consumer of `idx` still holds a value it has not fired on. Consumers
    /// that can no longer fire, and `idx` itself, do not count.
    pub(crate) fn outputs_free(&self, idx: NodeIdx) -> bool {
        let entry = self.workspace.node(idx);
        entry
            .outbound
            .iter()
            .flatten()
            .map(|edge_idx| self.workspace.edge(*edge_idx))
            .filter(|edge| edge.kind == PortKind::Data)
            .flat_map(|edge| edge.destinations.iter())
            .filter(|destination| destination.node != idx)
            .all(|destination| {
                let node = &self.nodes[destination.node];
                node.state().is_terminal() || node.lock_inputs().queued(destination.port) == 0
            })
    }

    /// A firing of `idx` consumed input: let blocked producers continue and
    /// wake the nodes feeding it that have work waiting.
    pub(crate) fn notify_consumed(&self, idx: NodeIdx) {
        self.nodes[idx].notify_drained();
        for edge_idx in self.workspace.node(idx).inbound.iter().flatten() {
            let feeder = self.workspace.edge(*edge_idx).source.node;
            if feeder == idx {
                continue;
            }
            let satisfied = self.nodes[feeder].lock_inputs().is_satisfied();
            if satisfied {
                self.release(feeder);
            }
        }
    }

    /// A finished firing of `driver` satisfies the control inputs it drives.
    pub(crate) fn signal_control_dependents(&self, driver: NodeIdx) -> Result<()> {
        let entry = self.workspace.node(driver);
        for edge_idx in entry.outbound.iter().flatten() {
            let edge = self.workspace.edge(*edge_idx);
            if edge.kind != PortKind::Control {
                continue;
            }
            for destination in &edge.destinations {
                let satisfied = {
                    let mut bank = self.nodes[destination.node].lock_inputs();
                    bank.signal_control(destination.port)?;
                    bank.is_satisfied()
                };
                self.edges[*edge_idx].active.store(true, Ordering::Release);
                if satisfied {
                    self.release(destination.node);
                }
            }
        }
        Ok(())
    }
}
