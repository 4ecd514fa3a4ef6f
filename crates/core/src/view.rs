//! View notifications emitted while a workspace runs.
//!
//! The engine calls a [`ViewSink`] only from the progress aggregator thread
//! while running and from the `Engine::stop` caller afterwards. Workers never
//! touch the sink directly: their log lines go through a [`LogQueue`] that the
//! aggregator drains on every tick.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::node::NodeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Whether an edge carried a value since its destination last fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeActivity {
    pub from_node: String,
    pub from_port: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub node_id: String,
    pub message: String,
    pub severity: Severity,
}

pub trait ViewSink: Send + Sync {
    fn on_node_state_changed(&self, _node_id: &str, _state: NodeState, _progress: f64) {}

    fn on_edge_activity(&self, _activity: &EdgeActivity) {}

    fn on_aggregate_progress(&self, _fraction: f64) {}

    /// Firings counted during the last benchmark window (one second).
    fn on_benchmark(&self, _firings_per_second: u64) {}

    fn on_log_message(&self, _message: &LogMessage) {}

    /// While false the engine makes no other call on this sink. Benchmark
    /// windows still roll over and node log lines stay queued.
    fn is_active(&self) -> bool {
        true
    }
}

pub struct NoopViewSink;

impl ViewSink for NoopViewSink {}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    NodeState {
        node_id: String,
        state: NodeState,
        progress: f64,
    },
    EdgeActivity(EdgeActivity),
    AggregateProgress(f64),
    Benchmark(u64),
    Log(LogMessage),
}

/// Forwards every notification as a [`ViewEvent`] over an unbounded channel.
/// It goes inactive once the receiver is dropped.
pub struct ChannelViewSink {
    tx: UnboundedSender<ViewEvent>,
}

impl ChannelViewSink {
    pub fn new() -> (Self, UnboundedReceiver<ViewEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ViewEvent) {
        let _ = self.tx.send(event);
    }
}

impl ViewSink for ChannelViewSink {
    fn on_node_state_changed(&self, node_id: &str, state: NodeState, progress: f64) {
        self.send(ViewEvent::NodeState {
            node_id: node_id.to_string(),
            state,
            progress,
        });
    }

    fn on_edge_activity(&self, activity: &EdgeActivity) {
        self.send(ViewEvent::EdgeActivity(activity.clone()));
    }

    fn on_aggregate_progress(&self, fraction: f64) {
        self.send(ViewEvent::AggregateProgress(fraction));
    }

    fn on_benchmark(&self, firings_per_second: u64) {
        self.send(ViewEvent::Benchmark(firings_per_second));
    }

    fn on_log_message(&self, message: &LogMessage) {
        self.send(ViewEvent::Log(message.clone()));
    }

    fn is_active(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Node log lines waiting to be handed to the view sink.
#[derive(Debug, Default)]
pub struct LogQueue {
    pending: Mutex<Vec<LogMessage>>,
}

impl LogQueue {
    pub fn push(&self, node_id: &str, message: impl Into<String>, severity: Severity) {
        let entry = LogMessage {
            node_id: node_id.to_string(),
            message: message.into(),
            severity,
        };
        match self.pending.lock() {
            Ok(mut pending) => pending.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    pub fn drain(&self) -> Vec<LogMessage> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn flush_to(&self, sink: &dyn ViewSink) {
        for message in self.drain() {
            sink.on_log_message(&message);
        }
    }
}
