//! Thread-per-node scheduler.
//!
//! An [`Engine`] drives one run of a [`Workspace`] at a time. Each run owns a
//! fresh [`RunState`]: node states, input slots, gates, counters. Workers and
//! the progress aggregator only ever hold an `Arc` to their own run, so a worker
//! detached by `stop` can never touch a later run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::failure::{isolate, FailureKind, NodeFailure};
use crate::node::{NodeState, ProgressCell};
use crate::progress::{aggregate_progress, spawn_aggregator, AggregatorHandle, ViewTracker};
use crate::propagation::InputBank;
use crate::types::PortData;
use crate::view::{LogQueue, NoopViewSink, Severity, ViewSink};
use crate::worker::{spawn_worker, Gate, WorkerHandle};
use crate::workspace::{NodeIdx, Workspace};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of [`Engine::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub run_id: Option<Uuid>,
    /// Nodes whose worker did not exit within the stop timeout.
    pub detached_workers: Vec<String>,
    /// Every per-node failure recorded during the run, in order.
    pub failures: Vec<NodeFailure>,
}

pub(crate) struct NodeRuntime {
    state: AtomicU8,
    pub(crate) progress: ProgressCell,
    pub(crate) stop: CancellationToken,
    inputs: Mutex<InputBank>,
    /// Signalled whenever a firing takes values out of `inputs`.
    drained: Condvar,
    pub(crate) gate: Gate,
    pub(crate) fire_count: AtomicU64,
    outputs: Mutex<HashMap<String, PortData>>,
}

impl NodeRuntime {
    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn lock_inputs(&self) -> MutexGuard<'_, InputBank> {
        lock(&self.inputs)
    }

    pub(crate) fn wait_drained<'a>(
        &self,
        bank: MutexGuard<'a, InputBank>,
        timeout: Duration,
    ) -> MutexGuard<'a, InputBank> {
        match self.drained.wait_timeout(bank, timeout) {
            Ok((bank, _)) => bank,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub(crate) fn notify_drained(&self) {
        let _bank = self.lock_inputs();
        self.drained.notify_all();
    }

    pub(crate) fn record_output(&self, port: &str, value: PortData) {
        lock(&self.outputs).insert(port.to_string(), value);
    }

    fn output(&self, port: &str) -> Option<PortData> {
        lock(&self.outputs).get(port).cloned()
    }
}

pub(crate) struct EdgeRuntime {
    pub(crate) active: AtomicBool,
}

#[derive(Default)]
struct ActivityState {
    in_flight: usize,
    closed: bool,
}

/// Number of nodes released or executing. Drains to zero when nothing can
/// make progress.
#[derive(Default)]
pub(crate) struct Activity {
    state: Mutex<ActivityState>,
    idle: Condvar,
}

impl Activity {
    pub(crate) fn begin(&self) {
        lock(&self.state).in_flight += 1;
    }

    pub(crate) fn end(&self) {
        let mut state = lock(&self.state);
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn in_flight(&self) -> usize {
        lock(&self.state).in_flight
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.idle.notify_all();
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = lock(&self.state);
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |state| state.in_flight > 0 && !state.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.in_flight == 0 || guard.closed
    }
}

/// Everything scoped to one execution of a workspace.
pub(crate) struct RunState {
    pub(crate) run_id: Uuid,
    pub(crate) workspace: Arc<Workspace>,
    pub(crate) config: EngineConfig,
    pub(crate) update_views: bool,
    pub(crate) sink: Arc<dyn ViewSink>,
    cancel: CancellationToken,
    stopping: AtomicBool,
    pub(crate) nodes: Vec<NodeRuntime>,
    pub(crate) edges: Vec<EdgeRuntime>,
    pub(crate) activity: Activity,
    /// Firings since the last benchmark window; the aggregator resets it.
    pub(crate) firings: AtomicU64,
    pub(crate) logs: LogQueue,
    failures: Mutex<Vec<NodeFailure>>,
}

impl RunState {
    fn new(
        workspace: Arc<Workspace>,
        config: EngineConfig,
        update_views: bool,
        sink: Arc<dyn ViewSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let nodes = workspace
            .nodes()
            .map(|(_, entry)| NodeRuntime {
                state: AtomicU8::new(NodeState::Idle as u8),
                progress: ProgressCell::default(),
                stop: cancel.child_token(),
                inputs: Mutex::new(InputBank::new(entry)),
                drained: Condvar::new(),
                gate: Gate::default(),
                fire_count: AtomicU64::new(0),
                outputs: Mutex::new(HashMap::new()),
            })
            .collect();
        let edges = workspace
            .edges()
            .iter()
            .map(|_| EdgeRuntime {
                active: AtomicBool::new(false),
            })
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            workspace,
            config,
            update_views,
            sink,
            cancel,
            stopping: AtomicBool::new(false),
            nodes,
            edges,
            activity: Activity::default(),
            firings: AtomicU64::new(0),
            logs: LogQueue::default(),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn node_state(&self, idx: NodeIdx) -> NodeState {
        self.nodes[idx].state()
    }

    pub(crate) fn set_state(&self, idx: NodeIdx, state: NodeState) {
        self.nodes[idx].state.store(state as u8, Ordering::Release);
    }

    /// Wake the node's worker unless it is already pending, terminal, or the
    /// run is stopping. A finished node goes back to waiting.
    pub(crate) fn release(&self, idx: NodeIdx) {
        if self.is_stopping() {
            return;
        }
        let node = &self.nodes[idx];
        if node.state().is_terminal() {
            return;
        }
        let _ = node.state.compare_exchange(
            NodeState::Finished as u8,
            NodeState::WaitingForInputs as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        node.gate.open(|| self.activity.begin());
    }

    pub(crate) fn mark_inbound_inactive(&self, idx: NodeIdx) {
        for edge_idx in self.workspace.node(idx).inbound.iter().flatten() {
            self.edges[*edge_idx].active.store(false, Ordering::Release);
        }
    }

    /// Put the node into Error and record the failure.
    pub(crate) fn record_failure(&self, idx: NodeIdx, kind: FailureKind, message: String) {
        self.set_state(idx, NodeState::Error);
        let failure = NodeFailure::new(&self.workspace.node(idx).id, kind, message);
        self.note_failure(failure);
    }

    fn note_failure(&self, failure: NodeFailure) {
        tracing::error!(
            run_id = %self.run_id,
            node = %failure.node_id,
            kind = %failure.kind,
            error = %failure.message,
            "Node failed"
        );
        self.logs
            .push(&failure.node_id, failure.to_string(), Severity::Error);
        lock(&self.failures).push(failure);
    }

    pub(crate) fn failures(&self) -> Vec<NodeFailure> {
        lock(&self.failures).clone()
    }

    /// Mean progress of every node that is not slaved to a controlling node.
    pub(crate) fn aggregate_progress(&self) -> f64 {
        aggregate_progress(
            self.workspace
                .nodes()
                .filter(|(_, entry)| !entry.is_control_dependent())
                .map(|(idx, _)| self.nodes[idx].progress.get()),
        )
    }

    fn begin_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cancel.cancel();
        self.activity.close();
        for node in &self.nodes {
            node.gate.wake_all();
            node.notify_drained();
        }
    }
}

struct ActiveRun {
    run: Arc<RunState>,
    workers: Vec<WorkerHandle>,
    aggregator: Option<AggregatorHandle>,
}

#[derive(Default)]
struct EngineSlot {
    active: Option<ActiveRun>,
    last: Option<Arc<RunState>>,
}

pub struct Engine {
    config: EngineConfig,
    sink: Arc<dyn ViewSink>,
    slot: Mutex<EngineSlot>,
}

impl Engine {
    pub fn new(config: EngineConfig, sink: Arc<dyn ViewSink>) -> Self {
        Self {
            config,
            sink,
            slot: Mutex::new(EngineSlot::default()),
        }
    }

    /// An engine without a view.
    pub fn headless(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(NoopViewSink))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run: reset run state, invoke pre-run hooks, spawn one worker per
    /// node and release every node whose inputs are already satisfied.
    ///
    /// Fails only when a run is still active or a thread cannot be spawned.
    /// Node hook failures never surface here; they put that node into Error.
    pub fn execute(&self, workspace: Arc<Workspace>, update_views: bool) -> Result<()> {
        let mut slot = lock(&self.slot);
        if slot.active.is_some() {
            tracing::warn!("Execute rejected: a workspace run is still active");
            bail!("cannot execute: a workspace run is still active; stop it first");
        }

        let run = Arc::new(RunState::new(
            workspace,
            self.config.clone(),
            update_views,
            self.sink.clone(),
        ));
        let node_count = run.workspace.node_count();
        tracing::info!(
            run_id = %run.run_id,
            nodes = node_count,
            edges = run.workspace.edges().len(),
            update_views,
            thread_priority = ?self.config.thread_priority,
            "Starting workspace execution"
        );

        let aggregator = spawn_aggregator(run.clone()).context("failed to spawn progress aggregator")?;

        for (idx, entry) in run.workspace.nodes() {
            if let Err(message) = isolate(|| entry.node.pre_run()) {
                run.record_failure(idx, FailureKind::PreRun, message);
            }
        }
        for idx in 0..node_count {
            if run.node_state(idx) != NodeState::Error {
                run.set_state(idx, NodeState::WaitingForInputs);
            }
        }

        let mut workers = Vec::with_capacity(node_count);
        for idx in 0..node_count {
            match spawn_worker(run.clone(), idx) {
                Ok(worker) => workers.push(worker),
                Err(error) => {
                    let node_id = run.workspace.node(idx).id.clone();
                    tracing::error!(
                        run_id = %run.run_id,
                        node = %node_id,
                        error = %error,
                        "Failed to spawn node worker; aborting run"
                    );
                    slot.last = Some(run.clone());
                    drop(slot);
                    self.shutdown_run(ActiveRun {
                        run,
                        workers,
                        aggregator: Some(aggregator),
                    });
                    return Err(error)
                        .with_context(|| format!("failed to spawn worker for node '{node_id}'"));
                }
            }
        }

        for idx in 0..node_count {
            let satisfied = run.nodes[idx].lock_inputs().is_satisfied();
            if satisfied {
                run.release(idx);
            }
        }

        slot.last = Some(run.clone());
        slot.active = Some(ActiveRun {
            run,
            workers,
            aggregator: Some(aggregator),
        });
        Ok(())
    }

    /// Stop the active run. Always returns, waiting at most the stop timeout
    /// per worker; workers still busy after that are detached.
    pub fn stop(&self) -> StopReport {
        let active = lock(&self.slot).active.take();
        match active {
            Some(active) => self.shutdown_run(active),
            None => {
                tracing::debug!("Stop requested without an active run");
                StopReport::default()
            }
        }
    }

    fn shutdown_run(&self, active: ActiveRun) -> StopReport {
        let ActiveRun {
            run,
            workers,
            aggregator,
        } = active;
        let started = Instant::now();

        run.begin_stop();
        for (idx, entry) in run.workspace.nodes() {
            if let Err(message) = isolate(|| entry.node.stop()) {
                run.record_failure(idx, FailureKind::Stop, message);
            }
        }

        if let Some(aggregator) = aggregator {
            aggregator.shutdown();
        }

        let timeout = self.config.stop_timeout();
        let mut detached_workers = Vec::new();
        for worker in workers {
            if let Some(node_id) = worker.join_within(timeout) {
                tracing::warn!(
                    run_id = %run.run_id,
                    node = %node_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not exit within the stop timeout; detaching it"
                );
                run.note_failure(NodeFailure::new(
                    &node_id,
                    FailureKind::ShutdownTimeout,
                    format!("worker still running after {} ms", timeout.as_millis()),
                ));
                detached_workers.push(node_id);
            }
        }

        for idx in 0..run.workspace.node_count() {
            run.set_state(idx, NodeState::Idle);
        }

        let visible = run.sink.is_active();
        if run.update_views && visible {
            ViewTracker::new(&run.workspace).refresh(&run, true);
            run.sink.on_aggregate_progress(run.aggregate_progress());
        }

        for (idx, entry) in run.workspace.nodes() {
            if let Err(message) = isolate(|| entry.node.post_run()) {
                run.record_failure(idx, FailureKind::PostRun, message);
            }
        }

        if visible {
            run.logs.flush_to(run.sink.as_ref());
        }

        tracing::info!(
            run_id = %run.run_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            detached = detached_workers.len(),
            "Workspace execution stopped"
        );

        StopReport {
            run_id: Some(run.run_id),
            detached_workers,
            failures: run.failures(),
        }
    }

    /// True while a run is active, not stopping, and some node is released or
    /// executing.
    pub fn is_running(&self) -> bool {
        lock(&self.slot).active.as_ref().is_some_and(|active| {
            !active.run.is_stopping() && active.run.activity.in_flight() > 0
        })
    }

    /// Block until the active run drains (or is stopped). Returns false on
    /// timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let run = lock(&self.slot)
            .active
            .as_ref()
            .map(|active| active.run.clone());
        match run {
            Some(run) => run.activity.wait_idle(timeout),
            None => true,
        }
    }

    fn current_run(&self) -> Option<Arc<RunState>> {
        lock(&self.slot).last.clone()
    }

    fn with_node<T>(&self, node_id: &str, read: impl FnOnce(&RunState, NodeIdx) -> T) -> Option<T> {
        let run = self.current_run()?;
        let idx = run.workspace.index_of(node_id)?;
        Some(read(&run, idx))
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.current_run().map(|run| run.run_id)
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.with_node(node_id, |run, idx| run.node_state(idx))
    }

    pub fn node_progress(&self, node_id: &str) -> Option<f64> {
        self.with_node(node_id, |run, idx| run.nodes[idx].progress.get())
    }

    pub fn fire_count(&self, node_id: &str) -> Option<u64> {
        self.with_node(node_id, |run, idx| {
            run.nodes[idx].fire_count.load(Ordering::Relaxed)
        })
    }

    /// Latest value written to an output port during the current (or last) run.
    pub fn output_value(&self, node_id: &str, port: &str) -> Option<PortData> {
        self.with_node(node_id, |run, idx| run.nodes[idx].output(port))
            .flatten()
    }

    /// Value an input handed to the node's last firing, or its default.
    pub fn input_value(&self, node_id: &str, port: &str) -> Option<PortData> {
        self.with_node(node_id, |run, idx| {
            let input = run.workspace.node(idx).input_index(port)?;
            run.nodes[idx].lock_inputs().value(input).cloned()
        })
        .flatten()
    }

    /// All outputs of every node, keyed by node id then port.
    pub fn outputs(&self) -> HashMap<String, HashMap<String, PortData>> {
        let Some(run) = self.current_run() else {
            return HashMap::new();
        };
        run.workspace
            .nodes()
            .map(|(idx, entry)| (entry.id.clone(), lock(&run.nodes[idx].outputs).clone()))
            .collect()
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.current_run()
            .map(|run| run.failures())
            .unwrap_or_default()
    }

    pub fn aggregate_progress(&self) -> Option<f64> {
        self.current_run().map(|run| run.aggregate_progress())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let active = lock(&self.slot).active.take();
        if let Some(active) = active {
            self.shutdown_run(active);
        }
    }
}
