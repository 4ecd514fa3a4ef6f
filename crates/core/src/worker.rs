use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::engine::{lock, RunState};
use crate::failure::{isolate, FailureKind};
use crate::node::{FireContext, NodeState};
use crate::types::PortData;
use crate::workspace::NodeIdx;

const DELAY_SLICE: Duration = Duration::from_millis(10);

pub(crate) enum Wake {
    Released,
    Shutdown,
}

/// Per-node wait condition. A pending release is a single flag, so a node is
/// never queued twice.
#[derive(Default)]
pub(crate) struct Gate {
    pending: Mutex<bool>,
    wake: Condvar,
}

impl Gate {
    /// Mark the node pending. `on_open` runs under the gate lock, and only
    /// when the flag actually flips.
    pub(crate) fn open(&self, on_open: impl FnOnce()) {
        let mut pending = lock(&self.pending);
        if !*pending {
            *pending = true;
            on_open();
            self.wake.notify_one();
        }
    }

    pub(crate) fn wait(&self, stop: &CancellationToken) -> Wake {
        let mut pending = lock(&self.pending);
        loop {
            if *pending {
                *pending = false;
                return Wake::Released;
            }
            if stop.is_cancelled() {
                return Wake::Shutdown;
            }
            pending = self
                .wake
                .wait(pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub(crate) fn wake_all(&self) {
        let _pending = lock(&self.pending);
        self.wake.notify_all();
    }
}

/// Set once the worker thread has left its loop, panicking or not.
#[derive(Default)]
struct Latch {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Latch {
    fn set(&self) {
        *lock(&self.done) = true;
        self.signal.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.done);
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

struct LatchGuard(Arc<Latch>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

pub(crate) struct WorkerHandle {
    node_id: String,
    handle: JoinHandle<()>,
    done: Arc<Latch>,
}

impl WorkerHandle {
    /// Join the worker if it exits within `timeout`. Otherwise the thread is
    /// detached and its node id returned.
    pub(crate) fn join_within(self, timeout: Duration) -> Option<String> {
        if !self.done.wait_timeout(timeout) {
            return Some(self.node_id);
        }
        if self.handle.join().is_err() {
            tracing::warn!(node = %self.node_id, "Worker thread panicked outside a node hook");
        }
        None
    }
}

pub(crate) fn spawn_worker(run: Arc<RunState>, idx: NodeIdx) -> io::Result<WorkerHandle> {
    let node_id = run.workspace.node(idx).id.clone();
    let done = Arc::new(Latch::default());
    let guard = LatchGuard(done.clone());

    let handle = thread::Builder::new()
        .name(format!("nodeflow-worker-{node_id}"))
        .spawn(move || {
            let _guard = guard;
            run_worker(&run, idx);
        })?;

    Ok(WorkerHandle {
        node_id,
        handle,
        done,
    })
}

fn run_worker(run: &RunState, idx: NodeIdx) {
    let node = &run.nodes[idx];
    loop {
        match node.gate.wait(&node.stop) {
            Wake::Released => {
                fire_once(run, idx);
                run.activity.end();
            }
            Wake::Shutdown => break,
        }
    }
    tracing::trace!(node = %run.workspace.node(idx).id, "Worker exited");
}

fn fire_once(run: &RunState, idx: NodeIdx) {
    let node = &run.nodes[idx];
    let entry = run.workspace.node(idx);
    if node.state().is_terminal() || node.stop.is_cancelled() {
        return;
    }

    // Parked until a consumer catches up; it releases this node again.
    if !run.outputs_free(idx) {
        return;
    }
    let Some(snapshot) = node.lock_inputs().take_snapshot() else {
        return;
    };
    run.notify_consumed(idx);

    run.set_state(idx, NodeState::Executing);
    run.mark_inbound_inactive(idx);
    pause(run.config.fire_delay(), &node.stop);
    node.progress.set(0.0);

    let inputs = match snapshot.into_inputs() {
        Ok(inputs) => inputs,
        Err(error) => {
            run.record_failure(idx, FailureKind::Fire, format!("{error:#}"));
            return;
        }
    };

    let emit = |port: &str, value: PortData| run.propagate(idx, port, value);
    let ctx = FireContext::new(&entry.id, &node.stop, &node.progress, &emit);
    let started = Instant::now();
    let result = isolate(|| entry.node.fire(&inputs, &ctx));

    if node.stop.is_cancelled() {
        run.set_state(idx, NodeState::Stopped);
        tracing::debug!(node = %entry.id, "Fire interrupted by stop; outputs discarded");
        return;
    }

    let outputs = match result {
        Ok(outputs) => outputs,
        Err(message) => {
            run.record_failure(idx, FailureKind::Fire, message);
            return;
        }
    };

    node.fire_count.fetch_add(1, Ordering::Relaxed);
    run.firings.fetch_add(1, Ordering::Relaxed);
    node.progress.set(1.0);

    let mut ordered: Vec<(String, PortData)> = outputs.into_iter().collect();
    ordered.sort_by_key(|(port, _)| entry.output_index(port).unwrap_or(usize::MAX));
    for (port, value) in ordered {
        if let Err(error) = run.propagate(idx, &port, value) {
            run.record_failure(idx, FailureKind::Fire, format!("{error:#}"));
            return;
        }
    }

    run.set_state(idx, NodeState::Finished);
    if let Err(error) = run.signal_control_dependents(idx) {
        run.record_failure(idx, FailureKind::Fire, format!("{error:#}"));
        return;
    }
    let more_queued = node.lock_inputs().is_satisfied();
    if more_queued {
        run.release(idx);
    }

    tracing::debug!(
        run_id = %run.run_id,
        node = %entry.id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Node fired"
    );
}

fn pause(delay: Duration, stop: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    let deadline = Instant::now() + delay;
    while !stop.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(DELAY_SLICE.min(deadline - now));
    }
}
