//! Progress aggregator: one thread per run that samples node progress, refreshes
//! the view and keeps the firings-per-second benchmark window.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::{lock, RunState};
use crate::node::NodeState;
use crate::view::EdgeActivity;
use crate::workspace::Workspace;

/// Minimum change of the aggregate before it is reported again.
pub const PROGRESS_HYSTERESIS: f64 = 0.005;

pub const BENCHMARK_WINDOW: Duration = Duration::from_secs(1);

/// Mean of the given fractions; an empty set counts as no progress.
pub fn aggregate_progress(fractions: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = fractions
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), fraction| (sum + fraction, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Suppresses aggregate updates smaller than [`PROGRESS_HYSTERESIS`].
#[derive(Debug, Default)]
pub struct Hysteresis {
    last_emitted: f64,
}

impl Hysteresis {
    pub fn observe(&mut self, fraction: f64) -> Option<f64> {
        if (fraction - self.last_emitted).abs() > PROGRESS_HYSTERESIS {
            self.last_emitted = fraction;
            Some(fraction)
        } else {
            None
        }
    }
}

/// Remembers what the view last showed so a refresh only reports changes.
pub(crate) struct ViewTracker {
    nodes: Vec<Option<(NodeState, f64)>>,
    edges: Vec<Option<bool>>,
}

impl ViewTracker {
    pub(crate) fn new(workspace: &Workspace) -> Self {
        Self {
            nodes: vec![None; workspace.node_count()],
            edges: vec![None; workspace.edges().len()],
        }
    }

    pub(crate) fn refresh(&mut self, run: &RunState, force: bool) {
        for (idx, entry) in run.workspace.nodes() {
            let shown = (run.nodes[idx].state(), run.nodes[idx].progress.get());
            if force || self.nodes[idx] != Some(shown) {
                self.nodes[idx] = Some(shown);
                run.sink.on_node_state_changed(&entry.id, shown.0, shown.1);
            }
        }

        for (idx, edge) in run.workspace.edges().iter().enumerate() {
            let active = run.edges[idx].active.load(Ordering::Acquire);
            if force || self.edges[idx] != Some(active) {
                self.edges[idx] = Some(active);
                let source = run.workspace.node(edge.source.node);
                run.sink.on_edge_activity(&EdgeActivity {
                    from_node: source.id.clone(),
                    from_port: source.outputs[edge.source.port].name.clone(),
                    active,
                });
            }
        }
    }
}

#[derive(Default)]
struct Shutdown {
    requested: Mutex<bool>,
    signal: Condvar,
}

pub(crate) struct AggregatorHandle {
    shutdown: Arc<Shutdown>,
    handle: JoinHandle<()>,
}

impl AggregatorHandle {
    pub(crate) fn shutdown(self) {
        *lock(&self.shutdown.requested) = true;
        self.shutdown.signal.notify_all();
        if self.handle.join().is_err() {
            tracing::warn!("Progress aggregator panicked");
        }
    }
}

pub(crate) fn spawn_aggregator(run: Arc<RunState>) -> io::Result<AggregatorHandle> {
    let shutdown = Arc::new(Shutdown::default());
    let handle = {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("nodeflow-progress".to_string())
            .spawn(move || aggregate_loop(&run, &shutdown))?
    };

    Ok(AggregatorHandle { shutdown, handle })
}

fn aggregate_loop(run: &RunState, shutdown: &Shutdown) {
    let interval = run.config.view_refresh_interval();
    let mut tracker = ViewTracker::new(&run.workspace);
    let mut hysteresis = Hysteresis::default();
    let mut window_start = Instant::now();

    loop {
        let requested = lock(&shutdown.requested);
        let (requested, _) = shutdown
            .signal
            .wait_timeout_while(requested, interval, |requested| !*requested)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *requested {
            break;
        }
        drop(requested);

        let visible = run.sink.is_active();
        if run.update_views && visible {
            tracker.refresh(run, false);
            if let Some(fraction) = hysteresis.observe(run.aggregate_progress()) {
                run.sink.on_aggregate_progress(fraction);
            }
        }

        if window_start.elapsed() >= BENCHMARK_WINDOW {
            let firings = run.firings.swap(0, Ordering::Relaxed);
            if run.config.benchmark {
                tracing::debug!(run_id = %run.run_id, firings_per_second = firings, "Benchmark window");
                if visible {
                    run.sink.on_benchmark(firings);
                }
            }
            window_start = Instant::now();
        }

        // Held back while hidden; flushed on the first visible tick or at stop.
        if visible {
            run.logs.flush_to(run.sink.as_ref());
        }
    }
}
