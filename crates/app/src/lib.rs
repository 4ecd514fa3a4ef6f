use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use nodeflow_core::config::{config_path, data_dir, initialize_data_dir, AppConfig, EngineConfig};
use nodeflow_core::engine::{Engine, StopReport};
use nodeflow_core::graph::WorkflowGraph;
use nodeflow_core::logging::{self, CrashHook, FilterRequest, DEFAULT_LOG_FILTER};
use nodeflow_core::node::{NodeState, PortDefinition};
use nodeflow_core::registry::{build_default_registry, NodeRegistry};
use nodeflow_core::types::port_data_to_json;
use nodeflow_core::view::{NoopViewSink, ViewSink};
use nodeflow_core::workspace::Workspace;

#[derive(Parser)]
#[command(name = "nodeflow", about = "Run node-based dataflow workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow until it drains, then print every node output as JSON.
    Run(RunArgs),
    /// Check a workflow against the node registry without running it.
    Validate {
        #[arg(help = "Path to workflow JSON file")]
        workflow: PathBuf,
    },
    /// List the registered node types and their ports.
    Nodes,
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to workflow JSON file")]
    workflow: PathBuf,
    #[arg(long, help = "Stop the run after this many seconds even if it has not drained")]
    timeout_secs: Option<u64>,
    #[arg(long, help = "Do not draw node states or the progress bar")]
    no_views: bool,
    #[arg(long, help = "Report firings per second (overrides the config file)")]
    benchmark: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        eprintln!("Warning: failed to initialize data directory: {e:#}");
    }
    let config = AppConfig::load_from_path(&config_path(&resolved_data_dir));

    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        config
            .as_ref()
            .map(|config| config.logging.retention_files)
            .unwrap_or(logging::DEFAULT_LOG_RETENTION_FILES),
    );
    log_startup_metadata(&resolved_data_dir);

    let config = config.unwrap_or_else(|err| {
        warn!(error = %err, "Failed to load config file, using defaults");
        AppConfig::default()
    });

    match cli.command {
        Commands::Run(run) => run_workflow(run, config.engine).await,
        Commands::Validate { workflow } => validate_workflow(&workflow),
        Commands::Nodes => {
            list_nodes(&build_default_registry());
            Ok(())
        }
    }
}

fn init_logging(
    data_dir: &Path,
    verbose: u8,
    cli_log_filter: Option<&str>,
    retention_files: usize,
) {
    let crash_hook = logging::install_crash_hook(data_dir);

    let rust_log = std::env::var("RUST_LOG").ok();
    let (filter, source) = logging::resolve_filter(&FilterRequest {
        cli: cli_log_filter,
        verbose,
        env: rust_log.as_deref(),
    });

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filter, "console"));
    let (file, file_error) = match logging::open_log_file(data_dir, retention_files) {
        Ok(appender) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(logging::redacting(appender))
                    .with_filter(parse_env_filter_with_fallback(&filter, "file")),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }
    debug!(%filter, source = ?source, "Log filter selected");

    if let Some(error) = file_error {
        warn!(
            error = %format!("{error:#}"),
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let CrashHook::Unavailable { crash_dir, reason } = crash_hook {
        warn!(
            crash_dir = %crash_dir.display(),
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_workspace(workflow_path: &Path, registry: &NodeRegistry) -> Result<Workspace> {
    if !workflow_path.exists() {
        bail!("Workflow file does not exist: {}", workflow_path.display());
    }

    info!("Loading workflow: {}", workflow_path.display());
    let graph = WorkflowGraph::load_from_path(workflow_path)?;
    if graph.has_cycle() {
        warn!("Workflow contains a cycle; it will keep firing until stopped");
    }

    Workspace::from_workflow(&graph, registry).context("Workflow validation failed")
}

fn validate_workflow(workflow_path: &Path) -> Result<()> {
    let workspace = load_workspace(workflow_path, &build_default_registry())?;
    println!(
        "Workflow is valid: {} nodes, {} edges",
        workspace.node_count(),
        workspace.edges().len()
    );
    Ok(())
}

fn describe_ports(ports: &[PortDefinition]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(|port| {
            let mut label = format!("{}:{}", port.name, port.port_type.name());
            if !port.required {
                label.push('?');
            }
            label
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn list_nodes(registry: &NodeRegistry) {
    let empty = Default::default();
    for node_type in registry.list_node_types() {
        match registry.create(node_type, &empty) {
            Ok(node) => println!(
                "{node_type:<10} in: {:<24} out: {}",
                describe_ports(&node.input_ports()),
                describe_ports(&node.output_ports())
            ),
            Err(error) => println!("{node_type:<10} <cannot instantiate without params: {error:#}>"),
        }
    }
}

async fn run_workflow(args: RunArgs, mut config: EngineConfig) -> Result<()> {
    let workspace = Arc::new(load_workspace(&args.workflow, &build_default_registry())?);
    if args.benchmark {
        config.benchmark = true;
    }

    let update_views = !args.no_views;
    let sink: Arc<dyn ViewSink> = if update_views || config.benchmark {
        Arc::new(ConsoleProgressSink::new())
    } else {
        Arc::new(NoopViewSink)
    };
    let engine = Arc::new(Engine::new(config, sink));

    info!("Executing workflow...");
    engine.execute(workspace, update_views)?;

    let drained = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || {
            while !engine.wait_idle(Duration::from_secs(1)) {}
        })
    };
    let deadline = async {
        match args.timeout_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = drained => {
            result.context("wait task failed")?;
            info!("Workflow drained");
        }
        _ = tokio::signal::ctrl_c() => warn!("Interrupted; stopping workflow"),
        _ = deadline => warn!(timeout_secs = ?args.timeout_secs, "Run timeout reached; stopping workflow"),
    }

    let report = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.stop())
            .await
            .context("stop task failed")?
    };
    if update_views {
        eprintln!();
    }

    let outputs: BTreeMap<String, BTreeMap<String, serde_json::Value>> = engine
        .outputs()
        .into_iter()
        .map(|(node_id, ports)| {
            let ports = ports
                .iter()
                .map(|(port, data)| (port.clone(), port_data_to_json(data)))
                .collect();
            (node_id, ports)
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&outputs)?);

    summarize(&report)
}

fn summarize(report: &StopReport) -> Result<()> {
    for node_id in &report.detached_workers {
        warn!(node = %node_id, "Worker was detached and may still be running");
    }
    if report.failures.is_empty() {
        info!("Workflow completed successfully");
        return Ok(());
    }
    for failure in &report.failures {
        warn!("{failure}");
    }
    bail!("{} node failure(s) during the run", report.failures.len())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress_line(fraction: f64, elapsed: f64, firings_per_second: Option<u64>) -> String {
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let rate = firings_per_second
        .map(|firings| format!(" | {firings} firings/s"))
        .unwrap_or_default();

    format!(
        "[{}] {:5.1}% | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        format_duration(elapsed),
        rate
    )
}

/// Draws the aggregate progress as a single self-overwriting stderr line.
struct ConsoleProgressSink {
    started: Instant,
    /// Aggregate fraction in per-mille, so it fits an atomic.
    permille: AtomicU64,
    firings: Mutex<Option<u64>>,
}

impl ConsoleProgressSink {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            permille: AtomicU64::new(0),
            firings: Mutex::new(None),
        }
    }

    fn redraw(&self) {
        let fraction = self.permille.load(Ordering::Relaxed) as f64 / 1000.0;
        let firings = *self
            .firings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        eprint!(
            "\r{}    ",
            render_progress_line(fraction, self.started.elapsed().as_secs_f64(), firings)
        );
    }
}

impl ViewSink for ConsoleProgressSink {
    fn on_node_state_changed(&self, node_id: &str, state: NodeState, progress: f64) {
        debug!(node = %node_id, %state, progress, "Node state");
    }

    fn on_aggregate_progress(&self, fraction: f64) {
        self.permille
            .store((fraction * 1000.0).round() as u64, Ordering::Relaxed);
        self.redraw();
    }

    fn on_benchmark(&self, firings_per_second: u64) {
        *self
            .firings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(firings_per_second);
        self.redraw();
    }
}
