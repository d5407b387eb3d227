use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

mod cache;
mod config;
mod counters;
mod events;
mod hop;
mod loader;
mod reconcile;

use config::{Interface, MonitorOptions, PortRange, Role, XdpMode};
use loader::AttachedFilter;
use reconcile::{MonitorHandle, Reconciler};

#[derive(Parser)]
#[command(name = "esdx-monitor")]
#[command(about = "Per-hop bandwidth monitor for the ESDX data plane", long_about = None)]
struct Cli {
    /// Logging verbosity (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the filter to both interfaces and log per-hop bandwidth changes
    Monitor(MonitorCommand),
}

#[derive(Args)]
struct MonitorCommand {
    /// Position of the monitor relative to the provider AS
    #[arg(long, value_enum)]
    role: Role,
    /// SCION underlay UDP ports as inclusive FIRST:LAST range
    #[arg(long, value_name = "FIRST:LAST", default_value = config::DEFAULT_PORTS)]
    ports: PortRange,
    /// Interface in the provider (upstream) direction
    #[arg(long, value_name = "IFACE")]
    up: String,
    /// Interface in the customer (downstream) direction
    #[arg(long, value_name = "IFACE")]
    down: String,
    /// Seconds between counter re-reads
    #[arg(short = 'i', long, value_name = "SECS", default_value_t = config::DEFAULT_INTERVAL_SECS)]
    interval: u64,
    /// Compiled filtering program (ELF object)
    #[arg(long, value_name = "PATH")]
    bpf_object: PathBuf,
    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = XdpMode::Driver)]
    xdp_mode: XdpMode,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("esdx-monitor error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Some(Commands::Monitor(cmd)) => {
            let opts = MonitorOptions {
                role: cmd.role,
                ports: cmd.ports,
                up: Interface::lookup(&cmd.up)?,
                down: Interface::lookup(&cmd.down)?,
                interval: Duration::from_secs(cmd.interval),
                bpf_object: cmd.bpf_object,
                xdp_mode: cmd.xdp_mode,
            };
            opts.validate()?;
            run_monitor(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

async fn run_monitor(opts: MonitorOptions) -> Result<()> {
    let mut filter = AttachedFilter::load(&opts)?;
    let counters = filter.counters()?;
    let ring_buf = filter.events()?;

    let shutdown = CancellationToken::new();
    let (new_hops_tx, new_hops_rx) = mpsc::unbounded_channel();
    let (reconciler, handle) = Reconciler::new(counters, opts.interval);

    let reader = tokio::spawn(events::read_loop(ring_buf, new_hops_tx, shutdown.clone()));
    let reconcile = tokio::spawn(reconciler.run(new_hops_rx, shutdown.clone()));

    wait_for_shutdown().await?;
    log_tracked_hops(&handle).await;

    shutdown.cancel();
    if let Err(err) = reader.await {
        tracing::warn!(error = %err, "ring buffer reader panicked");
    }
    if let Err(err) = reconcile.await {
        tracing::warn!(error = %err, "reconciliation loop panicked");
    }

    filter.detach();
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to wait for ctrl-c")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
    Ok(())
}

async fn log_tracked_hops(handle: &MonitorHandle) {
    match handle.snapshot().await {
        Ok(hops) => tracing::info!(hops = hops.len(), "tracked hops at shutdown"),
        Err(err) => tracing::warn!(error = %err, "cannot read hop cache"),
    }
}
