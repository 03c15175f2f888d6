//! Run command: drives verification rounds against the bundled in-memory
//! cluster.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use gcprobe::{KeySpace, ProbeOptions, RoundController, RunReport, StopReason};
use gcprobe_config::{ConfigLoader, GcProbeConfig};
use gcprobe_kv::{SimCluster, SimFaults};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Stop cleanly after this many rounds (default: run until Ctrl+C).
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Request the physical ("green") GC path.
    #[arg(long)]
    pub green_gc: bool,

    /// Select localhost endpoints instead of cluster service names. The
    /// endpoints are logged only; runs always use the in-memory cluster.
    #[arg(long)]
    pub local: bool,

    /// Number of partitions.
    #[arg(long)]
    pub regions: Option<usize>,

    /// Locks written per partition per generation pass.
    #[arg(long)]
    pub locks_per_region: Option<usize>,

    /// Lock-writing worker count.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Pause between main lock generation and GC, in milliseconds.
    #[arg(long)]
    pub settle_ms: Option<u64>,

    /// Write the run report as JSON to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Make the in-memory cluster's GC leave locks behind.
    #[arg(long)]
    pub sim_leak: bool,

    /// Project directory holding gcprobe.toml.
    #[arg(short, long, default_value = ".")]
    pub project: PathBuf,
}

pub fn run(args: &RunArgs) -> Result<()> {
    let config = load_config(args)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let (result, report) = runtime.block_on(execute(&config, args))?;

    if let Some(path) = &args.report {
        let json = report.to_json_pretty().context("Failed to encode run report")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))?;
    }

    let reason = result.context("Verification failed")?;
    println!(
        "gcprobe finished after {} rounds ({})",
        report.rounds_completed,
        describe(reason)
    );
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<GcProbeConfig> {
    let mut config = ConfigLoader::new()
        .with_project_dir(&args.project)
        .load()
        .context("Failed to load configuration")?;

    if let Some(regions) = args.regions {
        config.workload.region_count = regions;
    }
    if let Some(locks) = args.locks_per_region {
        config.workload.lock_per_region = locks;
    }
    if let Some(workers) = args.workers {
        config.workload.workers = workers;
    }
    if let Some(settle_ms) = args.settle_ms {
        config.timing.settle_ms = settle_ms;
    }
    if args.green_gc {
        config.gc.enable_green_gc = true;
    }
    if args.local {
        config.cluster.local_mode = true;
    }

    let config = config.normalize();
    config.validate()?;
    Ok(config)
}

async fn execute(
    config: &GcProbeConfig,
    args: &RunArgs,
) -> Result<(gcprobe::Result<StopReason>, RunReport)> {
    let sim = Arc::new(SimCluster::with_faults(SimFaults {
        leak_locks: args.sim_leak,
        ..Default::default()
    }));
    info!(
        pd = %config.cluster.pd_addr(),
        status = %config.cluster.status_addr(),
        "driving the in-memory cluster"
    );

    let keyspace = KeySpace::resolve(
        sim.as_ref(),
        &config.cluster.db_name,
        config.workload.region_count,
    )
    .await
    .context("Failed to resolve partitions")?;

    let mut options = ProbeOptions::from_config(config);
    if let Some(rounds) = args.rounds {
        options = options.with_max_rounds(rounds);
    }
    let controller = RoundController::new(
        Arc::clone(&sim),
        Arc::clone(&sim),
        Arc::clone(&sim),
        &keyspace,
        options,
    );

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("received Ctrl+C, stopping after the current round");
                cancel.cancel();
            }
        })
    };

    let mut report = RunReport::new();
    let result = controller.run(&cancel, &mut report).await;
    watcher.abort();
    report.finish(&result);
    Ok((result, report))
}

fn describe(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Cancelled => "cancelled",
        StopReason::RoundLimit => "round limit reached",
        StopReason::OracleDown => "timestamp oracle unreachable",
    }
}
