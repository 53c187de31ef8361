//! VaultSync CLI - keep a vault directory in sync with a shared remote folder.
//!
//! The remote is any directory reachable from every device (a network
//! share or a mounted drive). Each invocation opens the engine, does its
//! work and saves the device's index.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vaultsync_storage::{DiskFs, FolderRemote};
use vaultsync_sync::{
    PassReport, PassRequest, ScanOutcome, SyncConfig, SyncEngine, SyncOrchestrator, SyncTrigger,
    TracingNotifier, Verbosity,
};

#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "VaultSync - Multi-device vault synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Vault directory on this device.
    #[arg(long, global = true, default_value = ".")]
    vault: PathBuf,

    /// Shared remote folder.
    #[arg(long, global = true)]
    remote: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device identity, overriding the one saved in the local index.
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass.
    Sync {
        /// Scan the whole vault before pulling.
        #[arg(long)]
        full: bool,
    },

    /// Run a full-vault scan for files to adopt or push.
    Scan,

    /// Sync periodically until interrupted.
    Watch {
        /// Seconds between passes.
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },

    /// Show the device's sync state.
    Status,

    /// List merge locks held on the remote.
    Locks,

    /// Rebuild the index from the remote listing.
    RebuildIndex,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref(), cli.device)?;
    let verbosity = if cli.verbose {
        Verbosity::Verbose
    } else {
        config.verbosity
    };
    let engine = open_engine(&cli.vault, cli.remote.as_deref(), config, verbosity).await?;

    match cli.command {
        Commands::Sync { full } => cmd_sync(engine, full).await,
        Commands::Scan => cmd_scan(engine).await,
        Commands::Watch { interval } => cmd_watch(engine, interval).await,
        Commands::Status => cmd_status(&engine).await,
        Commands::Locks => cmd_locks(&engine).await,
        Commands::RebuildIndex => cmd_rebuild(engine).await,
    }
}

/// Read the configuration file, if any, and apply flag overrides.
fn load_config(path: Option<&Path>, device: Option<String>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            SyncConfig::from_json(&json).context("Invalid configuration")?
        }
        None => SyncConfig::default(),
    };
    if device.is_some() {
        config.device_id = device;
    }
    Ok(config)
}

async fn open_engine(
    vault: &Path,
    remote: Option<&Path>,
    config: SyncConfig,
    verbosity: Verbosity,
) -> Result<Arc<SyncEngine>> {
    let remote = remote.context("--remote is required")?;
    let local = DiskFs::new(vault)
        .with_context(|| format!("Failed to open vault at {}", vault.display()))?;
    let remote = FolderRemote::new(remote)
        .with_context(|| format!("Failed to open remote at {}", remote.display()))?;

    let engine = SyncEngine::open(
        config,
        Arc::new(remote),
        Arc::new(local),
        Arc::new(TracingNotifier::new(verbosity)),
    )
    .await
    .context("Failed to open sync engine")?;
    info!(device = %engine.device_id(), "Sync engine ready");
    Ok(Arc::new(engine))
}

fn print_pass(report: &PassReport) {
    println!("Sync complete ({}):", report.trigger);
    println!("  Pull: {}", report.pull.summary());
    println!("  Push: {}", report.push.summary());
    if report.pull.deferred + report.push.deferred > 0 {
        println!(
            "  Deferred: {} (locked by another device)",
            report.pull.deferred + report.push.deferred
        );
    }
    if let Some(scan) = &report.scan {
        println!(
            "  Scan: {} examined, {} adopted, {} flagged",
            scan.examined, scan.adopted, scan.flagged
        );
    }
    println!("  Took {:.2}s", report.duration.as_secs_f64());
}

/// Run one sync pass.
async fn cmd_sync(engine: Arc<SyncEngine>, full: bool) -> Result<()> {
    let orchestrator = SyncOrchestrator::new(engine);
    let mut request = PassRequest::new(SyncTrigger::Manual);
    if full {
        request = request.with_full_scan();
    }
    let report = orchestrator
        .request_sync(request)
        .await
        .context("Sync failed")?;
    print_pass(&report);
    Ok(())
}

/// Run a full scan to completion.
async fn cmd_scan(engine: Arc<SyncEngine>) -> Result<()> {
    let orchestrator = SyncOrchestrator::new(engine);
    match orchestrator
        .request_full_scan(SyncTrigger::Manual)
        .await
        .context("Scan failed")?
    {
        ScanOutcome::Completed(report) => {
            println!("Scan complete:");
            println!("  Examined: {}", report.examined);
            println!("  Adopted: {}", report.adopted);
            println!("  Flagged for push: {}", report.flagged);
        }
        ScanOutcome::Paused(progress) => {
            println!(
                "Scan paused at {}/{}",
                progress.current_index, progress.total_files
            );
        }
    }
    Ok(())
}

/// Sync on an interval until Ctrl-C.
async fn cmd_watch(engine: Arc<SyncEngine>, interval: u64) -> Result<()> {
    if interval == 0 {
        anyhow::bail!("Interval must be at least one second");
    }
    let orchestrator = SyncOrchestrator::new(engine);
    orchestrator
        .request_sync(PassRequest::new(SyncTrigger::Startup))
        .await
        .context("Initial sync failed")?;

    println!("Watching; press Ctrl-C to stop.");
    orchestrator
        .run_periodic(Duration::from_secs(interval), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

/// Print the device's sync state as JSON.
async fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.status().await.context("Failed to read status")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// List merge locks.
async fn cmd_locks(engine: &SyncEngine) -> Result<()> {
    let status = engine.status().await.context("Failed to read locks")?;
    if status.locks.is_empty() {
        println!("No merge locks held.");
        return Ok(());
    }
    for lock in status.locks {
        println!(
            "  {} held by {} ({}s left)",
            lock.path,
            lock.holder,
            lock.expires_in.as_secs()
        );
    }
    Ok(())
}

/// Rebuild the index from the remote.
async fn cmd_rebuild(engine: Arc<SyncEngine>) -> Result<()> {
    let orchestrator = SyncOrchestrator::new(engine);
    let report = orchestrator
        .rebuild_index(SyncTrigger::Manual)
        .await
        .context("Index rebuild failed")?;
    println!("Index rebuilt:");
    println!("  Adopted: {}", report.adopted);
    println!("  Downloaded: {}", report.downloaded);
    println!("  Diverged: {}", report.diverged);
    println!("  Local only: {}", report.local_only);
    Ok(())
}
