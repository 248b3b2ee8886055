//! contactsync - run contact synchronization from the command line
//!
//! Loads two JSON directory snapshots into in-memory directories, runs one
//! sync between them and prints the run report as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use contactsync_directory::ids::UserId;
use contactsync_directory::types::DirectoryKind;
use contactsync_engine::config::SyncConfig;
use contactsync_engine::run::{CancelSignal, RunStatus};
use contactsync_engine::store::SyncStores;
use contactsync_engine::SyncOrchestrator;
use tracing::{info, warn};

mod error;
mod logging;
mod snapshot;

use error::{CliError, CliResult};

/// contactsync - Messaging and cloud contact synchronization
#[derive(Parser)]
#[command(name = "contactsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync between two directory snapshots
    Sync(SyncArgs),

    /// Validate a configuration file
    CheckConfig(CheckConfigArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Configuration file (YAML); defaults apply when omitted
    #[arg(short, long, env = "CONTACTSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Messaging directory snapshot (JSON)
    #[arg(long)]
    messaging: PathBuf,

    /// Cloud directory snapshot (JSON)
    #[arg(long)]
    cloud: PathBuf,

    /// User the run is attributed to
    #[arg(long)]
    user: Option<UserId>,

    /// Overwrite the snapshot files with the synchronized state
    #[arg(long)]
    write_back: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct CheckConfigArgs {
    /// Configuration file (YAML)
    #[arg(short, long, env = "CONTACTSYNC_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli).await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Sync(args) => sync(args).await,
        Commands::CheckConfig(args) => check_config(args),
    }
}

fn load_config(path: Option<&PathBuf>) -> CliResult<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_file(path).map_err(|e| CliError::Config(e.to_string())),
        None => Ok(SyncConfig::default()),
    }
}

fn check_config(args: CheckConfigArgs) -> CliResult<()> {
    let config = load_config(Some(&args.config))?;
    println!(
        "{} is valid (threshold {}, batch sizes {}/{})",
        args.config.display(),
        config.match_confidence_threshold,
        config.directory(DirectoryKind::Messaging).batch_size,
        config.directory(DirectoryKind::Cloud).batch_size,
    );
    Ok(())
}

async fn sync(args: SyncArgs) -> CliResult<()> {
    let config = load_config(args.config.as_ref())?;
    logging::init_logging(&config.logging, args.verbose)?;

    let messaging = Arc::new(snapshot::load(&args.messaging, DirectoryKind::Messaging).await?);
    let cloud = Arc::new(snapshot::load(&args.cloud, DirectoryKind::Cloud).await?);
    let user_id = args.user.unwrap_or_default();

    let orchestrator = SyncOrchestrator::new(
        config,
        messaging.clone(),
        cloud.clone(),
        SyncStores::in_memory(),
    )?;

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight writes");
            on_interrupt.cancel();
        }
    });

    let run = orchestrator.run_sync_cancellable(user_id, &cancel).await?;
    println!("{}", run.to_json()?);

    if args.write_back && run.status != RunStatus::Failed {
        snapshot::save(&args.messaging, &messaging).await?;
        snapshot::save(&args.cloud, &cloud).await?;
        info!(
            messaging = %args.messaging.display(),
            cloud = %args.cloud.display(),
            "Snapshots updated"
        );
    }

    match run.status {
        RunStatus::Completed => Ok(()),
        RunStatus::PartiallyCompleted => Err(CliError::PartiallyCompleted {
            unapplied: run.failures.len(),
            conflicts: run.conflicts.len(),
        }),
        RunStatus::Cancelled => Err(CliError::Cancelled),
        RunStatus::Failed => Err(CliError::RunFailed(
            run.error.unwrap_or_else(|| "unknown error".to_string()),
        )),
    }
}
