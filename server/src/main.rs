use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ethonode_server::{backup, config, db, scanner};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Ethonode — ethoscope fleet controller: discovery, polling & backups.
#[derive(Parser, Debug)]
#[command(name = "ethonode-server", version, about)]
struct Cli {
    /// Path to the controller's experiment database.
    #[arg(short, long, default_value = "ethonode.db")]
    db: String,

    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,

    /// Override the results directory from the configuration.
    #[arg(short, long)]
    results_dir: Option<String>,
}

const BANNER: &str = r#"
       _   _                           _
   ___| |_| |__   ___  _ __   ___   __| | ___
  / _ \ __| '_ \ / _ \| '_ \ / _ \ / _` |/ _ \
 |  __/ |_| | | | (_) | | | | (_) | (_| |  __/
  \___|\__|_| |_|\___/|_| |_|\___/ \__,_|\___|
"#;

/// Bounded wait for in-flight work once shutdown starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (logs).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ethonode_server=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    println!("{BANNER}");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting ethonode server"
    );

    // Load optional config file.
    let mut app_config = if let Some(ref path) = cli.config {
        config::AppConfig::from_file(path)?
    } else {
        config::AppConfig::default()
    };
    if let Some(results_dir) = cli.results_dir {
        app_config.results_dir = results_dir;
    }

    // Open the experiment database. Failure here is fatal.
    let expdb = db::ExperimentDb::open(&cli.db).await?;
    info!(path = %cli.db, "Experiment database initialized");

    let shutdown = CancellationToken::new();

    // Start the mDNS fleet scanner; it owns the device pollers.
    let fleet = scanner::FleetScanner::new(
        expdb.clone(),
        app_config.clone(),
        shutdown.child_token(),
    );
    fleet.start().await?;

    // Start the backup coordinator and its periodic sweep.
    let coordinator = backup::BackupCoordinator::new(
        Path::new(&app_config.results_dir),
        app_config.backup.clone(),
        shutdown.child_token(),
    );
    coordinator.start_periodic(fleet.registry());

    info!(
        results_dir = %app_config.results_dir,
        "ethonode running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    // In-flight backup jobs are never interrupted mid-transaction; give
    // everything a bounded window, then leave.
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, fleet.stop())
        .await
        .is_err()
    {
        warn!("shutdown timed out, exiting anyway");
    }

    Ok(())
}
