//! Standalone backup worker.
//!
//! Interrogates a running node for its device list and replicates each
//! device's MySQL database into local SQLite files. Normally run from a
//! timer; `--ethoscope` forces a backup of specific devices and exits
//! non-zero when one of them is unknown.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ethonode_server::backup::{BackupCoordinator, BackupJob};
use ethonode_server::client::DeviceClient;
use ethonode_server::config::AppConfig;
use ethonode_server::device::InfoMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Back up ethoscope databases to local SQLite replicas.
#[derive(Parser, Debug)]
#[command(name = "etho-backup", version, about)]
struct Cli {
    /// Verbose debug logging.
    #[arg(short = 'D', long)]
    debug: bool,

    /// Node server to interrogate for the device list (host or host:port).
    #[arg(short = 'i', long, default_value = "localhost")]
    server: String,

    /// Destination directory for database replicas.
    #[arg(short, long)]
    results_dir: Option<String>,

    /// Destination directory for video files (consumed by the rsync tooling).
    #[arg(short, long)]
    videos_dir: Option<String>,

    /// Back up only the given ethoscope numbers (e.g. `007` or `007,012`).
    #[arg(short, long)]
    ethoscope: Option<String>,

    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,
}

fn split_host_port(server: &str) -> (String, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (server.to_string(), 80),
        },
        None => (server.to_string(), 80),
    }
}

/// `7` → `ETHOSCOPE_007`
fn ethoscope_name_for(number: u32) -> String {
    format!("ETHOSCOPE_{number:03}")
}

fn parse_ethoscope_selector(selector: &str) -> Result<Vec<String>> {
    selector
        .split(',')
        .map(|part| {
            let number: u32 = part
                .trim()
                .parse()
                .with_context(|| format!("invalid ethoscope number '{part}'"))?;
            Ok(ethoscope_name_for(number))
        })
        .collect()
}

/// Ask the node for its current device list.
async fn fetch_devices(server: &str) -> Result<Vec<InfoMap>> {
    let (host, port) = split_host_port(server);
    let client = DeviceClient::new(&host, port, CancellationToken::new());
    let response = client
        .get_json("devices")
        .await
        .with_context(|| format!("could not fetch the device list from {server}"))?;

    let Some(map) = response.as_object() else {
        bail!("unexpected device list payload from {server}");
    };
    Ok(map
        .values()
        .filter_map(Value::as_object)
        .cloned()
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "ethonode_server=debug,etho_backup=debug"
    } else {
        "ethonode_server=info,etho_backup=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    let mut app_config = if let Some(ref path) = cli.config {
        AppConfig::from_file(path)?
    } else {
        AppConfig::default()
    };
    if let Some(results_dir) = cli.results_dir {
        app_config.results_dir = results_dir;
    }
    if let Some(videos_dir) = cli.videos_dir {
        app_config.videos_dir = videos_dir;
    }

    info!(server = %cli.server, results_dir = %app_config.results_dir, "backup worker starting");

    let devices = fetch_devices(&cli.server).await?;
    info!(devices = devices.len(), "device list fetched");

    let coordinator = BackupCoordinator::new(
        Path::new(&app_config.results_dir),
        app_config.backup.clone(),
        CancellationToken::new(),
    );

    match cli.ethoscope {
        Some(selector) => {
            // Manual mode: back up exactly the requested devices.
            let wanted = parse_ethoscope_selector(&selector)?;
            for name in &wanted {
                let Some(info) = devices
                    .iter()
                    .find(|info| info.get("name").and_then(Value::as_str) == Some(name))
                else {
                    bail!("unknown ethoscope '{name}' (not in the node's device list)");
                };
                let Some(job) =
                    BackupJob::from_device_info(Path::new(&app_config.results_dir), info)
                else {
                    bail!("'{name}' reports no backup database to replicate");
                };
                info!(device = %job.device_id, name = %name, "forcing backup");
                if let Err(err) = coordinator.initiate_backup_job(job).await {
                    warn!(name = %name, error = %err, "backup failed");
                }
            }
        }
        None => {
            coordinator.sweep(devices).await;
        }
    }

    let statuses = coordinator.statuses_snapshot();
    let failures = statuses
        .values()
        .filter(|status| status.status == "error")
        .count();
    info!(
        jobs = statuses.len(),
        failures,
        "backup worker finished"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("localhost"), ("localhost".to_string(), 80));
        assert_eq!(
            split_host_port("192.168.1.2:8000"),
            ("192.168.1.2".to_string(), 8000)
        );
    }

    #[test]
    fn test_ethoscope_selector() {
        assert_eq!(
            parse_ethoscope_selector("7").unwrap(),
            vec!["ETHOSCOPE_007"]
        );
        assert_eq!(
            parse_ethoscope_selector("007,12").unwrap(),
            vec!["ETHOSCOPE_007", "ETHOSCOPE_012"]
        );
        assert!(parse_ethoscope_selector("seven").is_err());
    }
}
