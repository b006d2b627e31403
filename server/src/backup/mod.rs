//! Backup coordination across the fleet.
//!
//! The coordinator owns one [`BackupStatus`] record per device and a bounded
//! worker pool. Jobs come from the periodic sweep over the registry or from
//! explicit enqueues (the manual worker CLI); each job drives the
//! [`engine::MySqlToSqlite`] engine once and reports back into the status map.

pub mod engine;
pub mod marker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackupConfig;
use crate::device::{derive_backup_path, InfoMap};
use crate::scanner::registry::ScanRegistry;

use engine::{BackupError, BackupOutcome, MySqlToSqlite};

/// Seconds between periodic sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Per-device backup record observed by operators. Created on first backup,
/// updated in place, never deleted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStatus {
    pub name: String,
    pub status: String,
    pub started: i64,
    pub ended: i64,
    pub processing: bool,
    pub count: u64,
    /// Completion flag per backup kind ("sqlite", "video").
    pub synced: HashMap<String, bool>,
    /// Progress percentage per backup kind.
    pub progress: HashMap<String, f64>,
    pub metadata: HashMap<String, String>,
}

/// Everything needed to back one device up once.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub device_id: String,
    pub device_name: String,
    pub ip: String,
    pub remote_db: String,
    pub dst_path: PathBuf,
}

impl BackupJob {
    /// Build a job from a device info snapshot. `None` when the snapshot
    /// lacks identity or enough detail to derive the destination path.
    pub fn from_device_info(results_dir: &Path, info: &InfoMap) -> Option<Self> {
        let device_id = info.get("id")?.as_str()?.to_string();
        let device_name = info.get("name")?.as_str()?.to_string();
        let ip = info.get("ip")?.as_str()?.to_string();
        if device_id.is_empty() || ip.is_empty() {
            return None;
        }
        let remote_db = info
            .get("db_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(engine::DEVICE_DB_NAME)
            .to_string();
        let dst_path = derive_backup_path(results_dir, info)?;
        Some(BackupJob {
            device_id,
            device_name,
            ip,
            remote_db,
            dst_path,
        })
    }
}

/// Reason a device is excluded from a sweep, if any.
pub fn should_skip_device(info: &InfoMap) -> Option<&'static str> {
    let status = info.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "offline" => Some("device is offline"),
        "unreached" => Some("device is unreached"),
        _ => {
            if info
                .get("skip_scanning")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                Some("device is not being scanned")
            } else {
                None
            }
        }
    }
}

/// Schedules backup engine runs across devices under a concurrency cap.
pub struct BackupCoordinator {
    statuses: DashMap<String, BackupStatus>,
    workers: Arc<Semaphore>,
    config: BackupConfig,
    results_dir: PathBuf,
    cancel: CancellationToken,
}

impl BackupCoordinator {
    pub fn new(results_dir: &Path, config: BackupConfig, cancel: CancellationToken) -> Arc<Self> {
        let workers = config.effective_workers();
        info!(workers, "backup coordinator ready");
        Arc::new(BackupCoordinator {
            statuses: DashMap::new(),
            workers: Arc::new(Semaphore::new(workers)),
            config,
            results_dir: results_dir.to_path_buf(),
            cancel,
        })
    }

    /// Snapshot of every device's backup record, keyed by device id.
    pub fn statuses_snapshot(&self) -> HashMap<String, BackupStatus> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn status_for(&self, device_id: &str) -> Option<BackupStatus> {
        self.statuses.get(device_id).map(|entry| entry.clone())
    }

    /// Run one backup job to completion, waiting for a worker slot first.
    pub async fn initiate_backup_job(&self, job: BackupJob) -> Result<BackupOutcome, BackupError> {
        let Ok(_permit) = self.workers.acquire().await else {
            // Semaphore closed: the coordinator is shutting down.
            return Err(BackupError::Locked(job.dst_path.clone()));
        };

        // A crashed job may have left its lock behind.
        marker::remove_stale_lock(
            &job.dst_path,
            Duration::from_secs(self.config.stale_lock_minutes * 60),
        );

        self.mark_started(&job);
        info!(
            device = %job.device_id,
            name = %job.device_name,
            dst = %job.dst_path.display(),
            "backup job starting"
        );

        let backup = MySqlToSqlite::new(&job.dst_path, &job.ip, &job.remote_db)
            .with_chunking(self.config.chunk_size, self.config.chunk_stop_threshold);
        let freshness = Duration::from_secs(self.config.freshness_hours * 3600);

        let result = backup.run(freshness).await;
        match &result {
            Ok(outcome) if outcome.skipped_recent => {
                debug!(device = %job.device_id, "backup skipped, recent marker");
                self.mark_skipped(&job);
            }
            Ok(outcome) => {
                info!(
                    device = %job.device_id,
                    tables = outcome.tables_synced,
                    rows = outcome.rows_copied,
                    partial = outcome.is_partial(),
                    "backup job finished"
                );
                let progress = backup.compare_databases(true).await;
                self.mark_success(&job, outcome, progress);
            }
            Err(BackupError::NotReady) => {
                // The device has not written its metadata yet; next poll
                // cycle will try again. Not an operator-facing failure.
                debug!(device = %job.device_id, "remote database not ready, will retry");
                self.mark_failure(&job, "database not ready");
            }
            Err(BackupError::Locked(path)) => {
                debug!(device = %job.device_id, path = %path.display(), "backup destination locked, skipping");
                self.mark_failure(&job, "destination locked by another job");
            }
            Err(err) => {
                error!(device = %job.device_id, error = %err, "backup job failed");
                self.mark_failure(&job, &err.to_string());
            }
        }
        result
    }

    /// Submit jobs for every eligible device in the given snapshots.
    /// Jobs run concurrently but the worker semaphore bounds parallelism.
    pub async fn sweep(self: &Arc<Self>, devices: Vec<InfoMap>) {
        let mut handles = Vec::new();
        for info in devices {
            if let Some(reason) = should_skip_device(&info) {
                if let Some(id) = info.get("id").and_then(Value::as_str) {
                    debug!(device = %id, reason, "sweep skipping device");
                }
                continue;
            }
            let Some(job) = BackupJob::from_device_info(&self.results_dir, &info) else {
                debug!("sweep skipping device without a derivable backup path");
                continue;
            };

            let coordinator = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _ = coordinator.initiate_backup_job(job).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Periodic sweep over the scanner registry until cancelled.
    pub fn start_periodic(self: &Arc<Self>, registry: Arc<ScanRegistry>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = coordinator.cancel.cancelled() => {
                        info!("backup coordinator stopping, no new sweeps");
                        return;
                    }
                }
                let devices = registry.get_all_devices_info().await;
                debug!(devices = devices.len(), "starting backup sweep");
                coordinator.sweep(devices.into_values().collect()).await;
            }
        });
    }

    fn mark_started(&self, job: &BackupJob) {
        let mut entry = self
            .statuses
            .entry(job.device_id.clone())
            .or_default();
        entry.name = job.device_name.clone();
        entry.status = "running".to_string();
        entry.started = Utc::now().timestamp();
        entry.processing = true;
        entry.metadata.remove("error");
    }

    fn mark_success(&self, job: &BackupJob, outcome: &BackupOutcome, progress: f64) {
        if let Some(mut entry) = self.statuses.get_mut(&job.device_id) {
            entry.status = if outcome.is_partial() {
                "partial".to_string()
            } else {
                "success".to_string()
            };
            entry.count += 1;
            entry.ended = Utc::now().timestamp();
            entry.processing = false;
            entry.synced.insert("sqlite".to_string(), true);
            if progress >= 0.0 {
                entry.progress.insert("sqlite".to_string(), progress);
            }
            if outcome.is_partial() {
                let failed: Vec<&str> = outcome
                    .failed_tables
                    .iter()
                    .map(|(table, _)| table.as_str())
                    .collect();
                entry
                    .metadata
                    .insert("failed_tables".to_string(), failed.join(","));
            }
        }
    }

    fn mark_skipped(&self, job: &BackupJob) {
        if let Some(mut entry) = self.statuses.get_mut(&job.device_id) {
            entry.status = "skipped-recent".to_string();
            entry.ended = Utc::now().timestamp();
            entry.processing = false;
        }
    }

    fn mark_failure(&self, job: &BackupJob, message: &str) {
        if let Some(mut entry) = self.statuses.get_mut(&job.device_id) {
            entry.status = "error".to_string();
            entry.ended = Utc::now().timestamp();
            entry.processing = false;
            entry.metadata.insert("error".to_string(), message.to_string());
        } else {
            warn!(device = %job.device_id, "failure for a device with no status record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(fields: &[(&str, Value)]) -> InfoMap {
        let mut map = InfoMap::new();
        for (key, value) in fields {
            map.insert(key.to_string(), value.clone());
        }
        map
    }

    fn running_device_info() -> InfoMap {
        info(&[
            ("id", json!("a82d746e370e15182d780d0f06fca03e")),
            ("name", json!("ETHOSCOPE_007")),
            ("ip", json!("192.168.1.27")),
            ("status", json!("running")),
            ("db_name", json!("ethoscope_db")),
            (
                "backup_filename",
                json!("2022-10-17_18-21-27_a82d746e370e15182d780d0f06fca03e.db"),
            ),
        ])
    }

    fn test_job() -> BackupJob {
        BackupJob {
            device_id: "a82d746e370e15182d780d0f06fca03e".to_string(),
            device_name: "ETHOSCOPE_007".to_string(),
            ip: "192.168.1.27".to_string(),
            remote_db: "ethoscope_db".to_string(),
            dst_path: PathBuf::from("/tmp/test.db"),
        }
    }

    fn coordinator() -> Arc<BackupCoordinator> {
        BackupCoordinator::new(
            Path::new("/tmp/results"),
            BackupConfig::default(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_skip_criteria() {
        assert_eq!(
            should_skip_device(&info(&[("status", json!("offline"))])),
            Some("device is offline")
        );
        assert_eq!(
            should_skip_device(&info(&[("status", json!("unreached"))])),
            Some("device is unreached")
        );
        assert_eq!(
            should_skip_device(&info(&[
                ("status", json!("stopped")),
                ("skip_scanning", json!(true)),
            ])),
            Some("device is not being scanned")
        );
        assert!(should_skip_device(&running_device_info()).is_none());
    }

    #[test]
    fn test_job_from_device_info() {
        let job = BackupJob::from_device_info(Path::new("/results"), &running_device_info())
            .expect("job built");
        assert_eq!(job.device_id, "a82d746e370e15182d780d0f06fca03e");
        assert_eq!(job.remote_db, "ethoscope_db");
        assert_eq!(
            job.dst_path,
            PathBuf::from(
                "/results/a82d746e370e15182d780d0f06fca03e/ETHOSCOPE_007/2022-10-17_18-21-27/2022-10-17_18-21-27_a82d746e370e15182d780d0f06fca03e.db"
            )
        );
    }

    #[test]
    fn test_job_requires_identity_and_path() {
        // No backup filename → no destination → no job.
        let partial = info(&[
            ("id", json!("abc")),
            ("name", json!("ETHOSCOPE_001")),
            ("ip", json!("10.0.0.5")),
            ("status", json!("running")),
        ]);
        assert!(BackupJob::from_device_info(Path::new("/results"), &partial).is_none());

        let mut no_id = running_device_info();
        no_id.remove("id");
        assert!(BackupJob::from_device_info(Path::new("/results"), &no_id).is_none());
    }

    #[test]
    fn test_missing_db_name_falls_back_to_default() {
        let mut snapshot = running_device_info();
        snapshot.remove("db_name");
        let job =
            BackupJob::from_device_info(Path::new("/results"), &snapshot).expect("job built");
        assert_eq!(job.remote_db, "ethoscope_db");
    }

    #[test]
    fn test_status_lifecycle() {
        let coordinator = coordinator();
        let job = test_job();

        coordinator.mark_started(&job);
        let status = coordinator.status_for(&job.device_id).unwrap();
        assert!(status.processing);
        assert_eq!(status.status, "running");
        assert_eq!(status.name, "ETHOSCOPE_007");
        assert!(status.started > 0);

        let outcome = BackupOutcome {
            skipped_recent: false,
            tables_synced: 24,
            rows_copied: 1000,
            failed_tables: Vec::new(),
        };
        coordinator.mark_success(&job, &outcome, 98.5);
        let status = coordinator.status_for(&job.device_id).unwrap();
        assert!(!status.processing);
        assert_eq!(status.status, "success");
        assert_eq!(status.count, 1);
        assert_eq!(status.synced.get("sqlite"), Some(&true));
        assert_eq!(status.progress.get("sqlite"), Some(&98.5));
        assert!(status.ended >= status.started);
    }

    #[test]
    fn test_status_records_partial_and_error() {
        let coordinator = coordinator();
        let job = test_job();

        coordinator.mark_started(&job);
        let outcome = BackupOutcome {
            skipped_recent: false,
            tables_synced: 20,
            rows_copied: 500,
            failed_tables: vec![("ROI_7".to_string(), "server has gone away".to_string())],
        };
        coordinator.mark_success(&job, &outcome, -1.0);
        let status = coordinator.status_for(&job.device_id).unwrap();
        assert_eq!(status.status, "partial");
        assert_eq!(status.metadata.get("failed_tables").unwrap(), "ROI_7");
        assert!(status.progress.is_empty(), "-1 progress is not recorded");

        coordinator.mark_started(&job);
        coordinator.mark_failure(&job, "connection refused");
        let status = coordinator.status_for(&job.device_id).unwrap();
        assert_eq!(status.status, "error");
        assert_eq!(status.metadata.get("error").unwrap(), "connection refused");
        assert!(!status.processing);
        // A later success clears the error flag.
        coordinator.mark_started(&job);
        let status = coordinator.status_for(&job.device_id).unwrap();
        assert!(!status.metadata.contains_key("error"));
    }

    #[test]
    fn test_backup_status_serialises_flat() {
        let mut status = BackupStatus::default();
        status.name = "ETHOSCOPE_007".to_string();
        status.status = "success".to_string();
        status.count = 3;
        status.synced.insert("sqlite".to_string(), true);
        status.progress.insert("sqlite".to_string(), 100.0);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["name"], "ETHOSCOPE_007");
        assert_eq!(value["count"], 3);
        assert_eq!(value["processing"], false);
        assert_eq!(value["synced"]["sqlite"], true);
        assert_eq!(value["progress"]["sqlite"], 100.0);
    }
}
