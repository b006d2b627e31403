//! mDNS-driven fleet scanner.
//!
//! Listens for `_ethoscope._tcp.local.` (acquisition devices) and
//! `_device._tcp.local.` (sensors) announcements, maintains one registry per
//! class, and owns the pollers. Devices are registered on first sight,
//! reactivated when a known identity reappears (possibly on a new address),
//! reset in place when a known address announces a new identity, and marked
//! offline — never deleted — when their service goes away.

pub mod registry;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::DeviceClient;
use crate::config::AppConfig;
use crate::db::ExperimentDb;
use crate::device::{Device, DeviceKind, InfoMap};
use crate::poller::{DevicePoller, SensorPoller};
use crate::status::{DeviceStatus, StatusName, TriggerSource};
use registry::ScanRegistry;

pub const ETHOSCOPE_SERVICE: &str = "_ethoscope._tcp.local.";
pub const SENSOR_SERVICE: &str = "_device._tcp.local.";

const POLLER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Split an instance name like
/// `ETHOSCOPE_170-170211ce7a844c23abc5ffe6ede1e154._ethoscope._tcp.local.`
/// into its human name and device id. Either part may be missing; TXT
/// records are the authoritative source when present.
pub fn parse_service_name(full_name: &str) -> (Option<String>, Option<String>) {
    let head = full_name.split('.').next().unwrap_or("");
    if head.is_empty() {
        return (None, None);
    }
    match head.split_once('-') {
        Some((name, id)) if !name.is_empty() && !id.is_empty() => {
            (Some(name.to_string()), Some(id.to_string()))
        }
        _ => (Some(head.to_string()), None),
    }
}

/// Discovers devices and owns the set of pollers.
pub struct FleetScanner {
    daemon: tokio::sync::Mutex<Option<ServiceDaemon>>,
    ethoscopes: Arc<ScanRegistry>,
    sensors: Arc<ScanRegistry>,
    expdb: ExperimentDb,
    config: AppConfig,
    cancel: CancellationToken,
    pollers: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    running: AtomicBool,
}

impl FleetScanner {
    pub fn new(expdb: ExperimentDb, config: AppConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(FleetScanner {
            daemon: tokio::sync::Mutex::new(None),
            ethoscopes: ScanRegistry::new(),
            sensors: ScanRegistry::new(),
            expdb,
            config,
            cancel,
            pollers: tokio::sync::Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> Arc<ScanRegistry> {
        Arc::clone(&self.ethoscopes)
    }

    pub fn sensor_registry(&self) -> Arc<ScanRegistry> {
        Arc::clone(&self.sensors)
    }

    /// Begin listening. Idempotent: a second call on a running scanner is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("scanner already running");
            return Ok(());
        }

        let daemon = ServiceDaemon::new()
            .map_err(|e| anyhow::anyhow!("could not create mDNS daemon: {e}"))?;

        for (service_type, kind) in [
            (ETHOSCOPE_SERVICE, DeviceKind::Ethoscope),
            (SENSOR_SERVICE, DeviceKind::Sensor),
        ] {
            let receiver = daemon
                .browse(service_type)
                .map_err(|e| anyhow::anyhow!("could not browse {service_type}: {e}"))?;

            let scanner = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = scanner.cancel.cancelled() => return,
                        event = receiver.recv_async() => match event {
                            Ok(event) => scanner.handle_event(kind, event).await,
                            Err(err) => {
                                warn!(error = %err, "mDNS receiver closed");
                                return;
                            }
                        }
                    }
                }
            });
        }

        *self.daemon.lock().await = Some(daemon);
        info!(
            ethoscopes = ETHOSCOPE_SERVICE,
            sensors = SENSOR_SERVICE,
            "fleet scanner listening"
        );
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, kind: DeviceKind, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(ip) = info
                    .get_addresses()
                    .iter()
                    .next()
                    .map(|addr| addr.to_ip_addr().to_string())
                else {
                    debug!(service = %info.get_fullname(), "resolved service with no address");
                    return;
                };
                let full_name = info.get_fullname().to_string();
                let txt_name = info.get_property_val_str("MACHINE_NAME").map(str::to_string);
                let txt_id = info.get_property_val_str("MACHINE_ID").map(str::to_string);
                self.add_service(
                    kind,
                    &full_name,
                    &ip,
                    info.get_port(),
                    txt_name.as_deref(),
                    txt_id.as_deref(),
                )
                .await;
            }
            ServiceEvent::ServiceRemoved(_service_type, full_name) => {
                self.remove_service(kind, &full_name).await;
            }
            ServiceEvent::SearchStarted(ty) => debug!(service = %ty, "mDNS search started"),
            ServiceEvent::SearchStopped(ty) => debug!(service = %ty, "mDNS search stopped"),
            ServiceEvent::ServiceFound(ty, name) => {
                debug!(service = %ty, name = %name, "mDNS service found")
            }
            _ => {}
        }
    }

    /// A service announcement resolved. Establish identity (TXT records
    /// first, then the instance name, then the device's own `/id` endpoint)
    /// and register.
    pub async fn add_service(
        self: &Arc<Self>,
        kind: DeviceKind,
        full_name: &str,
        ip: &str,
        port: u16,
        txt_name: Option<&str>,
        txt_id: Option<&str>,
    ) {
        let (parsed_name, parsed_id) = parse_service_name(full_name);
        let name = txt_name
            .map(str::to_string)
            .or(parsed_name)
            .unwrap_or_default();
        let id = match txt_id.map(str::to_string).or(parsed_id) {
            Some(id) => id,
            None => match self.fetch_device_id(ip, port).await {
                Some(id) => id,
                None => {
                    warn!(
                        service = %full_name,
                        ip = %ip,
                        "could not establish device identity, ignoring announcement"
                    );
                    return;
                }
            },
        };
        self.register_device(kind, &id, &name, ip, port, full_name)
            .await;
    }

    async fn fetch_device_id(&self, ip: &str, port: u16) -> Option<String> {
        let client = DeviceClient::new(ip, port, self.cancel.child_token());
        let response = client.get_json("id").await.ok()?;
        response
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    /// Registry bookkeeping for one resolved device.
    pub async fn register_device(
        self: &Arc<Self>,
        kind: DeviceKind,
        id: &str,
        name: &str,
        ip: &str,
        port: u16,
        service_name: &str,
    ) -> Arc<Device> {
        let registry = self.registry_for(kind);

        if let Some(existing) = registry.get(id).await {
            info!(device = %id, name = %name, ip = %ip, "known device back online");
            existing.reactivate(ip, port).await;
            existing.set_service_name(service_name).await;
            return existing;
        }

        if let Some(at_ip) = registry.find_by_ip(ip).await {
            let old_id = at_ip.id().await;
            if !old_id.is_empty() && old_id != id {
                warn!(
                    ip = %ip,
                    old = %old_id,
                    new = %id,
                    "device at a known address changed identity, resetting its record"
                );
                at_ip.reset_for_new_identity(id).await;
                at_ip.reactivate(ip, port).await;
                at_ip.set_service_name(service_name).await;
                registry.rekey(&old_id, Arc::clone(&at_ip)).await;
                return at_ip;
            }
        }

        let device = Arc::new(Device::new(kind, id, name, ip, port));
        device.set_service_name(service_name).await;
        registry.insert(Arc::clone(&device)).await;
        info!(
            kind = ?kind,
            device = %id,
            name = %name,
            ip = %ip,
            port,
            "new device registered"
        );
        self.spawn_poller(kind, Arc::clone(&device)).await;
        device
    }

    async fn spawn_poller(self: &Arc<Self>, kind: DeviceKind, device: Arc<Device>) {
        let id = device.id().await;
        let handle = match kind {
            DeviceKind::Ethoscope => DevicePoller::spawn(
                device,
                self.expdb.clone(),
                self.config.clone(),
                self.cancel.child_token(),
            ),
            DeviceKind::Sensor => {
                SensorPoller::spawn(device, self.config.clone(), self.cancel.child_token())
            }
        };
        self.pollers.lock().await.insert(id, handle);
    }

    /// A service said goodbye. The record survives with its last-known state
    /// so the fleet view can still show it; only scanning stops.
    pub async fn remove_service(&self, kind: DeviceKind, full_name: &str) {
        let registry = self.registry_for(kind);

        let device = match registry.find_by_service_name(full_name).await {
            Some(device) => device,
            None => {
                // Older announcements may never have recorded a service
                // name; fall back to the id embedded in the instance name.
                let (_, id) = parse_service_name(full_name);
                match id {
                    Some(id) => match registry.get(&id).await {
                        Some(device) => device,
                        None => return,
                    },
                    None => return,
                }
            }
        };

        let id = device.id().await;
        info!(device = %id, service = %full_name, "device service gone, marking offline");

        let mut state = device.state_mut().await;
        state.skip_scanning = true;
        if state.status.status_name != StatusName::Offline {
            let mut status = DeviceStatus::new(StatusName::Offline, TriggerSource::Graceful);
            status.set_previous(state.status.clone());
            state.status = status;
        }
        state.info.insert("status".into(), json!("offline"));
    }

    fn registry_for(&self, kind: DeviceKind) -> Arc<ScanRegistry> {
        match kind {
            DeviceKind::Ethoscope => Arc::clone(&self.ethoscopes),
            DeviceKind::Sensor => Arc::clone(&self.sensors),
        }
    }

    pub async fn get_device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.ethoscopes.get(device_id).await
    }

    /// The full fleet view: every active device the experiment DB remembers
    /// (shown offline), overlaid with everything currently registered, plus
    /// backup-file enrichment.
    pub async fn get_all_devices_info(&self) -> BTreeMap<String, InfoMap> {
        let mut out = BTreeMap::new();

        for record in self.expdb.get_all_ethoscopes().await {
            if !record.active || record.ethoscope_id.is_empty() {
                continue;
            }
            if record.ethoscope_name.is_empty() && record.last_ip.is_empty() {
                continue;
            }
            let mut info = InfoMap::new();
            info.insert("id".into(), json!(record.ethoscope_id));
            info.insert("name".into(), json!(record.ethoscope_name));
            info.insert("status".into(), json!("offline"));
            info.insert("ip".into(), json!(record.last_ip));
            info.insert("time".into(), json!(record.last_seen));
            out.insert(record.ethoscope_id.clone(), info);
        }

        for (id, mut info) in self.ethoscopes.get_all_devices_info().await {
            enrich_with_backup_file(&mut info);
            out.insert(id, info);
        }
        out
    }

    pub async fn get_sensors_info(&self) -> BTreeMap<String, InfoMap> {
        self.sensors.get_all_devices_info().await
    }

    /// Flip a device's `active` flag in the experiment DB.
    pub async fn retire_device(&self, device_id: &str, active: bool) -> Result<Value> {
        let record = self
            .expdb
            .retire_ethoscope(device_id, active)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no such device: {device_id}"))?;
        Ok(json!({"id": record.ethoscope_id, "active": record.active}))
    }

    /// Dispose of every poller (5 s join each, abort stragglers) and close
    /// the mDNS listener.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let mut pollers = self.pollers.lock().await;
        for (id, mut handle) in pollers.drain() {
            if tokio::time::timeout(POLLER_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!(device = %id, "poller did not stop in time, aborting it");
                handle.abort();
            }
        }
        drop(pollers);

        if let Some(daemon) = self.daemon.lock().await.take() {
            if let Err(err) = daemon.shutdown() {
                warn!(error = %err, "mDNS daemon shutdown failed");
            }
        }
        info!("fleet scanner stopped");
    }
}

/// Attach `backup_size` and `time_since_backup` from the replica on disk.
fn enrich_with_backup_file(info: &mut InfoMap) {
    let Some(path) = info
        .get("backup_path")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
    else {
        return;
    };
    let Ok(meta) = std::fs::metadata(&path) else {
        return;
    };
    info.insert("backup_size".into(), json!(meta.len()));
    if let Ok(modified) = meta.modified() {
        if let Ok(age) = SystemTime::now().duration_since(modified) {
            info.insert("time_since_backup".into(), json!(age.as_secs()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scanner() -> Arc<FleetScanner> {
        let expdb = ExperimentDb::open(":memory:").await.expect("db opens");
        FleetScanner::new(expdb, AppConfig::default(), CancellationToken::new())
    }

    #[test]
    fn test_parse_service_name() {
        assert_eq!(
            parse_service_name(
                "ETHOSCOPE_170-170211ce7a844c23abc5ffe6ede1e154._ethoscope._tcp.local."
            ),
            (
                Some("ETHOSCOPE_170".to_string()),
                Some("170211ce7a844c23abc5ffe6ede1e154".to_string())
            )
        );
        assert_eq!(
            parse_service_name("ETHOSCOPE_007._ethoscope._tcp.local."),
            (Some("ETHOSCOPE_007".to_string()), None)
        );
        assert_eq!(parse_service_name(""), (None, None));
    }

    #[tokio::test]
    async fn test_register_new_device() {
        let scanner = scanner().await;
        let device = scanner
            .register_device(
                DeviceKind::Ethoscope,
                "a82d746e370e15182d780d0f06fca03e",
                "ETHOSCOPE_007",
                "192.168.1.27",
                9000,
                "ETHOSCOPE_007-a82d._ethoscope._tcp.local.",
            )
            .await;

        assert_eq!(device.name().await, "ETHOSCOPE_007");
        assert!(scanner
            .registry()
            .contains("a82d746e370e15182d780d0f06fca03e")
            .await);
        // Fresh devices start offline until their poller reaches them.
        assert_eq!(device.status().await.status_name, StatusName::Offline);
    }

    #[tokio::test]
    async fn test_known_id_on_new_ip_reactivates() {
        let scanner = scanner().await;
        let first = scanner
            .register_device(
                DeviceKind::Ethoscope,
                "dev-1",
                "ETHOSCOPE_001",
                "192.168.1.10",
                9000,
                "svc-1",
            )
            .await;
        first.set_skip_scanning(true).await;

        let second = scanner
            .register_device(
                DeviceKind::Ethoscope,
                "dev-1",
                "ETHOSCOPE_001",
                "192.168.1.99",
                9000,
                "svc-1",
            )
            .await;

        assert!(Arc::ptr_eq(&first, &second), "same record is reused");
        assert_eq!(second.ip().await, "192.168.1.99");
        assert!(!second.skip_scanning().await, "reactivation resumes scanning");
        assert_eq!(scanner.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_new_id_on_known_ip_resets_record() {
        let scanner = scanner().await;
        let original = scanner
            .register_device(
                DeviceKind::Ethoscope,
                "old-id",
                "ETHOSCOPE_001",
                "192.168.1.10",
                9000,
                "svc-old",
            )
            .await;
        {
            let mut state = original.state_mut().await;
            state.info.insert("experiment".into(), json!("leftover"));
        }

        let reimaged = scanner
            .register_device(
                DeviceKind::Ethoscope,
                "new-id",
                "ETHOSCOPE_001",
                "192.168.1.10",
                9000,
                "svc-new",
            )
            .await;

        assert!(Arc::ptr_eq(&original, &reimaged), "slot kept");
        assert_eq!(reimaged.id().await, "new-id");
        let registry = scanner.registry();
        assert!(registry.contains("new-id").await);
        assert!(!registry.contains("old-id").await);
        let state = reimaged.state_mut().await;
        assert!(state.info.is_empty(), "stale info cleared");
    }

    #[tokio::test]
    async fn test_remove_service_marks_offline_but_keeps_record() {
        let scanner = scanner().await;
        let device = scanner
            .register_device(
                DeviceKind::Ethoscope,
                "dev-1",
                "ETHOSCOPE_001",
                "192.168.1.10",
                9000,
                "ETHOSCOPE_001-dev1._ethoscope._tcp.local.",
            )
            .await;
        {
            // Simulate a device that was running.
            let mut state = device.state_mut().await;
            let mut status = DeviceStatus::new(StatusName::Running, TriggerSource::System);
            status.set_previous(state.status.clone());
            state.status = status;
        }

        scanner
            .remove_service(
                DeviceKind::Ethoscope,
                "ETHOSCOPE_001-dev1._ethoscope._tcp.local.",
            )
            .await;

        assert!(scanner.registry().contains("dev-1").await, "never deleted");
        assert!(device.skip_scanning().await);
        let status = device.status().await;
        assert_eq!(status.status_name, StatusName::Offline);
        assert!(
            !status.should_send_alert(),
            "an orderly goodbye is not an alert"
        );
    }

    #[tokio::test]
    async fn test_fleet_view_seeds_offline_devices_from_expdb() {
        let scanner = scanner().await;
        scanner
            .expdb
            .update_ethoscope(
                "ghost-id",
                crate::db::EthoscopeUpdate {
                    name: Some("ETHOSCOPE_099".to_string()),
                    last_ip: Some("192.168.1.99".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        scanner
            .register_device(
                DeviceKind::Ethoscope,
                "live-id",
                "ETHOSCOPE_001",
                "192.168.1.10",
                9000,
                "svc",
            )
            .await;

        let fleet = scanner.get_all_devices_info().await;
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet["ghost-id"]["status"], "offline");
        assert_eq!(fleet["ghost-id"]["name"], "ETHOSCOPE_099");
        assert_eq!(fleet["live-id"]["name"], "ETHOSCOPE_001");
    }

    #[tokio::test]
    async fn test_retired_devices_drop_out_of_fleet_view() {
        let scanner = scanner().await;
        scanner
            .expdb
            .update_ethoscope(
                "ghost-id",
                crate::db::EthoscopeUpdate {
                    name: Some("ETHOSCOPE_099".to_string()),
                    last_ip: Some("192.168.1.99".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = scanner.retire_device("ghost-id", false).await.unwrap();
        assert_eq!(result["active"], false);

        let fleet = scanner.get_all_devices_info().await;
        assert!(fleet.is_empty());
    }
}
