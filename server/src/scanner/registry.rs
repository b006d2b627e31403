//! Thread-safe device registry.
//!
//! Devices are keyed by identifier and never removed: a device that goes
//! offline keeps its slot so the fleet view can show its last-known state.
//! A single lock serialises all mutations; readers take snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::device::{Device, InfoMap};

#[derive(Default)]
pub struct ScanRegistry {
    devices: RwLock<BTreeMap<String, Arc<Device>>>,
}

impl ScanRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ScanRegistry::default())
    }

    pub async fn insert(&self, device: Arc<Device>) {
        let id = device.id().await;
        self.devices.write().await.insert(id, device);
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Move a record to a new identifier (the device behind an address was
    /// reimaged). The record itself is preserved.
    pub async fn rekey(&self, old_id: &str, device: Arc<Device>) {
        let new_id = device.id().await;
        let mut devices = self.devices.write().await;
        devices.remove(old_id);
        devices.insert(new_id, device);
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// IP-indexed lookup used during discovery: a known address announcing a
    /// new identity means the device was reimaged.
    pub async fn find_by_ip(&self, ip: &str) -> Option<Arc<Device>> {
        for device in self.devices.read().await.values() {
            if device.ip().await == ip {
                return Some(Arc::clone(device));
            }
        }
        None
    }

    pub async fn find_by_service_name(&self, service_name: &str) -> Option<Arc<Device>> {
        for device in self.devices.read().await.values() {
            if device.service_name().await.as_deref() == Some(service_name) {
                return Some(Arc::clone(device));
            }
        }
        None
    }

    /// Snapshot every device's info, keyed by id. Malformed historical
    /// entries (no id, or neither name nor address) are filtered out.
    pub async fn get_all_devices_info(&self) -> BTreeMap<String, InfoMap> {
        let devices = self.devices.read().await;
        let mut out = BTreeMap::new();
        for (id, device) in devices.iter() {
            if id.is_empty() {
                continue;
            }
            let info = device.snapshot_info().await;
            let name = info.get("name").and_then(Value::as_str).unwrap_or("");
            let ip = info.get("ip").and_then(Value::as_str).unwrap_or("");
            if name.is_empty() && ip.is_empty() {
                continue;
            }
            out.insert(id.clone(), info);
        }
        out
    }
}
