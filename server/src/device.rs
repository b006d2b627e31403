//! Device records and the operator instruction table.
//!
//! A [`Device`] is one row of the fleet: identity, address, the opaque info
//! map the device last reported, and the status chain. Records are created at
//! discovery and mutated only by the owning poller; everyone else reads
//! snapshots.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::status::{DeviceStatus, StatusName, TriggerSource};

/// Default control-API port for ethoscopes.
pub const ETHOSCOPE_PORT: u16 = 9000;

/// Placeholder devices used on the bench; never persisted to the experiment DB.
pub fn is_placeholder_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    upper.contains("ETHOSCOPE_000") || upper.contains("ETHOSCOPE_OOO")
}

/// The two device classes the node manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ethoscope,
    Sensor,
}

/// Operator instructions relayed to a device's `/controls` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Start,
    StartRecord,
    Stream,
    Stop,
    Poweroff,
    Reboot,
    Restart,
    Dumpdb,
    Convertvideos,
    TestModule,
    Offline,
}

impl Instruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Instruction::Start => "start",
            Instruction::StartRecord => "start_record",
            Instruction::Stream => "stream",
            Instruction::Stop => "stop",
            Instruction::Poweroff => "poweroff",
            Instruction::Reboot => "reboot",
            Instruction::Restart => "restart",
            Instruction::Dumpdb => "dumpdb",
            Instruction::Convertvideos => "convertvideos",
            Instruction::TestModule => "test_module",
            Instruction::Offline => "offline",
        }
    }

    /// Statuses from which this instruction may be dispatched.
    pub fn allowed_from(&self) -> &'static [StatusName] {
        match self {
            Instruction::Stop => &[
                StatusName::Streaming,
                StatusName::Running,
                StatusName::Recording,
            ],
            Instruction::Offline => &[],
            _ => &[StatusName::Stopped],
        }
    }

    pub fn is_allowed_from(&self, status: StatusName) -> bool {
        self.allowed_from().contains(&status)
    }

    /// Power-cycling commands succeed by the device going away, so the
    /// poller must not treat a missing response as failure.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Instruction::Poweroff | Instruction::Reboot | Instruction::Restart
        )
    }
}

impl FromStr for Instruction {
    type Err = InstructionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Instruction::Start),
            "start_record" => Ok(Instruction::StartRecord),
            "stream" => Ok(Instruction::Stream),
            "stop" => Ok(Instruction::Stop),
            "poweroff" => Ok(Instruction::Poweroff),
            "reboot" => Ok(Instruction::Reboot),
            "restart" => Ok(Instruction::Restart),
            "dumpdb" => Ok(Instruction::Dumpdb),
            "convertvideos" => Ok(Instruction::Convertvideos),
            "test_module" => Ok(Instruction::TestModule),
            "offline" => Ok(Instruction::Offline),
            other => Err(InstructionError::Unknown(other.to_string())),
        }
    }
}

/// Why an instruction was rejected before reaching the device.
#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("unknown instruction '{0}'")]
    Unknown(String),

    #[error("cannot send '{instruction}' to a device in status {status}")]
    NotAllowed {
        instruction: &'static str,
        status: StatusName,
    },
}

/// Opaque key→value mapping reported by a device.
pub type InfoMap = serde_json::Map<String, Value>;

/// Mutable per-device state, owned by the poller.
#[derive(Debug)]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub info: InfoMap,
    pub status: DeviceStatus,
    pub skip_scanning: bool,
    /// Consecutive ECONNREFUSED observations.
    pub refused_in_a_row: u32,
    /// The mDNS service name this record was registered under.
    pub service_name: Option<String>,
    /// Status an operator command should land the device in; the next poll
    /// that observes it is attributed to the user.
    pub expected_status: Option<StatusName>,
}

/// A discovered acquisition node (or sensor).
#[derive(Debug)]
pub struct Device {
    kind: DeviceKind,
    state: RwLock<DeviceState>,
}

impl Device {
    pub fn new(kind: DeviceKind, id: &str, name: &str, ip: &str, port: u16) -> Self {
        Device {
            kind,
            state: RwLock::new(DeviceState {
                id: id.to_string(),
                name: name.to_string(),
                ip: ip.to_string(),
                port,
                info: InfoMap::new(),
                status: DeviceStatus::new(StatusName::Offline, TriggerSource::InitialDiscovery),
                skip_scanning: false,
                refused_in_a_row: 0,
                service_name: None,
                expected_status: None,
            }),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub async fn id(&self) -> String {
        self.state.read().await.id.clone()
    }

    pub async fn name(&self) -> String {
        self.state.read().await.name.clone()
    }

    pub async fn ip(&self) -> String {
        self.state.read().await.ip.clone()
    }

    pub async fn port(&self) -> u16 {
        self.state.read().await.port
    }

    pub async fn status(&self) -> DeviceStatus {
        self.state.read().await.status.clone()
    }

    pub async fn skip_scanning(&self) -> bool {
        self.state.read().await.skip_scanning
    }

    pub async fn set_skip_scanning(&self, value: bool) {
        self.state.write().await.skip_scanning = value;
    }

    pub async fn set_service_name(&self, name: &str) {
        self.state.write().await.service_name = Some(name.to_string());
    }

    pub async fn service_name(&self) -> Option<String> {
        self.state.read().await.service_name.clone()
    }

    /// Exclusive access for the owning poller.
    pub async fn state_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, DeviceState> {
        self.state.write().await
    }

    /// A point-in-time copy of the info map, with identity and status fields
    /// merged in the way the JSON boundary expects.
    pub async fn snapshot_info(&self) -> InfoMap {
        let state = self.state.read().await;
        let mut info = state.info.clone();
        info.insert("id".into(), Value::String(state.id.clone()));
        info.insert("name".into(), Value::String(state.name.clone()));
        info.insert("ip".into(), Value::String(state.ip.clone()));
        info.insert(
            "status".into(),
            Value::String(state.status.status_name.as_str().to_string()),
        );
        info.insert("skip_scanning".into(), Value::Bool(state.skip_scanning));
        info
    }

    /// The device at this IP was reimaged: same slot, new identity.
    pub async fn reset_for_new_identity(&self, new_id: &str) {
        let mut state = self.state.write().await;
        state.id = new_id.to_string();
        state.info.clear();
        state.refused_in_a_row = 0;
        let mut status = DeviceStatus::new(StatusName::Offline, TriggerSource::InitialDiscovery);
        status.set_previous(state.status.clone());
        state.status = status;
    }

    /// A previously-known device reappeared, possibly at a new address.
    pub async fn reactivate(&self, ip: &str, port: u16) {
        let mut state = self.state.write().await;
        state.ip = ip.to_string();
        state.port = port;
        state.skip_scanning = false;
        state.refused_in_a_row = 0;
    }

    /// Validate an instruction against the current status without touching
    /// the network.
    pub async fn check_instruction(&self, instruction: Instruction) -> Result<(), InstructionError> {
        let status = self.state.read().await.status.status_name;
        if instruction.is_allowed_from(status) {
            Ok(())
        } else {
            Err(InstructionError::NotAllowed {
                instruction: instruction.as_str(),
                status,
            })
        }
    }
}

/// Derive the on-disk backup path from a device's reported info.
///
/// `backup_filename` looks like `2022-10-17_18-21-27_<device_id>.db` and maps
/// to `<results>/<device_id>/<device_name>/2022-10-17_18-21-27/<filename>`.
/// A stopped device reports the file of its *previous* run, so prefer
/// `previous_backup_filename` in that state.
pub fn derive_backup_path(results_dir: &Path, info: &InfoMap) -> Option<PathBuf> {
    let status = info.get("status").and_then(Value::as_str).unwrap_or("");
    let name = info.get("name").and_then(Value::as_str)?;

    let filename = if status == "stopped" {
        info.get("previous_backup_filename").and_then(Value::as_str)
    } else {
        info.get("backup_filename").and_then(Value::as_str)
    }
    .filter(|f| !f.is_empty())?;

    let (stamp, device_id) = parse_backup_filename(filename)?;
    Some(
        results_dir
            .join(device_id)
            .join(name)
            .join(stamp)
            .join(filename),
    )
}

/// Split `<date>_<time>_<id>.db` into (`<date>_<time>`, `<id>`).
pub fn parse_backup_filename(filename: &str) -> Option<(String, &str)> {
    let stem = filename.strip_suffix(".db")?;
    let mut parts = stem.splitn(3, '_');
    let date = parts.next()?;
    let time = parts.next()?;
    let device_id = parts.next()?;
    if date.is_empty() || time.is_empty() || device_id.is_empty() {
        return None;
    }
    Some((format!("{date}_{time}"), device_id))
}

/// Filename an old-firmware device would have reported, synthesised from the
/// unix timestamp stored in its `METADATA` table.
pub fn backup_filename_for(timestamp: i64, device_id: &str) -> String {
    let formatted = chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d_%H-%M-%S").to_string())
        .unwrap_or_else(|| "1970-01-01_00-00-00".to_string());
    format!("{formatted}_{device_id}.db")
}
