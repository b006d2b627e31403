//! Per-device polling workers.
//!
//! One logical worker per registered device. Each pass interrogates the
//! device over HTTP, reconciles the observed status into the status chain,
//! emits transition events into the experiment database, and keeps the
//! device's backup bookkeeping fresh. Network failures feed the error
//! counters that eventually park a device (`skip_scanning`) instead of
//! hammering a dead address.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::engine;
use crate::client::{DeviceClient, ScanError};
use crate::config::AppConfig;
use crate::db::{EthoscopeUpdate, ExperimentDb, NewRun};
use crate::device::{
    derive_backup_path, is_placeholder_name, parse_backup_filename, Device, InfoMap, Instruction,
    InstructionError,
};
use crate::status::{DeviceStatus, StatusName, TriggerSource};

/// Something the rest of the system must be told about a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    /// `offline → *`: persist the device's identity.
    DeviceAppeared,
    /// `initialising → running`: a tracking run started.
    RunStarted,
    /// `initialising → stopping`: the device aborted on its own.
    RunSelfStopped,
    /// `running → stopped`: the operator ended the run.
    RunStopped,
    /// `running → unreached`: the run is in trouble; persist as unreached.
    RunInterrupted,
    /// `stopped → unreached`: an idle device dropped off; persist as offline.
    WentUnreachedIdle,
}

/// The state-transition table driving event emission.
pub fn transition_event(prev: StatusName, new: StatusName) -> Option<TransitionEvent> {
    use StatusName::*;
    match (prev, new) {
        (Offline, n) if n != Offline => Some(TransitionEvent::DeviceAppeared),
        (Initialising, Running) => Some(TransitionEvent::RunStarted),
        (Initialising, Stopping) => Some(TransitionEvent::RunSelfStopped),
        (Running, Stopped) => Some(TransitionEvent::RunStopped),
        (Running, Unreached) => Some(TransitionEvent::RunInterrupted),
        (Stopped, Unreached) => Some(TransitionEvent::WentUnreachedIdle),
        _ => None,
    }
}

/// How loudly to report the nth consecutive failure for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerbosity {
    Debug,
    Info,
    Warn,
}

pub fn verbosity_for_error_count(count: u32) -> ErrorVerbosity {
    match count {
        1 => ErrorVerbosity::Info,
        c if c >= 5 => ErrorVerbosity::Warn,
        _ => ErrorVerbosity::Debug,
    }
}

/// Status a successfully dispatched instruction should land the device in.
/// Observing it on the next poll attributes the transition to the operator.
pub fn expected_status_for(instruction: Instruction) -> Option<StatusName> {
    match instruction {
        Instruction::Start | Instruction::StartRecord => Some(StatusName::Initialising),
        Instruction::Stream => Some(StatusName::Streaming),
        Instruction::Stop => Some(StatusName::Stopped),
        _ => None,
    }
}

/// Errors surfaced to operators dispatching commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    NotAllowed(#[from] InstructionError),

    #[error(transparent)]
    Network(#[from] ScanError),
}

fn client_for(ip: &str, port: u16, cancel: CancellationToken) -> DeviceClient {
    DeviceClient::new(ip, port, cancel)
}

async fn device_client(device: &Device) -> DeviceClient {
    client_for(&device.ip().await, device.port().await, CancellationToken::new())
}

/// Relay an operator instruction to the device.
///
/// A disallowed instruction fails locally without touching the network.
/// Power-cycling commands succeed by the device disappearing, so network
/// errors on those are expected and swallowed.
pub async fn send_instruction(
    device: &Device,
    instruction: Instruction,
    payload: Value,
) -> Result<Value, CommandError> {
    device.check_instruction(instruction).await?;

    let id = device.id().await;
    let client = device_client(device).await;
    let path = format!("controls/{id}/{}", instruction.as_str());

    let response = match client.post_json_once(&path, &payload).await {
        Ok(value) => value,
        Err(err) if !instruction.expects_response() && err.is_network() => {
            debug!(
                device = %id,
                instruction = instruction.as_str(),
                "no response to power command; the device went away as intended"
            );
            Value::Null
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(expected) = expected_status_for(instruction) {
        device.state_mut().await.expected_status = Some(expected);
    }
    Ok(response)
}

/// Push a settings update; the device reports whether anything changed.
pub async fn send_settings(device: &Device, payload: Value) -> Result<Value, CommandError> {
    let id = device.id().await;
    let client = device_client(device).await;
    Ok(client.post_json(&format!("update/{id}"), &payload).await?)
}

/// Hardware metadata (`/machine/<id>`).
pub async fn machine_info(device: &Device) -> Result<Value, ScanError> {
    let id = device.id().await;
    device_client(device).await.get_json(&format!("machine/{id}")).await
}

/// Connected stimulator module (`/module/<id>`). Probing opens a serial
/// connection on the device, which is slow; give it extra time.
pub async fn connected_module(device: &Device) -> Result<Value, ScanError> {
    let id = device.id().await;
    device_client(device)
        .await
        .get_json_with(&format!("module/{id}"), Duration::from_secs(12))
        .await
}

pub async fn user_options(device: &Device) -> Result<Value, ScanError> {
    let id = device.id().await;
    device_client(device)
        .await
        .get_json(&format!("user_options/{id}"))
        .await
}

pub async fn videofiles(device: &Device) -> Result<Value, ScanError> {
    let id = device.id().await;
    device_client(device)
        .await
        .get_json(&format!("data/listfiles/video/{id}"))
        .await
}

pub async fn device_log(device: &Device) -> Result<Value, ScanError> {
    let id = device.id().await;
    device_client(device)
        .await
        .get_json(&format!("data/log/{id}"))
        .await
}

/// Trigger an on-device SQL dump.
pub async fn dump_sql_db(device: &Device) -> Result<Value, ScanError> {
    let id = device.id().await;
    device_client(device)
        .await
        .get_json_with(&format!("dumpSQLdb/{id}"), Duration::from_secs(3))
        .await
}

/// URL of the last image the tracker drew. Only meaningful while the device
/// is in a stoppable (actively tracking) state.
pub async fn last_image_url(device: &Device) -> Result<String, ScanError> {
    let status = device.status().await.status_name;
    if !Instruction::Stop.is_allowed_from(status) {
        return Err(ScanError::Device(format!(
            "no last image while device is {status}"
        )));
    }
    static_image_url(device, "last_drawn_img").await
}

/// URL of the tracker's debug image.
pub async fn dbg_img_url(device: &Device) -> Result<String, ScanError> {
    static_image_url(device, "dbg_img").await
}

async fn static_image_url(device: &Device, key: &str) -> Result<String, ScanError> {
    let state = device.state_mut().await;
    let path = state
        .info
        .get(key)
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ScanError::Device(format!("device reports no {key}")))?
        .to_string();
    let base = format!("http://{}:{}", state.ip, state.port);
    drop(state);
    Ok(format!("{base}/static/{}", path.trim_start_matches('/')))
}

/// `machine_info` response → one-line description for the experiment DB.
pub fn describe_machine(info: &Value) -> String {
    match (
        info.get("kernel").and_then(Value::as_str),
        info.get("pi_version"),
    ) {
        (Some(kernel), Some(pi)) => {
            let pi = pi.as_str().map(str::to_string).unwrap_or_else(|| pi.to_string());
            format!("{kernel} on pi{pi}")
        }
        _ => String::new(),
    }
}

/// Pull the run id out of a device info snapshot.
pub fn run_id_of(info: &InfoMap) -> Option<String> {
    let run_id = info.get("experimental_info")?.get("run_id")?;
    match run_id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn experimental_field(info: &InfoMap, key: &str) -> String {
    info.get("experimental_info")
        .and_then(|v| v.get(key))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// The per-ethoscope polling worker.
pub struct DevicePoller {
    device: Arc<Device>,
    expdb: ExperimentDb,
    config: AppConfig,
    cancel: CancellationToken,
}

impl DevicePoller {
    pub fn new(
        device: Arc<Device>,
        expdb: ExperimentDb,
        config: AppConfig,
        cancel: CancellationToken,
    ) -> Self {
        DevicePoller {
            device,
            expdb,
            config,
            cancel,
        }
    }

    pub fn spawn(
        device: Arc<Device>,
        expdb: ExperimentDb,
        config: AppConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let poller = DevicePoller::new(device, expdb, config, cancel);
        tokio::spawn(poller.run())
    }

    pub async fn run(self) {
        let device_id = self.device.id().await;
        info!(device = %device_id, "poller started");

        let diff_interval = Duration::from_secs(self.config.scanner.diff_interval_secs);
        // Backdate so the first pass also refreshes the backup progress.
        let mut last_diff_check = Instant::now()
            .checked_sub(diff_interval)
            .unwrap_or_else(Instant::now);

        loop {
            let period = self.effective_refresh_period().await;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(device = %device_id, "poller stopping");
                    return;
                }
                _ = tokio::time::sleep(period) => {}
            }

            if self.device.skip_scanning().await {
                self.reset_offline().await;
                continue;
            }

            self.poll_pass(&mut last_diff_check, diff_interval).await;
        }
    }

    /// 5 s normally; devices that report `busy` are running an expensive
    /// on-device operation and are polled once a minute.
    async fn effective_refresh_period(&self) -> Duration {
        if self.device.status().await.status_name == StatusName::Busy {
            Duration::from_secs(self.config.scanner.busy_refresh_period_secs)
        } else {
            Duration::from_secs(self.config.scanner.refresh_period_secs)
        }
    }

    async fn reset_offline(&self) {
        let mut state = self.device.state_mut().await;
        if state.status.status_name != StatusName::Offline {
            let mut status = DeviceStatus::new(StatusName::Offline, TriggerSource::System);
            status.set_previous(state.status.clone());
            state.status = status;
        }
        state.info.insert("status".into(), json!("offline"));
    }

    async fn poll_pass(&self, last_diff_check: &mut Instant, diff_interval: Duration) {
        let (ip, port, known_id) = {
            let state = self.device.state_mut().await;
            (state.ip.clone(), state.port, state.id.clone())
        };
        let client = client_for(&ip, port, self.cancel.child_token());

        // Identity first: a changed id at the same address means the device
        // was reimaged and its state is meaningless.
        let id = match client.get_json("id").await {
            Ok(value) => match value.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    warn!(device = %known_id, ip = %ip, "device /id response carries no id");
                    return;
                }
            },
            Err(err) => {
                self.record_scan_failure(err).await;
                return;
            }
        };

        if !known_id.is_empty() && id != known_id {
            warn!(ip = %ip, old = %known_id, new = %id, "device id changed, treating as a fresh device");
            self.device.reset_for_new_identity(&id).await;
        } else if known_id.is_empty() {
            self.device.state_mut().await.id = id.clone();
        }

        let data = match client.get_json(&format!("data/{id}")).await {
            Ok(value) => value,
            Err(err) => {
                self.record_scan_failure(err).await;
                return;
            }
        };
        let Some(data_map) = data.as_object() else {
            warn!(device = %id, "device data response is not an object");
            return;
        };
        let new_status = match data_map
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .parse::<StatusName>()
        {
            Ok(status) => status,
            Err(err) => {
                warn!(device = %id, error = %err, "device reported an unknown status");
                return;
            }
        };

        // Reconcile under the state lock, then act on the outcome outside it.
        let (prev_status, name, info_snapshot) = {
            let mut state = self.device.state_mut().await;
            let prev_status = state.status.status_name;
            state.refused_in_a_row = 0;

            if new_status != prev_status {
                let trigger = if state.expected_status.take() == Some(new_status) {
                    TriggerSource::User
                } else if prev_status == StatusName::Offline
                    && state.status.trigger_source == TriggerSource::InitialDiscovery
                {
                    // First contact ever: nothing here warrants an alert.
                    TriggerSource::InitialDiscovery
                } else {
                    TriggerSource::System
                };
                let mut status = DeviceStatus::new(new_status, trigger);
                status.set_previous(state.status.clone());
                state.status = status;
            } else {
                state.status.reset_errors();
            }

            for (key, value) in data_map {
                state.info.insert(key.clone(), value.clone());
            }
            state.info.insert("status".into(), json!(new_status.as_str()));
            state.info.insert("ip".into(), json!(ip));
            if let Some(name) = data_map.get("name").and_then(Value::as_str) {
                if !name.is_empty() {
                    state.name = name.to_string();
                }
            }

            (prev_status, state.name.clone(), state.info.clone())
        };

        if let Some(event) = transition_event(prev_status, new_status) {
            self.handle_event(event, &id, &name, &ip, &info_snapshot, &client)
                .await;
        }

        self.update_backup_path(&id, new_status).await;

        if last_diff_check.elapsed() >= diff_interval {
            self.refresh_backup_progress(&ip).await;
            *last_diff_check = Instant::now();
        }
    }

    /// A pass failed on the network. Count it, maybe park the device, and
    /// persist the transition the failure implies.
    async fn record_scan_failure(&self, err: ScanError) {
        let refused = err.is_connection_refused();

        let (device_id, prev_status, errors, parked, run_id, timed_out) = {
            let mut state = self.device.state_mut().await;
            let prev_status = state.status.status_name;

            if prev_status != StatusName::Unreached {
                let mut status = DeviceStatus::new(StatusName::Unreached, TriggerSource::System);
                status.set_previous(state.status.clone());
                state.status = status;
            }
            let errors = state.status.increment_errors();

            if refused {
                state.refused_in_a_row += 1;
            } else {
                state.refused_in_a_row = 0;
            }

            // A refused connection means the device was shut down (or the
            // service is gone): stop spamming the network quickly. Other
            // failures get a longer leash.
            let parked = state.refused_in_a_row >= self.config.scanner.refused_threshold
                || errors >= self.config.scanner.error_threshold;
            if parked {
                state.skip_scanning = true;
            }

            state.info.insert("status".into(), json!("unreached"));
            let timed_out = state
                .status
                .is_timeout_exceeded(self.config.scanner.unreached_alert_minutes);
            (
                state.id.clone(),
                prev_status,
                errors,
                parked,
                run_id_of(&state.info),
                timed_out,
            )
        };

        match verbosity_for_error_count(errors) {
            ErrorVerbosity::Info => {
                info!(device = %device_id, error = %err, errors, "device not reachable")
            }
            ErrorVerbosity::Warn => {
                warn!(device = %device_id, error = %err, errors, "device still not reachable")
            }
            ErrorVerbosity::Debug => {
                debug!(device = %device_id, error = %err, errors, "device not reachable")
            }
        }
        if parked {
            warn!(device = %device_id, errors, "too many failures, scanning disabled for this device");
        }
        if timed_out {
            warn!(
                device = %device_id,
                threshold_minutes = self.config.scanner.unreached_alert_minutes,
                "device has been unreached beyond the alert threshold"
            );
        }

        match transition_event(prev_status, StatusName::Unreached) {
            Some(TransitionEvent::RunInterrupted) => {
                if let Some(run_id) = run_id {
                    if let Err(db_err) = self.expdb.flag_problem(&run_id, "unreached").await {
                        error!(device = %device_id, error = %db_err, "could not flag interrupted run");
                    }
                }
                self.persist_status(&device_id, "unreached").await;
            }
            Some(TransitionEvent::WentUnreachedIdle) => {
                self.persist_status(&device_id, "offline").await;
            }
            _ => {}
        }
    }

    async fn persist_status(&self, device_id: &str, status: &str) {
        let update = EthoscopeUpdate {
            status: Some(status.to_string()),
            ..EthoscopeUpdate::default()
        };
        if let Err(err) = self.expdb.update_ethoscope(device_id, update).await {
            error!(device = %device_id, error = %err, "could not persist device status");
        }
    }

    async fn handle_event(
        &self,
        event: TransitionEvent,
        id: &str,
        name: &str,
        ip: &str,
        info: &InfoMap,
        client: &DeviceClient,
    ) {
        match event {
            TransitionEvent::DeviceAppeared => {
                // Bench placeholders never reach the experiment DB.
                if is_placeholder_name(name) {
                    return;
                }
                let machine_info = match client.get_json(&format!("machine/{id}")).await {
                    Ok(machine) => describe_machine(&machine),
                    Err(err) => {
                        debug!(device = %id, error = %err, "machine info unavailable");
                        String::new()
                    }
                };
                let update = EthoscopeUpdate {
                    name: Some(name.to_string()),
                    last_ip: Some(ip.to_string()),
                    machine_info: Some(machine_info),
                    status: info
                        .get("status")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    ..EthoscopeUpdate::default()
                };
                if let Err(err) = self.expdb.update_ethoscope(id, update).await {
                    error!(device = %id, error = %err, "could not record discovered device");
                } else {
                    info!(device = %id, name = %name, ip = %ip, "device recorded in experiment DB");
                }
            }
            TransitionEvent::RunStarted => {
                let Some(run_id) = run_id_of(info) else {
                    debug!(device = %id, "run started but no run id reported");
                    return;
                };
                let run = NewRun {
                    run_id: run_id.clone(),
                    experiment_type: "tracking".to_string(),
                    ethoscope_id: id.to_string(),
                    ethoscope_name: name.to_string(),
                    user_name: experimental_field(info, "name"),
                    user_id: String::new(),
                    location: experimental_field(info, "location"),
                    alert: true,
                    comments: String::new(),
                    experimental_data: info
                        .get("backup_path")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                };
                if let Err(err) = self.expdb.add_run(run).await {
                    error!(device = %id, run = %run_id, error = %err, "could not record new run");
                } else {
                    info!(device = %id, run = %run_id, "tracking run recorded");
                }
            }
            TransitionEvent::RunSelfStopped => {
                if let Some(run_id) = run_id_of(info) {
                    if let Err(err) = self.expdb.flag_problem(&run_id, "self-stopped").await {
                        error!(device = %id, run = %run_id, error = %err, "could not flag self-stopped run");
                    }
                }
            }
            TransitionEvent::RunStopped => {
                if let Some(run_id) = run_id_of(info) {
                    if let Err(err) = self.expdb.stop_run(&run_id).await {
                        error!(device = %id, run = %run_id, error = %err, "could not close run");
                    } else {
                        info!(device = %id, run = %run_id, "run closed");
                    }
                }
            }
            // These arise from failed passes and are handled there.
            TransitionEvent::RunInterrupted | TransitionEvent::WentUnreachedIdle => {}
        }
    }

    /// Keep `info.backup_path` pointing at the replica for the current run.
    /// Old firmware does not report its backup filename; in the states where
    /// a database must exist, fall back to asking the device's MySQL for the
    /// experiment start time and synthesise the name.
    async fn update_backup_path(&self, id: &str, status: StatusName) {
        let results_dir = Path::new(&self.config.results_dir).to_path_buf();

        let (info, ip, name) = {
            let state = self.device.state_mut().await;
            (state.info.clone(), state.ip.clone(), state.name.clone())
        };

        let mut fallback_filename: Option<String> = None;
        let path = match derive_backup_path(&results_dir, &info) {
            Some(path) => Some(path),
            None if matches!(
                status,
                StatusName::Running | StatusName::Recording | StatusName::Stopped
            ) =>
            {
                let db_name = info
                    .get("db_name")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(engine::DEVICE_DB_NAME);
                match engine::remote_backup_filename(&ip, db_name, id).await {
                    Ok(filename) => {
                        warn!(device = %id, "device did not report a backup filename, derived one from its database");
                        let path = parse_backup_filename(&filename).map(|(stamp, dev_id)| {
                            results_dir.join(dev_id).join(&name).join(stamp).join(&filename)
                        });
                        fallback_filename = Some(filename);
                        path
                    }
                    Err(err) => {
                        debug!(device = %id, error = %err, "could not derive a backup path");
                        None
                    }
                }
            }
            None => None,
        };

        let mut state = self.device.state_mut().await;
        if let Some(filename) = fallback_filename {
            state.info.insert("backup_filename".into(), json!(filename));
        }
        match path {
            Some(path) => {
                state
                    .info
                    .insert("backup_path".into(), json!(path.to_string_lossy()));
            }
            None => {
                state.info.insert("backup_path".into(), json!(""));
            }
        }
    }

    /// Informational completeness probe; never starts a backup.
    async fn refresh_backup_progress(&self, ip: &str) {
        let (backup_path, db_name) = {
            let state = self.device.state_mut().await;
            (
                state
                    .info
                    .get("backup_path")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                state
                    .info
                    .get("db_name")
                    .and_then(Value::as_str)
                    .unwrap_or(engine::DEVICE_DB_NAME)
                    .to_string(),
            )
        };
        if backup_path.is_empty() {
            return;
        }

        let percentage = engine::db_diff(ip, &db_name, Path::new(&backup_path)).await;
        let mut state = self.device.state_mut().await;
        if percentage < 0.0 {
            state.info.insert("backup_progress".into(), json!("N/A"));
        } else {
            state
                .info
                .insert("backup_progress".into(), json!(percentage));
        }
    }
}

/// Push key→value settings to a sensor's `/set` endpoint.
pub async fn set_sensor(device: &Device, settings: Value) -> Result<Value, CommandError> {
    let client = device_client(device).await;
    Ok(client.post_json("set", &settings).await?)
}

/// The much simpler worker for sensors: refresh id and data, flag the record
/// online or offline. Sensors have no runs, no backups, no commands beyond
/// `/set`.
pub struct SensorPoller {
    device: Arc<Device>,
    config: AppConfig,
    cancel: CancellationToken,
}

impl SensorPoller {
    pub fn spawn(device: Arc<Device>, config: AppConfig, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = SensorPoller {
            device,
            config,
            cancel,
        };
        tokio::spawn(poller.run())
    }

    pub async fn run(self) {
        let period = Duration::from_secs(self.config.scanner.sensor_refresh_period_secs);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            if self.device.skip_scanning().await {
                let mut state = self.device.state_mut().await;
                state.info.insert("status".into(), json!("offline"));
                state.info.insert("ip".into(), json!("offline"));
                continue;
            }
            self.poll_pass().await;
        }
    }

    async fn poll_pass(&self) {
        let (ip, port, known_id) = {
            let state = self.device.state_mut().await;
            (state.ip.clone(), state.port, state.id.clone())
        };
        let client = client_for(&ip, port, self.cancel.child_token());

        let id = match client.get_json("id").await {
            Ok(value) => value
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            Err(err) => {
                debug!(sensor = %known_id, ip = %ip, error = %err, "sensor not reachable");
                let mut state = self.device.state_mut().await;
                state.info.insert("status".into(), json!("offline"));
                state.info.insert("ip".into(), json!("offline"));
                return;
            }
        };
        if !known_id.is_empty() && id != known_id {
            warn!(ip = %ip, old = %known_id, new = %id, "sensor id changed");
            self.device.reset_for_new_identity(&id).await;
        }

        match client.get_json("").await {
            Ok(data) => {
                let mut state = self.device.state_mut().await;
                if let Some(map) = data.as_object() {
                    for (key, value) in map {
                        state.info.insert(key.clone(), value.clone());
                    }
                }
                state.info.insert("status".into(), json!("online"));
                state.info.insert("ip".into(), json!(ip));
                if state.id.is_empty() {
                    state.id = id;
                }
            }
            Err(err) => {
                debug!(sensor = %id, error = %err, "sensor data fetch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    #[test]
    fn test_transition_table() {
        use StatusName::*;

        assert_eq!(
            transition_event(Offline, Stopped),
            Some(TransitionEvent::DeviceAppeared)
        );
        assert_eq!(
            transition_event(Offline, Running),
            Some(TransitionEvent::DeviceAppeared)
        );
        assert_eq!(transition_event(Offline, Offline), None);

        assert_eq!(transition_event(Stopped, Initialising), None, "intermediate");
        assert_eq!(
            transition_event(Initialising, Running),
            Some(TransitionEvent::RunStarted)
        );
        assert_eq!(
            transition_event(Initialising, Stopping),
            Some(TransitionEvent::RunSelfStopped)
        );
        assert_eq!(
            transition_event(Running, Stopped),
            Some(TransitionEvent::RunStopped)
        );
        assert_eq!(
            transition_event(Running, Unreached),
            Some(TransitionEvent::RunInterrupted)
        );
        assert_eq!(
            transition_event(Stopped, Unreached),
            Some(TransitionEvent::WentUnreachedIdle)
        );

        // Steady states move nothing.
        assert_eq!(transition_event(Running, Running), None);
        assert_eq!(transition_event(Stopped, Stopped), None);
    }

    #[test]
    fn test_error_verbosity_scaling() {
        assert_eq!(verbosity_for_error_count(1), ErrorVerbosity::Info);
        assert_eq!(verbosity_for_error_count(2), ErrorVerbosity::Debug);
        assert_eq!(verbosity_for_error_count(4), ErrorVerbosity::Debug);
        assert_eq!(verbosity_for_error_count(5), ErrorVerbosity::Warn);
        assert_eq!(verbosity_for_error_count(50), ErrorVerbosity::Warn);
    }

    #[test]
    fn test_expected_status_mapping() {
        assert_eq!(
            expected_status_for(Instruction::Start),
            Some(StatusName::Initialising)
        );
        assert_eq!(
            expected_status_for(Instruction::StartRecord),
            Some(StatusName::Initialising)
        );
        assert_eq!(
            expected_status_for(Instruction::Stop),
            Some(StatusName::Stopped)
        );
        assert_eq!(
            expected_status_for(Instruction::Stream),
            Some(StatusName::Streaming)
        );
        assert_eq!(expected_status_for(Instruction::Poweroff), None);
        assert_eq!(expected_status_for(Instruction::Dumpdb), None);
    }

    #[test]
    fn test_describe_machine() {
        let full = json!({"kernel": "5.15.0", "pi_version": "4"});
        assert_eq!(describe_machine(&full), "5.15.0 on pi4");

        let missing = json!({"hostname": "ethoscope007"});
        assert_eq!(describe_machine(&missing), "");
    }

    #[test]
    fn test_run_id_extraction() {
        let mut info = InfoMap::new();
        info.insert(
            "experimental_info".into(),
            json!({"run_id": "run-42", "name": "alice"}),
        );
        assert_eq!(run_id_of(&info), Some("run-42".to_string()));

        info.insert("experimental_info".into(), json!({"run_id": 42}));
        assert_eq!(run_id_of(&info), Some("42".to_string()));

        info.insert("experimental_info".into(), json!({"name": "alice"}));
        assert_eq!(run_id_of(&info), None);

        info.remove("experimental_info");
        assert_eq!(run_id_of(&info), None);
    }

    #[tokio::test]
    async fn test_send_instruction_rejected_without_network() {
        // The device address is unroutable; if validation did not run first
        // this test would hang out the full retry schedule.
        let device = Device::new(
            DeviceKind::Ethoscope,
            "a82d746e370e15182d780d0f06fca03e",
            "ETHOSCOPE_007",
            "203.0.113.1",
            9000,
        );
        let result = send_instruction(&device, Instruction::Stop, json!({})).await;
        assert!(matches!(
            result,
            Err(CommandError::NotAllowed(InstructionError::NotAllowed { .. }))
        ));
    }

    fn gateway_error() -> ScanError {
        ScanError::HttpStatus {
            url: "http://192.168.1.27:9000/data/dev-1".to_string(),
            status: reqwest::StatusCode::BAD_GATEWAY,
        }
    }

    async fn running_device() -> Arc<Device> {
        let device = Arc::new(Device::new(
            DeviceKind::Ethoscope,
            "dev-1",
            "ETHOSCOPE_007",
            "192.168.1.27",
            9000,
        ));
        let mut state = device.state_mut().await;
        let mut status = DeviceStatus::new(StatusName::Running, TriggerSource::System);
        status.set_previous(state.status.clone());
        state.status = status;
        state
            .info
            .insert("experimental_info".into(), json!({"run_id": "run-9"}));
        drop(state);
        device
    }

    #[tokio::test]
    async fn test_scan_failure_marks_unreached_and_persists() {
        let expdb = ExperimentDb::open(":memory:").await.unwrap();
        let device = running_device().await;
        let poller = DevicePoller::new(
            Arc::clone(&device),
            expdb.clone(),
            AppConfig::default(),
            CancellationToken::new(),
        );

        poller.record_scan_failure(gateway_error()).await;

        let status = device.status().await;
        assert_eq!(status.status_name, StatusName::Unreached);
        assert_eq!(status.consecutive_errors, 1);
        assert!(status.unreachable_start_time.is_some());
        assert_eq!(
            status.previous().map(|s| s.status_name),
            Some(StatusName::Running)
        );

        // The interrupted run was persisted as unreached.
        let rows = expdb
            .execute_sql("SELECT status FROM ethoscopes WHERE ethoscope_id = 'dev-1'")
            .await
            .unwrap();
        assert_eq!(rows[0]["status"], "unreached");
    }

    #[tokio::test]
    async fn test_repeated_failures_park_the_device() {
        let expdb = ExperimentDb::open(":memory:").await.unwrap();
        let device = running_device().await;
        let config = AppConfig::default();
        let threshold = config.scanner.error_threshold;
        let poller = DevicePoller::new(
            Arc::clone(&device),
            expdb,
            config,
            CancellationToken::new(),
        );

        for n in 1..=threshold {
            poller.record_scan_failure(gateway_error()).await;
            let parked = device.skip_scanning().await;
            if n < threshold {
                assert!(!parked, "parked too early at failure {n}");
            } else {
                assert!(parked, "not parked at the threshold");
            }
        }
        assert_eq!(device.status().await.consecutive_errors, threshold);
    }

    #[tokio::test]
    async fn test_idle_device_failure_persists_offline() {
        let expdb = ExperimentDb::open(":memory:").await.unwrap();
        let device = Arc::new(Device::new(
            DeviceKind::Ethoscope,
            "dev-2",
            "ETHOSCOPE_008",
            "192.168.1.28",
            9000,
        ));
        {
            let mut state = device.state_mut().await;
            let mut status = DeviceStatus::new(StatusName::Stopped, TriggerSource::System);
            status.set_previous(state.status.clone());
            state.status = status;
        }
        let poller = DevicePoller::new(
            Arc::clone(&device),
            expdb.clone(),
            AppConfig::default(),
            CancellationToken::new(),
        );

        poller.record_scan_failure(gateway_error()).await;

        assert_eq!(device.status().await.status_name, StatusName::Unreached);
        let rows = expdb
            .execute_sql("SELECT status FROM ethoscopes WHERE ethoscope_id = 'dev-2'")
            .await
            .unwrap();
        assert_eq!(rows[0]["status"], "offline", "idle devices persist as plain offline");
    }

    #[tokio::test]
    async fn test_last_image_needs_active_state() {
        let device = Device::new(
            DeviceKind::Ethoscope,
            "dev-1",
            "ETHOSCOPE_007",
            "192.168.1.27",
            9000,
        );
        {
            let mut state = device.state_mut().await;
            state.info.insert("last_drawn_img".into(), json!("/tmp/last_img.jpg"));
            let mut status = DeviceStatus::new(StatusName::Running, TriggerSource::System);
            status.set_previous(state.status.clone());
            state.status = status;
        }

        let url = last_image_url(&device).await.expect("image available");
        assert_eq!(url, "http://192.168.1.27:9000/static/tmp/last_img.jpg");

        // A stopped device has nothing being drawn.
        {
            let mut state = device.state_mut().await;
            let mut status = DeviceStatus::new(StatusName::Stopped, TriggerSource::User);
            status.set_previous(state.status.clone());
            state.status = status;
        }
        assert!(last_image_url(&device).await.is_err());
    }
}
