use anyhow::Result;
use serde::Deserialize;

/// Application configuration loaded from a TOML file or defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Where replicated device databases land.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,

    /// Where video backups land (consumed by the rsync tooling, not here).
    #[serde(default = "default_videos_dir")]
    pub videos_dir: String,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Seconds between poll passes for a responsive ethoscope.
    #[serde(default = "default_refresh_period")]
    pub refresh_period_secs: u64,

    /// Slower cadence while the device reports `busy` (expensive on-device work).
    #[serde(default = "default_busy_refresh_period")]
    pub busy_refresh_period_secs: u64,

    /// Sensors change slowly; poll them less often.
    #[serde(default = "default_sensor_refresh_period")]
    pub sensor_refresh_period_secs: u64,

    /// Consecutive network errors before a device stops being scanned.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Consecutive connection-refused errors before scanning stops.
    #[serde(default = "default_refused_threshold")]
    pub refused_threshold: u32,

    /// Minutes of `unreached` before the condition is alert-worthy.
    #[serde(default = "default_unreached_alert_minutes")]
    pub unreached_alert_minutes: i64,

    /// Seconds between informational backup-diff probes during polling.
    #[serde(default = "default_diff_interval")]
    pub diff_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// A `.completed` marker younger than this suppresses a new pass.
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u64,

    /// Locks older than this are presumed abandoned and force-removed.
    #[serde(default = "default_stale_lock_minutes")]
    pub stale_lock_minutes: u64,

    /// Concurrent backup jobs. 0 means "number of hardware threads".
    #[serde(default)]
    pub max_workers: usize,

    /// Rows fetched per incremental chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// A chunk smaller than this ends the incremental loop.
    #[serde(default = "default_chunk_stop_threshold")]
    pub chunk_stop_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// TCP port the devices serve their frame stream on.
    #[serde(default = "default_streaming_port")]
    pub port: u16,

    /// Frames buffered per client before the relay starts dropping.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Seconds the reader lingers after the last client leaves.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_results_dir() -> String {
    "/ethoscope_data/results".to_string()
}

fn default_videos_dir() -> String {
    "/ethoscope_data/videos".to_string()
}

fn default_refresh_period() -> u64 {
    5
}

fn default_busy_refresh_period() -> u64 {
    60
}

fn default_sensor_refresh_period() -> u64 {
    60
}

fn default_error_threshold() -> u32 {
    10
}

fn default_refused_threshold() -> u32 {
    3
}

fn default_unreached_alert_minutes() -> i64 {
    20
}

fn default_diff_interval() -> u64 {
    30
}

fn default_freshness_hours() -> u64 {
    24
}

fn default_stale_lock_minutes() -> u64 {
    30
}

fn default_chunk_size() -> u32 {
    200
}

fn default_chunk_stop_threshold() -> u32 {
    100
}

fn default_streaming_port() -> u16 {
    8887
}

fn default_queue_capacity() -> usize {
    10
}

fn default_grace_secs() -> u64 {
    5
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            refresh_period_secs: default_refresh_period(),
            busy_refresh_period_secs: default_busy_refresh_period(),
            sensor_refresh_period_secs: default_sensor_refresh_period(),
            error_threshold: default_error_threshold(),
            refused_threshold: default_refused_threshold(),
            unreached_alert_minutes: default_unreached_alert_minutes(),
            diff_interval_secs: default_diff_interval(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            freshness_hours: default_freshness_hours(),
            stale_lock_minutes: default_stale_lock_minutes(),
            max_workers: 0,
            chunk_size: default_chunk_size(),
            chunk_stop_threshold: default_chunk_stop_threshold(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            port: default_streaming_port(),
            queue_capacity: default_queue_capacity(),
            grace_secs: default_grace_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            results_dir: default_results_dir(),
            videos_dir: default_videos_dir(),
            scanner: ScannerConfig::default(),
            backup: BackupConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Effective worker-pool size: configured value, or hardware parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }
}
