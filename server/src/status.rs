//! Device status model.
//!
//! Each device carries a chain of [`DeviceStatus`] records describing what the
//! device is doing, who caused the last transition, and how flaky the network
//! path to it has been. The chain is what lets the node tell an operator
//! "this tracking session was interrupted" apart from "the operator stopped
//! this device on purpose".

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of previous statuses retained on the chain.
pub const MAX_CHAIN_LENGTH: usize = 10;

/// The closed set of states a device can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusName {
    Offline,
    Online,
    Idle,
    Stopped,
    Running,
    Recording,
    Streaming,
    Initialising,
    Stopping,
    Unreached,
    Busy,
}

impl StatusName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusName::Offline => "offline",
            StatusName::Online => "online",
            StatusName::Idle => "idle",
            StatusName::Stopped => "stopped",
            StatusName::Running => "running",
            StatusName::Recording => "recording",
            StatusName::Streaming => "streaming",
            StatusName::Initialising => "initialising",
            StatusName::Stopping => "stopping",
            StatusName::Unreached => "unreached",
            StatusName::Busy => "busy",
        }
    }

    /// States in which the device is actively acquiring data.
    pub fn is_active(&self) -> bool {
        matches!(self, StatusName::Running | StatusName::Recording)
    }

    /// Resting states a device ends up in when a session is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusName::Stopped | StatusName::Offline)
    }

    /// States that indicate the node lost contact without the device
    /// actually finishing anything.
    pub fn is_gap(&self) -> bool {
        matches!(self, StatusName::Unreached | StatusName::Busy)
    }
}

impl fmt::Display for StatusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(StatusName::Offline),
            "online" => Ok(StatusName::Online),
            "idle" => Ok(StatusName::Idle),
            "stopped" => Ok(StatusName::Stopped),
            "running" => Ok(StatusName::Running),
            "recording" => Ok(StatusName::Recording),
            "streaming" => Ok(StatusName::Streaming),
            "initialising" => Ok(StatusName::Initialising),
            "stopping" => Ok(StatusName::Stopping),
            "unreached" => Ok(StatusName::Unreached),
            "busy" => Ok(StatusName::Busy),
            other => Err(format!("unknown device status '{other}'")),
        }
    }
}

/// Who (or what) caused a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// An operator issued a command.
    User,
    /// The device moved on its own (or the poller observed a change).
    System,
    /// An orderly shutdown the node itself initiated.
    Graceful,
    /// The very first status recorded when a device is discovered.
    InitialDiscovery,
}

/// Flat serialised form of one status record. The chain serialises as the
/// head record plus a `previous` array of these, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StatusRecord {
    status_name: StatusName,
    is_user_triggered: bool,
    trigger_source: TriggerSource,
    timestamp: DateTime<Utc>,
    consecutive_errors: u32,
    unreachable_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// One entry in a device's status history.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub status_name: StatusName,
    pub is_user_triggered: bool,
    pub trigger_source: TriggerSource,
    pub timestamp: DateTime<Utc>,
    pub consecutive_errors: u32,
    pub unreachable_start_time: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
    previous: Option<Box<DeviceStatus>>,
}

impl DeviceStatus {
    pub fn new(status_name: StatusName, trigger_source: TriggerSource) -> Self {
        let now = Utc::now();
        DeviceStatus {
            status_name,
            is_user_triggered: trigger_source == TriggerSource::User,
            trigger_source,
            timestamp: now,
            consecutive_errors: 0,
            unreachable_start_time: if status_name == StatusName::Unreached {
                Some(now)
            } else {
                None
            },
            metadata: HashMap::new(),
            previous: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach the prior status. The retained chain is truncated to
    /// [`MAX_CHAIN_LENGTH`] links so histories never grow without bound.
    pub fn set_previous(&mut self, prev: DeviceStatus) {
        // An unreached spell that began earlier carries over until contact.
        if self.status_name == StatusName::Unreached && prev.status_name == StatusName::Unreached {
            self.unreachable_start_time =
                prev.unreachable_start_time.or(self.unreachable_start_time);
        }
        self.previous = Some(Box::new(prev));

        // Walk to the cap and cut the chain there.
        let mut cursor = &mut self.previous;
        let mut depth = 0;
        while depth < MAX_CHAIN_LENGTH {
            match cursor {
                Some(node) => {
                    cursor = &mut node.previous;
                    depth += 1;
                }
                None => return,
            }
        }
        *cursor = None;
    }

    pub fn previous(&self) -> Option<&DeviceStatus> {
        self.previous.as_deref()
    }

    /// Time elapsed since this status was entered.
    pub fn age(&self) -> Duration {
        Utc::now() - self.timestamp
    }

    pub fn increment_errors(&mut self) -> u32 {
        self.consecutive_errors += 1;
        self.consecutive_errors
    }

    pub fn reset_errors(&mut self) {
        self.consecutive_errors = 0;
    }

    /// True iff the device has been `unreached` for longer than `minutes`.
    pub fn is_timeout_exceeded(&self, minutes: i64) -> bool {
        if self.status_name != StatusName::Unreached {
            return false;
        }
        match self.unreachable_start_time {
            Some(start) => Utc::now() - start > Duration::minutes(minutes),
            None => false,
        }
    }

    pub fn is_graceful_operation(&self) -> bool {
        self.trigger_source == TriggerSource::Graceful
    }

    /// Whether the operator should be told about this status.
    ///
    /// Anything the operator (or the node itself, or first discovery) caused
    /// is silent; everything else — including an interrupted tracking session
    /// surfacing as `stopped` — is alert-worthy.
    pub fn should_send_alert(&self) -> bool {
        !(self.is_user_triggered
            || self.trigger_source == TriggerSource::Graceful
            || self.trigger_source == TriggerSource::InitialDiscovery)
    }

    /// Detect the pattern `running|recording → unreached|busy → stopped|offline`
    /// anywhere in the retained chain (oldest to newest). A device that was
    /// tracking, vanished, and came back stopped very likely lost data.
    pub fn is_interrupted_tracking_session(&self) -> bool {
        // Collect the chain oldest-first, bounded by the retained length.
        let mut chain: Vec<&DeviceStatus> = Vec::with_capacity(MAX_CHAIN_LENGTH + 1);
        let mut cursor = Some(self);
        while let Some(status) = cursor {
            chain.push(status);
            if chain.len() > MAX_CHAIN_LENGTH {
                break;
            }
            cursor = status.previous();
        }
        chain.reverse();

        let mut saw_active = false;
        let mut saw_gap_after_active = false;
        for status in chain {
            if status.status_name.is_active() {
                saw_active = true;
                saw_gap_after_active = false;
            } else if saw_active && status.status_name.is_gap() {
                saw_gap_after_active = true;
            } else if saw_gap_after_active && status.status_name.is_terminal() {
                return true;
            }
        }
        false
    }

    fn record(&self) -> StatusRecord {
        StatusRecord {
            status_name: self.status_name,
            is_user_triggered: self.is_user_triggered,
            trigger_source: self.trigger_source,
            timestamp: self.timestamp,
            consecutive_errors: self.consecutive_errors,
            unreachable_start_time: self.unreachable_start_time,
            metadata: self.metadata.clone(),
        }
    }

    fn from_record(record: StatusRecord) -> Self {
        DeviceStatus {
            status_name: record.status_name,
            is_user_triggered: record.is_user_triggered,
            trigger_source: record.trigger_source,
            timestamp: record.timestamp,
            consecutive_errors: record.consecutive_errors,
            unreachable_start_time: record.unreachable_start_time,
            metadata: record.metadata,
            previous: None,
        }
    }

    /// Serialise to a flat JSON mapping. The head record's fields sit at the
    /// top level; the chain follows as a `previous` array, newest first.
    pub fn to_dict(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self.record()).unwrap_or_default();
        let mut chain = Vec::new();
        let mut cursor = self.previous();
        while let Some(status) = cursor {
            chain.push(serde_json::to_value(status.record()).unwrap_or_default());
            cursor = status.previous();
        }
        if let Some(map) = value.as_object_mut() {
            map.insert("previous".into(), serde_json::Value::Array(chain));
        }
        value
    }

    /// Rebuild a status (and its chain) from [`Self::to_dict`] output.
    pub fn from_dict(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let head: StatusRecord = serde_json::from_value(value.clone())?;
        let mut status = DeviceStatus::from_record(head);

        let chain: Vec<StatusRecord> = match value.get("previous") {
            Some(array) => serde_json::from_value(array.clone())?,
            None => Vec::new(),
        };
        // Rebuild oldest-first so set_previous sees a fully formed chain.
        let mut rebuilt: Option<DeviceStatus> = None;
        for record in chain.into_iter().rev() {
            let mut link = DeviceStatus::from_record(record);
            if let Some(older) = rebuilt.take() {
                link.previous = Some(Box::new(older));
            }
            rebuilt = Some(link);
        }
        status.previous = rebuilt.map(Box::new);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chained(names: &[StatusName]) -> DeviceStatus {
        let mut head: Option<DeviceStatus> = None;
        for name in names {
            let mut status = DeviceStatus::new(*name, TriggerSource::System);
            if let Some(prev) = head.take() {
                status.set_previous(prev);
            }
            head = Some(status);
        }
        head.expect("at least one status")
    }

    #[test]
    fn test_status_parse_round_trip() {
        for name in [
            "offline",
            "online",
            "idle",
            "stopped",
            "running",
            "recording",
            "streaming",
            "initialising",
            "stopping",
            "unreached",
            "busy",
        ] {
            let parsed: StatusName = name.parse().expect("known status");
            assert_eq!(parsed.as_str(), name);
        }
        assert!("bogus".parse::<StatusName>().is_err());
    }

    #[test]
    fn test_new_status_has_no_errors() {
        let status = DeviceStatus::new(StatusName::Running, TriggerSource::System);
        assert_eq!(status.consecutive_errors, 0);
        assert!(status.previous().is_none());
    }

    #[test]
    fn test_error_counter() {
        let mut status = DeviceStatus::new(StatusName::Unreached, TriggerSource::System);
        assert_eq!(status.increment_errors(), 1);
        assert_eq!(status.increment_errors(), 2);
        status.reset_errors();
        assert_eq!(status.consecutive_errors, 0);
    }

    #[test]
    fn test_chain_traversal_is_bounded() {
        let names: Vec<StatusName> = std::iter::repeat(StatusName::Running).take(40).collect();
        let head = chained(&names);

        let mut depth = 0;
        let mut cursor = Some(&head);
        while let Some(status) = cursor {
            depth += 1;
            cursor = status.previous();
        }
        // Head plus at most MAX_CHAIN_LENGTH retained links.
        assert!(depth <= MAX_CHAIN_LENGTH + 1, "chain too long: {depth}");
    }

    #[test]
    fn test_user_triggered_suppresses_alert() {
        let status = DeviceStatus::new(StatusName::Stopped, TriggerSource::User);
        assert!(status.is_user_triggered);
        assert!(!status.should_send_alert());
    }

    #[test]
    fn test_graceful_suppresses_alert() {
        let status = DeviceStatus::new(StatusName::Offline, TriggerSource::Graceful);
        assert!(status.is_graceful_operation());
        assert!(!status.should_send_alert());
    }

    #[test]
    fn test_initial_discovery_suppresses_alert() {
        let status = DeviceStatus::new(StatusName::Stopped, TriggerSource::InitialDiscovery);
        assert!(!status.should_send_alert());
    }

    #[test]
    fn test_interrupted_tracking_session_detected() {
        let head = chained(&[StatusName::Running, StatusName::Unreached, StatusName::Stopped]);
        assert!(head.is_interrupted_tracking_session());
        assert!(head.should_send_alert());
    }

    #[test]
    fn test_interrupted_tracking_via_busy() {
        let head = chained(&[StatusName::Recording, StatusName::Busy, StatusName::Offline]);
        assert!(head.is_interrupted_tracking_session());
    }

    #[test]
    fn test_direct_stop_is_not_interrupted() {
        let prev = DeviceStatus::new(StatusName::Running, TriggerSource::System);
        let mut head = DeviceStatus::new(StatusName::Stopped, TriggerSource::User);
        head.set_previous(prev);
        assert!(!head.is_interrupted_tracking_session());
        assert!(!head.should_send_alert());
    }

    #[test]
    fn test_interrupted_chain_with_user_terminal_is_silent() {
        let running = DeviceStatus::new(StatusName::Running, TriggerSource::System);
        let mut unreached = DeviceStatus::new(StatusName::Unreached, TriggerSource::System);
        unreached.set_previous(running);
        let mut stopped = DeviceStatus::new(StatusName::Stopped, TriggerSource::User);
        stopped.set_previous(unreached);

        assert!(stopped.is_interrupted_tracking_session());
        assert!(!stopped.should_send_alert(), "user intent wins over the chain");
    }

    #[test]
    fn test_timeout_exceeded() {
        let mut status = DeviceStatus::new(StatusName::Unreached, TriggerSource::System);
        status.unreachable_start_time = Some(Utc::now() - Duration::minutes(25));
        assert!(status.is_timeout_exceeded(20));
        assert!(!status.is_timeout_exceeded(30));
    }

    #[test]
    fn test_timeout_not_exceeded_when_reachable() {
        let status = DeviceStatus::new(StatusName::Running, TriggerSource::System);
        assert!(!status.is_timeout_exceeded(0));
    }

    #[test]
    fn test_unreachable_start_carries_across_unreached_links() {
        let mut first = DeviceStatus::new(StatusName::Unreached, TriggerSource::System);
        let start = Utc::now() - Duration::minutes(25);
        first.unreachable_start_time = Some(start);

        let mut second = DeviceStatus::new(StatusName::Unreached, TriggerSource::System);
        second.set_previous(first);
        assert_eq!(second.unreachable_start_time, Some(start));
        assert!(second.is_timeout_exceeded(20));
    }

    #[test]
    fn test_dict_round_trip_identity() {
        let mut metadata = HashMap::new();
        metadata.insert("cause".to_string(), "connection refused".to_string());

        let running = DeviceStatus::new(StatusName::Running, TriggerSource::System);
        let mut unreached =
            DeviceStatus::new(StatusName::Unreached, TriggerSource::System).with_metadata(metadata);
        unreached.increment_errors();
        unreached.set_previous(running);

        let dict = unreached.to_dict();
        let rebuilt = DeviceStatus::from_dict(&dict).expect("valid dict");
        assert_eq!(rebuilt, unreached);
    }

    #[test]
    fn test_from_dict_without_chain() {
        let status = DeviceStatus::new(StatusName::Stopped, TriggerSource::User);
        let mut dict = status.to_dict();
        dict.as_object_mut().unwrap().remove("previous");

        let rebuilt = DeviceStatus::from_dict(&dict).expect("valid dict");
        assert_eq!(rebuilt.status_name, StatusName::Stopped);
        assert!(rebuilt.previous().is_none());
    }
}
