use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed capacity of the per-resource console ring buffer.
pub const CONSOLE_CAPACITY: usize = 1000;
/// How long a connectivity transition must hold before it is published.
pub const HEALTH_DEBOUNCE_MS: u64 = 300;
/// Feed drops subscribers that have been silent for this long.
pub const SUBSCRIBER_TIMEOUT_SECS: u64 = 5;
/// Distance from the bottom edge within which the console counts as pinned.
pub const BOTTOM_PIN_THRESHOLD_PX: f32 = 24.0;
/// One-shot requests give up after this long without a response.
pub const REQUEST_TIMEOUT_MS: u64 = 2000;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Opaque identifier of a managed server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        ResourceId(id.to_string())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One category of live telemetry for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Console,
    Metrics,
    Players,
    Freezes,
    BackgroundJobs,
    Health,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Console,
        Topic::Metrics,
        Topic::Players,
        Topic::Freezes,
        Topic::BackgroundJobs,
        Topic::Health,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Console => "console",
            Topic::Metrics => "metrics",
            Topic::Players => "players",
            Topic::Freezes => "freezes",
            Topic::BackgroundJobs => "background-jobs",
            Topic::Health => "health",
        };
        f.write_str(name)
    }
}

/// Severity of a console line, ordered so filters can use `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parses the level names agents put on the wire. Case-insensitive
    /// because older agents emit upper-case names.
    pub fn parse_loose(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// A single console line in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleRecord {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub text: String,
}

/// Most-recent-wins process metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub ticks_per_second: f32,
    pub tick_p95_ms: f32,
    pub heap_mb: f32,
    pub gpu_queue_ms: f32,
    pub players_online: u32,
}

/// One connected player; the roster is replaced whole on each emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub name: String,
    pub ping_ms: u32,
    pub world: String,
    pub joined_ms: u64,
}

/// One open freeze ticket; the set is replaced whole on each emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeTicket {
    pub id: u64,
    pub created_ms: u64,
    pub blocked_ms: u64,
    pub trace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

/// One background job; the set is replaced whole on each emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: u64,
    pub kind: String,
    pub progress_pct: u8,
    pub state: JobState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Frozen,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Frozen => "frozen",
        };
        f.write_str(name)
    }
}

/// Process health; replaced whole on each emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub state: ProcessState,
    pub uptime_s: u64,
    pub last_heartbeat_ms: u64,
}

/// A stored record plus its buffer-local sequence number.
///
/// The sequence number is the stable render key; timestamps are not
/// unique and must not be used as keys.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry<T> {
    pub seq: u64,
    pub record: T,
}

/// Console line as agents put it on the wire. The level travels as a
/// string and is validated at the normalization boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireConsoleLine {
    pub ts_ms: u64,
    pub level: String,
    pub text: String,
}

/// Current metrics wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMetrics {
    pub ticks_per_second: f32,
    pub tick_p95_ms: f32,
    pub heap_mb: f32,
    pub gpu_queue_ms: f32,
    pub players_online: u32,
}

/// Metrics shape emitted by pre-0.9 agents (abbreviated key spellings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMetricsV1 {
    pub tps: f32,
    pub tick_p95: f32,
    pub heap: f32,
    pub gpu_ms: f32,
    pub online: u32,
}

/// Topic payload as delivered by a channel. Tagged per schema version so
/// the normalization boundary can validate shapes instead of guessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WirePayload {
    ConsoleLines(Vec<WireConsoleLine>),
    /// Pre-0.9 agents: (timestamp_ms, text) pairs without a level field.
    ConsoleLinesV1(Vec<(u64, String)>),
    Metrics(WireMetrics),
    MetricsV1(WireMetricsV1),
    Players(Vec<PlayerRecord>),
    Freezes(Vec<FreezeTicket>),
    Jobs(Vec<BackgroundJob>),
    Health(HealthRecord),
}

impl WirePayload {
    /// Topic this payload shape belongs to.
    pub fn topic(&self) -> Topic {
        match self {
            WirePayload::ConsoleLines(_) | WirePayload::ConsoleLinesV1(_) => Topic::Console,
            WirePayload::Metrics(_) | WirePayload::MetricsV1(_) => Topic::Metrics,
            WirePayload::Players(_) => Topic::Players,
            WirePayload::Freezes(_) => Topic::Freezes,
            WirePayload::Jobs(_) => Topic::BackgroundJobs,
            WirePayload::Health(_) => Topic::Health,
        }
    }
}

/// One-shot actions a console can ask the feed to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestAction {
    SendCommand { text: String },
    AcceptEula,
    EulaStatus,
    Start,
    Stop,
    Restart,
    ConsoleBacklog,
    StateSnapshot,
}

/// Successful one-shot response bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Ok,
    Eula {
        accepted: bool,
    },
    Backlog {
        lines: Vec<WireConsoleLine>,
    },
    State {
        players: Vec<PlayerRecord>,
        metrics: Option<WireMetrics>,
        health: Option<HealthRecord>,
    },
}

/// Wire packets between console and feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // console -> feed
    Subscribe {
        resource: ResourceId,
        topic: Topic,
    },
    Unsubscribe {
        resource: ResourceId,
        topic: Topic,
    },
    Request {
        request_id: u32,
        resource: ResourceId,
        action: RequestAction,
    },
    Bye,

    // feed -> console
    SubscribeAck {
        resource: ResourceId,
        topic: Topic,
    },
    SubscribeError {
        resource: ResourceId,
        topic: Topic,
        reason: String,
    },
    Payload {
        resource: ResourceId,
        topic: Topic,
        payload: WirePayload,
    },
    Response {
        request_id: u32,
        result: Result<ResponseBody, String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_loose() {
        assert_eq!(LogLevel::parse_loose("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse_loose("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse_loose("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse_loose("Error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse_loose("fatal"), None);
    }

    #[test]
    fn test_level_ordering_for_filters() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_topic_all_covers_every_variant() {
        assert_eq!(Topic::ALL.len(), 6);
        for topic in Topic::ALL {
            assert!(!topic.to_string().is_empty());
        }
    }

    #[test]
    fn test_wire_payload_topic_mapping() {
        assert_eq!(WirePayload::ConsoleLines(vec![]).topic(), Topic::Console);
        assert_eq!(WirePayload::ConsoleLinesV1(vec![]).topic(), Topic::Console);
        assert_eq!(
            WirePayload::MetricsV1(WireMetricsV1 {
                tps: 20.0,
                tick_p95: 48.0,
                heap: 1024.0,
                gpu_ms: 2.0,
                online: 3,
            })
            .topic(),
            Topic::Metrics
        );
        assert_eq!(WirePayload::Players(vec![]).topic(), Topic::Players);
        assert_eq!(WirePayload::Jobs(vec![]).topic(), Topic::BackgroundJobs);
    }

    #[test]
    fn test_packet_serialization_subscribe() {
        let packet = Packet::Subscribe {
            resource: ResourceId::from("srv-1"),
            topic: Topic::Console,
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Subscribe { resource, topic } => {
                assert_eq!(resource.as_str(), "srv-1");
                assert_eq!(topic, Topic::Console);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_payload() {
        let packet = Packet::Payload {
            resource: ResourceId::from("srv-1"),
            topic: Topic::Console,
            payload: WirePayload::ConsoleLines(vec![WireConsoleLine {
                ts_ms: 1000,
                level: "info".to_string(),
                text: "Server started".to_string(),
            }]),
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Payload {
                resource,
                topic,
                payload,
            } => {
                assert_eq!(resource.as_str(), "srv-1");
                assert_eq!(topic, Topic::Console);
                match payload {
                    WirePayload::ConsoleLines(lines) => {
                        assert_eq!(lines.len(), 1);
                        assert_eq!(lines[0].text, "Server started");
                    }
                    _ => panic!("Wrong payload shape after deserialization"),
                }
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_request_response() {
        let request = Packet::Request {
            request_id: 7,
            resource: ResourceId::from("srv-2"),
            action: RequestAction::SendCommand {
                text: "say hi".to_string(),
            },
        };
        let bytes = bincode::serialize(&request).unwrap();
        let back: Packet = bincode::deserialize(&bytes).unwrap();
        match back {
            Packet::Request {
                request_id, action, ..
            } => {
                assert_eq!(request_id, 7);
                assert_eq!(
                    action,
                    RequestAction::SendCommand {
                        text: "say hi".to_string()
                    }
                );
            }
            _ => panic!("Wrong packet type after deserialization"),
        }

        let response = Packet::Response {
            request_id: 7,
            result: Err("EULA not accepted".to_string()),
        };
        let bytes = bincode::serialize(&response).unwrap();
        let back: Packet = bincode::deserialize(&bytes).unwrap();
        match back {
            Packet::Response { request_id, result } => {
                assert_eq!(request_id, 7);
                assert_eq!(result, Err("EULA not accepted".to_string()));
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_resource_id_display_and_hash() {
        use std::collections::HashMap;

        let id = ResourceId::new("srv-1");
        assert_eq!(format!("{}", id), "srv-1");

        let mut map = HashMap::new();
        map.insert(id.clone(), 1);
        assert_eq!(map.get(&ResourceId::from("srv-1")), Some(&1));
    }
}
