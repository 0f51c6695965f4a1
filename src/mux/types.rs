//! Mux Types: public types shared by the supervisor, the broadcaster and consumers

use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::MuxError;
use crate::mux::flags::is_flag_active;

pub const STATE_TOPIC_SUFFIX: &str = "state/json";
pub const SET_TOPIC_SUFFIX: &str = "set/";
pub const DEFAULT_WS_PATH: &str = "/mqtt";

// ==========================================
// CONNECTIVITY
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
    Error,
}

impl ConnectivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// CONNECTION CONFIG
// ==========================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Tcp,
    WebSocket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Namespace prefix for every topic, e.g. "greenhouse/gh1/"
    pub base: String,
    #[serde(default)]
    pub mode: TransportMode,
    /// Websocket path, only meaningful for `TransportMode::WebSocket`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: impl ToString, base: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.to_string(),
            user: None,
            pass: None,
            base: base.into(),
            mode: TransportMode::Tcp,
            path: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validates and returns the normalized config: trailing '/' on `base`,
    /// leading '/' on `path`, trimmed port. Empty credentials become `None`.
    pub fn normalized(mut self) -> Result<Self, MuxError> {
        self.host = self.host.trim().to_string();
        self.port = self.port.trim().to_string();

        if self.host.is_empty() {
            return Err(MuxError::InvalidConfig("host is empty".into()));
        }
        if self.port.is_empty() {
            return Err(MuxError::InvalidConfig("port is empty".into()));
        }
        if self.base.trim().is_empty() {
            return Err(MuxError::InvalidConfig("base namespace is empty".into()));
        }
        match self.port.parse::<u16>() {
            Ok(0) | Err(_) => {
                return Err(MuxError::InvalidConfig(format!(
                    "port must be a positive integer, got {:?}",
                    self.port
                )));
            }
            Ok(_) => {}
        }

        if !self.base.ends_with('/') {
            self.base.push('/');
        }
        if let Some(path) = self.path.as_mut() {
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
        }
        self.user = self.user.filter(|u| !u.is_empty());
        self.pass = self.pass.filter(|p| !p.is_empty());
        Ok(self)
    }

    /// Port as a number. Only meaningful on a normalized config.
    pub fn port_number(&self) -> u16 {
        self.port.parse().unwrap_or(0)
    }

    pub fn ws_path(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_WS_PATH)
    }

    pub fn state_topic(&self) -> String {
        format!("{}{}", self.base, STATE_TOPIC_SUFFIX)
    }

    pub fn command_topic(&self, key: &str) -> String {
        format!("{}{}{}", self.base, SET_TOPIC_SUFFIX, key)
    }

    /// Copy safe to persist for re-entry: the password is dropped.
    pub fn without_secret(&self) -> Self {
        Self { pass: None, ..self.clone() }
    }
}

fn port_from_string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid port: {}", other))),
    }
}

// ==========================================
// TELEMETRY
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub data: Map<String, Value>,
    /// Capture time, epoch ms
    pub timestamp: u64,
}

impl TelemetrySnapshot {
    pub fn new(data: Map<String, Value>, timestamp: u64) -> Self {
        Self { data, timestamp }
    }

    /// Parses a broker payload. Anything but a JSON object is rejected.
    pub fn from_payload(payload: &[u8], timestamp: u64) -> Result<Self, String> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(data)) => Ok(Self { data, timestamp }),
            Ok(other) => Err(format!("state payload is not an object: {}", type_name(&other))),
            Err(e) => Err(format!("state payload is not valid JSON: {}", e)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.data.get(key).map(is_flag_active).unwrap_or(false)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ==========================================
// COMMANDS
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub key: String,
    pub value: String,
    pub enqueued_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandAck {
    pub key: String,
    pub value: String,
}

impl From<&PendingCommand> for CommandAck {
    fn from(cmd: &PendingCommand) -> Self {
        Self { key: cmd.key.clone(), value: cmd.value.clone() }
    }
}

// ==========================================
// ENDPOINTS & EVENTS
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a consumer can observe. Serialized with a `type` tag so it can
/// go over the wire unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Status {
        status: ConnectivityStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    State {
        state: Arc<TelemetrySnapshot>,
        /// Replayed from the durable cache rather than received live
        cached: bool,
    },
    Published(CommandAck),
    Queued(CommandAck),
    Throttled(CommandAck),
    Error {
        detail: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    Stale {
        age_ms: u64,
    },
}

impl HubEvent {
    pub fn status(status: ConnectivityStatus) -> Self {
        Self::Status { status, detail: None }
    }
}
