//! Wire format of the consumer socket.
//!
//! Inbound frames are JSON objects `{"type": ..., "data": ...}`; `data` is
//! omitted for commands without arguments. Outbound frames are `HubEvent`s
//! serialized as-is.

use serde::Deserialize;
use serde_json::Value;

use crate::error::MuxError;
use crate::mux::types::{ConnectionConfig, HubEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Connect(ConnectionConfig),
    Publish { key: String, value: String },
    Disconnect,
    RequestState,
    Resync,
    Network { online: bool },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct PublishData {
    key: String,
    value: Value,
}

#[derive(Deserialize)]
struct NetworkData {
    online: bool,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, MuxError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(bad_frame)?;

        match envelope.kind.as_str() {
            "connect" => {
                let config = serde_json::from_value(envelope.data)
                    .map_err(|e| MuxError::InvalidConfig(e.to_string()))?;
                Ok(Self::Connect(config))
            }
            "publish" => {
                let data: PublishData = serde_json::from_value(envelope.data).map_err(bad_frame)?;
                let value = match data.value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(Self::Publish { key: data.key, value })
            }
            "disconnect" => Ok(Self::Disconnect),
            "request_state" => Ok(Self::RequestState),
            "resync" => Ok(Self::Resync),
            "network" => {
                let data: NetworkData = serde_json::from_value(envelope.data).map_err(bad_frame)?;
                Ok(Self::Network { online: data.online })
            }
            other => Err(MuxError::Protocol(format!("unknown message type '{}'", other))),
        }
    }
}

fn bad_frame(e: serde_json::Error) -> MuxError {
    MuxError::Protocol(e.to_string())
}

/// Error frame sent back to the one socket that caused it.
pub fn error_frame(err: &MuxError) -> HubEvent {
    HubEvent::Error { detail: err.to_string(), key: None }
}
