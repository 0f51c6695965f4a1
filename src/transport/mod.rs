//! Transport Adapter: the only code that talks to the broker.
//!
//! A `Transport` opens links; a `Link` is one physical connection attempt.
//! Everything the network does (connected, failed, message, closed) comes
//! back as a `TransportEvent` tagged with the link id it belongs to, so the
//! supervisor can drop events from links it already abandoned.

pub mod memory;
pub mod mqtt;

use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::mux::types::ConnectionConfig;

pub use memory::{MemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;

pub type LinkId = u64;

/// Identifies one publish on one link until the broker acknowledges it.
pub type PublishToken = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Connected,
    ConnectFailed(String),
    Message { topic: String, payload: Bytes },
    /// Broker confirmed the publish issued under this token
    Acked(PublishToken),
    /// Unsolicited loss of an established link
    Closed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub link: LinkId,
    pub kind: TransportEventKind,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts connecting and returns immediately. The outcome is reported on
    /// `events` as `Connected` or `ConnectFailed`.
    fn connect(&self, config: &ConnectionConfig, link: LinkId, events: TransportEventSender) -> Box<dyn Link>;
}

pub trait Link: Send {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    /// Hands the payload to the link. Delivery is confirmed later by an
    /// `Acked` event carrying the returned token.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishToken, TransportError>;
    /// Tears the link down. No further events are reported for it.
    fn close(&self);
}

/// Picks the transport implementation by name ("mqtt" or "memory").
/// `queue_capacity` sizes the MQTT request channel so a full offline queue
/// fits in one flush.
pub fn select(kind: &str, config: &TransportConfig, queue_capacity: usize) -> Result<Arc<dyn Transport>, String> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "mqtt" => Ok(Arc::new(MqttTransport::new(config.clone(), queue_capacity))),
        "memory" => Ok(Arc::new(MemoryTransport::new(MemoryBroker::new()))),
        other => Err(format!("Unknown transport '{}', expected 'mqtt' or 'memory'", other)),
    }
}
