//! MQTT transport over rumqttc (TCP or WebSocket, TLS picked from the port).
//!
//! rumqttc reconnects by itself when its event loop is polled after an
//! error. We don't want that: the supervisor owns the retry policy, so the
//! pump task stops at the first error and reports it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::mux::types::{ConnectionConfig, TransportMode};
use crate::transport::{
    Link, LinkId, PublishToken, Transport, TransportEvent, TransportEventKind, TransportEventSender,
};

/// Ports on which the broker is assumed to speak TLS.
pub const TLS_PORTS: [u16; 4] = [8883, 8884, 8885, 443];

/// Request slots kept free for subscribes and the disconnect on top of a full queue flush.
const REQUEST_HEADROOM: usize = 16;

pub struct MqttTransport {
    config: TransportConfig,
    queue_capacity: usize,
}

impl MqttTransport {
    pub fn new(config: TransportConfig, queue_capacity: usize) -> Self {
        Self { config, queue_capacity }
    }

    /// Never smaller than a full offline queue plus headroom.
    fn request_capacity(&self) -> usize {
        self.config.channel_capacity.max(self.queue_capacity + REQUEST_HEADROOM)
    }

    /// Client side of a link plus the event loop that must be pumped for it.
    fn open(&self, cfg: &ConnectionConfig) -> (MqttLink, EventLoop) {
        let capacity = self.request_capacity();
        let mut options = self.build_options(cfg);
        options.set_inflight(capacity.min(u16::MAX as usize) as u16);

        let (client, eventloop) = AsyncClient::new(options, capacity);
        let link = MqttLink {
            client,
            cancel: CancellationToken::new(),
            tracker: Arc::new(Mutex::new(PublishTracker::default())),
        };
        (link, eventloop)
    }

    fn build_options(&self, cfg: &ConnectionConfig) -> MqttOptions {
        let port = cfg.port_number();
        let tls = TLS_PORTS.contains(&port);
        let client_id = format!("telemux-{}", &Uuid::new_v4().simple().to_string()[..8]);

        let mut options = match cfg.mode {
            TransportMode::Tcp => {
                let mut o = MqttOptions::new(client_id, cfg.host.clone(), port);
                if tls {
                    o.set_transport(rumqttc::Transport::tls_with_default_config());
                }
                o
            }
            TransportMode::WebSocket => {
                let scheme = if tls { "wss" } else { "ws" };
                let url = format!("{}://{}:{}{}", scheme, cfg.host, port, cfg.ws_path());
                let mut o = MqttOptions::new(client_id, url, port);
                if tls {
                    o.set_transport(rumqttc::Transport::wss_with_default_config());
                } else {
                    o.set_transport(rumqttc::Transport::Ws);
                }
                o
            }
        };

        options
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs))
            .set_clean_session(true);

        if let Some(user) = &cfg.user {
            options.set_credentials(user.clone(), cfg.pass.clone().unwrap_or_default());
        }
        options
    }
}

impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn connect(&self, config: &ConnectionConfig, link: LinkId, events: TransportEventSender) -> Box<dyn Link> {
        info!(
            "[MQTT] Link {} connecting to {}:{} ({:?})",
            link, config.host, config.port, config.mode
        );

        let (mqtt_link, eventloop) = self.open(config);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        tokio::spawn(pump(
            link,
            eventloop,
            events,
            mqtt_link.cancel.clone(),
            mqtt_link.tracker.clone(),
            timeout,
        ));

        Box::new(mqtt_link)
    }
}

/// Tokens of publishes handed to rumqttc, in request order. The event loop
/// writes requests in the same order, which is how a packet id is matched
/// back to its token.
#[derive(Default)]
struct PublishTracker {
    next: PublishToken,
    queued: VecDeque<PublishToken>,
}

async fn pump(
    link: LinkId,
    mut eventloop: EventLoop,
    events: TransportEventSender,
    cancel: CancellationToken,
    tracker: Arc<Mutex<PublishTracker>>,
    connect_timeout: Duration,
) {
    let report = |kind: TransportEventKind| {
        let _ = events.send(TransportEvent { link, kind });
    };

    let mut connected = false;
    let mut awaiting_ack: HashMap<u16, PublishToken> = HashMap::new();
    let deadline = tokio::time::sleep(connect_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[MQTT] Link {} cancelled", link);
                break;
            }

            _ = &mut deadline, if !connected => {
                report(TransportEventKind::ConnectFailed(format!(
                    "connect timed out after {:?}", connect_timeout
                )));
                break;
            }

            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        connected = true;
                        report(TransportEventKind::Connected);
                    } else {
                        report(TransportEventKind::ConnectFailed(format!("broker refused: {:?}", ack.code)));
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    report(TransportEventKind::Message { topic: p.topic, payload: p.payload });
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    if let Some(token) = tracker.lock().queued.pop_front() {
                        awaiting_ack.insert(pkid, token);
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    match awaiting_ack.remove(&ack.pkid) {
                        Some(token) => report(TransportEventKind::Acked(token)),
                        None => debug!("[MQTT] Link {} ack for unknown packet {}", link, ack.pkid),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    report(TransportEventKind::Closed("broker sent DISCONNECT".into()));
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("[MQTT] Link {} error: {}", link, e);
                    if connected {
                        report(TransportEventKind::Closed(e.to_string()));
                    } else {
                        report(TransportEventKind::ConnectFailed(e.to_string()));
                    }
                    break;
                }
            }
        }
    }
}

struct MqttLink {
    client: AsyncClient,
    cancel: CancellationToken,
    tracker: Arc<Mutex<PublishTracker>>,
}

impl Link for MqttLink {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::new(format!("subscribe {}: {}", topic, e)))
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishToken, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::new("link closed"));
        }
        // Held across the request so the pump cannot see it before its token
        let mut tracker = self.tracker.lock();
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| TransportError::new(format!("publish {}: {}", topic, e)))?;
        let token = tracker.next;
        tracker.next += 1;
        tracker.queued.push_back(token);
        Ok(token)
    }

    fn close(&self) {
        let _ = self.client.try_disconnect();
        self.cancel.cancel();
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_is_picked_from_known_ports() {
        assert!(TLS_PORTS.contains(&8883));
        assert!(TLS_PORTS.contains(&443));
        assert!(!TLS_PORTS.contains(&1883));
    }

    #[test]
    fn builds_credentials_and_keep_alive() {
        let transport = MqttTransport::new(TransportConfig::default(), 100);
        let cfg = ConnectionConfig::new("broker.local", 1883, "gh/")
            .with_credentials("grower", "secret")
            .normalized()
            .unwrap();
        let options = transport.build_options(&cfg);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(options.credentials(), Some(("grower".to_string(), "secret".to_string())));
    }

    #[test]
    fn websocket_host_is_a_url() {
        let transport = MqttTransport::new(TransportConfig::default(), 100);
        let cfg = ConnectionConfig::new("broker.local", 8884, "gh/")
            .with_mode(TransportMode::WebSocket)
            .normalized()
            .unwrap();
        let options = transport.build_options(&cfg);
        assert_eq!(options.broker_address().0, "wss://broker.local:8884/mqtt");
    }

    #[test]
    fn full_queue_fits_in_request_channel() {
        let transport = MqttTransport::new(TransportConfig::default(), 100);
        let cfg = ConnectionConfig::new("broker.local", 1883, "gh/").normalized().unwrap();
        // event loop is kept but never polled, so nothing drains the channel
        let (link, _eventloop) = transport.open(&cfg);

        let tokens: Vec<_> = (0..100)
            .map(|i| link.publish(&format!("gh/set/k{}", i), Bytes::from_static(b"1")).unwrap())
            .collect();
        assert_eq!(tokens, (0..100).collect::<Vec<_>>());
        // subscribes still fit after a full flush
        link.subscribe("gh/state/json").unwrap();
    }

    #[test]
    fn explicit_channel_capacity_can_only_grow() {
        let config = TransportConfig { channel_capacity: 512, ..TransportConfig::default() };
        assert_eq!(MqttTransport::new(config, 100).request_capacity(), 512);
        assert_eq!(MqttTransport::new(TransportConfig::default(), 100).request_capacity(), 116);
    }
}
