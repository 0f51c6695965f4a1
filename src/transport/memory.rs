//! In-process loopback broker.
//!
//! Behaves like a minimal MQTT broker with retained messages: subscribing to
//! a topic replays its retained payload, publishing delivers to exact-topic
//! subscribers. Every client publish is acknowledged like a QoS 1 PUBACK.
//! Reachability, connect latency, publish failures and ack delivery can be
//! switched at runtime, which makes it the transport of choice for tests and
//! for running the hub without a real broker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::TransportError;
use crate::mux::types::ConnectionConfig;
use crate::transport::{
    Link, LinkId, PublishToken, Transport, TransportEvent, TransportEventKind, TransportEventSender,
};

struct Session {
    link: LinkId,
    events: TransportEventSender,
    topics: HashSet<String>,
    connected: bool,
    next_token: PublishToken,
    /// Acks withheld while `hold_acks` is on
    held_acks: Vec<PublishToken>,
}

impl Session {
    fn report(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent { link: self.link, kind });
    }
}

struct BrokerState {
    reachable: bool,
    fail_publishes: bool,
    hold_acks: bool,
    /// Max unacknowledged publishes per session, like a client request channel
    window: Option<usize>,
    connect_delay: Option<Duration>,
    retained: HashMap<String, Bytes>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    published: Vec<(String, Bytes)>,
    connect_attempts: Vec<(Instant, ConnectionConfig)>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                fail_publishes: false,
                hold_acks: false,
                window: None,
                connect_delay: None,
                retained: HashMap::new(),
                sessions: HashMap::new(),
                next_session: 1,
                published: Vec::new(),
                connect_attempts: Vec::new(),
            })),
        }
    }

    // --- KNOBS ---

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// While on, publishes are accepted but not acknowledged.
    pub fn hold_acks(&self, hold: bool) {
        self.state.lock().hold_acks = hold;
    }

    pub fn set_window(&self, window: Option<usize>) {
        self.state.lock().window = window;
    }

    /// Delivers every withheld ack, oldest first.
    pub fn release_acks(&self) {
        let mut state = self.state.lock();
        for session in state.sessions.values_mut().filter(|s| s.connected) {
            for token in session.held_acks.drain(..) {
                let event = TransportEvent { link: session.link, kind: TransportEventKind::Acked(token) };
                let _ = session.events.send(event);
            }
        }
    }

    /// Drops every live session as if the network went away.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.state.lock();
        for (_, session) in state.sessions.drain() {
            if session.connected {
                session.report(TransportEventKind::Closed(reason.to_string()));
            }
        }
    }

    // --- DEVICE SIDE ---

    /// Publishes as a device would. Returns the number of sessions reached.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock();
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }
        deliver(&state, topic, &payload)
    }

    // --- INSPECTION ---

    /// Everything clients published, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.state.lock().published.clone()
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.lock().connect_attempts.iter().map(|(at, _)| *at).collect()
    }

    pub fn last_connect_config(&self) -> Option<ConnectionConfig> {
        self.state.lock().connect_attempts.last().map(|(_, cfg)| cfg.clone())
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.values().filter(|s| s.connected).count()
    }

    pub fn subscribers(&self, topic: &str) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.connected && s.topics.contains(topic))
            .count()
    }

    // --- SESSION PLUMBING ---

    fn open(&self, config: &ConnectionConfig, link: LinkId, events: TransportEventSender) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.connect_attempts.push((Instant::now(), config.clone()));

        let session = Session {
            link,
            events,
            topics: HashSet::new(),
            connected: false,
            next_token: 0,
            held_acks: Vec::new(),
        };
        let delay = state.connect_delay;

        match delay {
            None => {
                if state.reachable {
                    let mut session = session;
                    session.connected = true;
                    session.report(TransportEventKind::Connected);
                    state.sessions.insert(id, session);
                } else {
                    session.report(TransportEventKind::ConnectFailed("connection refused".into()));
                }
            }
            Some(delay) => {
                state.sessions.insert(id, session);
                let broker = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    broker.finish_handshake(id);
                });
            }
        }
        id
    }

    fn finish_handshake(&self, id: u64) {
        let mut state = self.state.lock();
        let reachable = state.reachable;
        if reachable {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.connected = true;
                session.report(TransportEventKind::Connected);
            }
        } else if let Some(session) = state.sessions.remove(&id) {
            session.report(TransportEventKind::ConnectFailed("connection refused".into()));
        }
    }

    fn subscribe(&self, id: u64, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let retained = state.retained.get(topic).cloned();
        let session = state
            .sessions
            .get_mut(&id)
            .filter(|s| s.connected)
            .ok_or_else(|| TransportError::new("not connected"))?;
        session.topics.insert(topic.to_string());
        if let Some(payload) = retained {
            session.report(TransportEventKind::Message { topic: topic.to_string(), payload });
        }
        Ok(())
    }

    fn client_publish(&self, id: u64, topic: &str, payload: Bytes) -> Result<PublishToken, TransportError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let session = state
            .sessions
            .get_mut(&id)
            .filter(|s| s.connected)
            .ok_or_else(|| TransportError::new("not connected"))?;
        if state.fail_publishes {
            return Err(TransportError::new("publish rejected"));
        }
        if state.window.is_some_and(|w| session.held_acks.len() >= w) {
            return Err(TransportError::new("request channel full"));
        }

        let token = session.next_token;
        session.next_token += 1;
        if state.hold_acks {
            session.held_acks.push(token);
        } else {
            session.report(TransportEventKind::Acked(token));
        }

        state.published.push((topic.to_string(), payload.clone()));
        deliver(state, topic, &payload);
        Ok(token)
    }

    fn close(&self, id: u64) {
        if self.state.lock().sessions.remove(&id).is_some() {
            debug!("[Memory] Session {} closed by client", id);
        }
    }
}

fn deliver(state: &BrokerState, topic: &str, payload: &Bytes) -> usize {
    let mut reached = 0;
    for session in state.sessions.values() {
        if session.connected && session.topics.contains(topic) {
            session.report(TransportEventKind::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
            reached += 1;
        }
    }
    reached
}

pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connect(&self, config: &ConnectionConfig, link: LinkId, events: TransportEventSender) -> Box<dyn Link> {
        let session = self.broker.open(config, link, events);
        Box::new(MemoryLink { broker: self.broker.clone(), session })
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    session: u64,
}

impl Link for MemoryLink {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.broker.subscribe(self.session, topic)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishToken, TransportError> {
        self.broker.client_publish(self.session, topic, payload)
    }

    fn close(&self) {
        self.broker.close(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn cfg() -> ConnectionConfig {
        ConnectionConfig::new("mem", 1883, "gh/").normalized().unwrap()
    }

    #[tokio::test]
    async fn retained_is_replayed_on_subscribe() {
        let broker = MemoryBroker::new();
        broker.publish("gh/state/json", Bytes::from_static(b"{\"a\":1}"), true);

        let transport = MemoryTransport::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = transport.connect(&cfg(), 7, tx);

        assert_eq!(rx.recv().await.unwrap(), TransportEvent { link: 7, kind: TransportEventKind::Connected });
        link.subscribe("gh/state/json").unwrap();
        match rx.recv().await.unwrap().kind {
            TransportEventKind::Message { topic, payload } => {
                assert_eq!(topic, "gh/state/json");
                assert_eq!(payload, Bytes::from_static(b"{\"a\":1}"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_broker_refuses() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let transport = MemoryTransport::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = transport.connect(&cfg(), 1, tx);

        assert!(matches!(rx.recv().await.unwrap().kind, TransportEventKind::ConnectFailed(_)));
        assert!(link.publish("gh/set/x", Bytes::from_static(b"1")).is_err());
        assert_eq!(broker.connect_attempts().len(), 1);
    }

    #[tokio::test]
    async fn publishes_are_acked_by_token() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = transport.connect(&cfg(), 5, tx);
        rx.recv().await.unwrap();

        assert_eq!(link.publish("gh/set/a", Bytes::from_static(b"1")).unwrap(), 0);
        assert_eq!(rx.recv().await.unwrap().kind, TransportEventKind::Acked(0));

        broker.hold_acks(true);
        broker.set_window(Some(1));
        assert_eq!(link.publish("gh/set/b", Bytes::from_static(b"2")).unwrap(), 1);
        assert!(link.publish("gh/set/c", Bytes::from_static(b"3")).is_err());
        assert!(rx.try_recv().is_err());

        broker.release_acks();
        assert_eq!(rx.recv().await.unwrap().kind, TransportEventKind::Acked(1));
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn drop_connections_reports_closed() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = transport.connect(&cfg(), 3, tx);
        rx.recv().await.unwrap();

        broker.drop_connections("reset");
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent { link: 3, kind: TransportEventKind::Closed("reset".into()) }
        );
        assert_eq!(broker.live_sessions(), 0);
    }
}
