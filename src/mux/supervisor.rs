//! Connection Supervisor: the actor that owns the one broker link.
//!
//! All mutable state (status, link, backoff, offline queue, throttle ledger,
//! snapshot, cache, endpoint registry) lives in this task. Consumers reach it
//! through the bounded inbox held by `Hub`; the transport reaches it through
//! an unbounded event channel tagged with the link generation.
//!
//! Timers (retry, settle resubscribe, stale watchdog, flush retry) are plain
//! deadlines; the loop sleeps until the earliest one.
//!
//! A command counts as published only once the broker acks it. Until then it
//! sits in `inflight`; if the link goes away first it returns to the front of
//! the offline queue.

use std::collections::VecDeque;
use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::StateCache;
use crate::config::Config;
use crate::mux::backoff::Backoff;
use crate::mux::broadcaster::{Broadcaster, EventReceiver};
use crate::mux::offline_queue::OfflineQueue;
use crate::mux::throttle::ThrottleLedger;
use crate::mux::types::{
    CommandAck, ConnectionConfig, ConnectivityStatus, EndpointId, HubEvent, PendingCommand, TelemetrySnapshot,
};
use crate::transport::{
    Link, LinkId, PublishToken, Transport, TransportEvent, TransportEventKind, TransportEventReceiver, TransportEventSender,
};
use crate::utils::current_time_ms;

// ==========================================
// ACTOR COMMANDS
// ==========================================

pub enum SupervisorCommand {
    Attach {
        reply: oneshot::Sender<(EndpointId, EventReceiver)>,
    },
    Detach {
        id: EndpointId,
        reply: Option<oneshot::Sender<()>>,
    },
    /// Config is already normalized by the caller
    Connect {
        config: ConnectionConfig,
    },
    Publish {
        key: String,
        value: String,
    },
    Disconnect,
    RequestState {
        id: EndpointId,
    },
    Resync,
    Network {
        online: bool,
    },
    Status {
        reply: oneshot::Sender<ConnectivityStatus>,
    },
    SavedConfig {
        reply: oneshot::Sender<Option<ConnectionConfig>>,
    },
    EndpointCount {
        reply: oneshot::Sender<usize>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

struct ActiveLink {
    id: LinkId,
    link: Box<dyn Link>,
    connected: bool,
}

pub struct Supervisor {
    rx: mpsc::Receiver<SupervisorCommand>,
    transport: Arc<dyn Transport>,
    events_tx: TransportEventSender,
    events_rx: TransportEventReceiver,

    status: ConnectivityStatus,
    detail: Option<String>,
    config: Option<ConnectionConfig>,
    link: Option<ActiveLink>,
    link_seq: LinkId,
    network_online: bool,
    /// Set by disconnect and by stand-down; cleared by the next connect
    parked: bool,

    backoff: Backoff,
    retry_at: Option<Instant>,
    settle_at: Option<Instant>,
    stale_at: Option<Instant>,
    flush_at: Option<Instant>,
    last_state_at: Instant,
    settle_delay: time::Duration,
    stale_after: time::Duration,
    flush_retry: time::Duration,

    queue: OfflineQueue,
    /// Sent on the current link, awaiting the broker ack, oldest first
    inflight: VecDeque<(PublishToken, PendingCommand)>,
    ledger: ThrottleLedger,
    snapshot: Option<Arc<TelemetrySnapshot>>,
    cache: StateCache,
    broadcaster: Broadcaster,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        cache: StateCache,
        rx: mpsc::Receiver<SupervisorCommand>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            rx,
            transport,
            events_tx,
            events_rx,
            status: ConnectivityStatus::Disconnected,
            detail: None,
            config: None,
            link: None,
            link_seq: 0,
            network_online: true,
            parked: true,
            backoff: Backoff::from_config(&config.supervisor),
            retry_at: None,
            settle_at: None,
            stale_at: None,
            flush_at: None,
            last_state_at: Instant::now(),
            settle_delay: config.supervisor.settle_delay(),
            stale_after: config.supervisor.stale_after(),
            flush_retry: time::Duration::from_millis(config.commands.flush_retry_ms),
            queue: OfflineQueue::new(config.commands.queue_capacity),
            inflight: VecDeque::new(),
            ledger: ThrottleLedger::new(time::Duration::from_millis(config.commands.throttle_ms)),
            snapshot: None,
            cache,
            broadcaster: Broadcaster::new(),
        }
    }

    pub async fn run(mut self) {
        info!("Supervisor started (transport: {})", self.transport.name());

        loop {
            let wakeup = self.next_wakeup_time();

            tokio::select! {
                // Network first: acks and state land before the next command
                biased;

                // 1. Transport events (we hold a sender, so this never yields None)
                Some(event) = self.events_rx.recv() => {
                    self.handle_transport_event(event).await;
                }

                // 2. Consumer commands
                maybe_cmd = self.rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break, // Every Hub handle dropped
                    }
                }

                // 3. Timers
                _ = time::sleep_until(wakeup.unwrap_or_else(Instant::now)), if wakeup.is_some() => {
                    self.process_time_events();
                }
            }
        }

        self.close_link();
        info!("Supervisor stopped");
    }

    fn next_wakeup_time(&self) -> Option<Instant> {
        [self.retry_at, self.settle_at, self.stale_at, self.flush_at].into_iter().flatten().min()
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) -> bool {
        match cmd {
            SupervisorCommand::Attach { reply } => {
                let (id, events) = self.broadcaster.attach();
                // Replay goes in before the reply so it precedes anything broadcast later
                let status = HubEvent::Status { status: self.status, detail: self.detail.clone() };
                self.broadcaster.send_to(&id, status);
                self.replay_state_to(&id);
                if reply.send((id, events)).is_err() {
                    self.broadcaster.detach(&id);
                    if self.broadcaster.is_empty() {
                        self.stand_down();
                    }
                }
            }

            SupervisorCommand::Detach { id, reply } => {
                if self.broadcaster.contains(&id) && self.broadcaster.detach(&id) {
                    self.stand_down();
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }

            SupervisorCommand::Connect { config } => self.handle_connect(config).await,

            SupervisorCommand::Publish { key, value } => self.handle_publish(key, value),

            SupervisorCommand::Disconnect => {
                info!("Disconnect requested");
                self.parked = true;
                self.halt();
                self.set_status(ConnectivityStatus::Disconnected, None);
            }

            SupervisorCommand::RequestState { id } => self.replay_state_to(&id),

            SupervisorCommand::Resync => {
                if !self.resubscribe() {
                    debug!("Resync ignored: not connected");
                }
            }

            SupervisorCommand::Network { online } => self.handle_network(online),

            SupervisorCommand::Status { reply } => {
                let _ = reply.send(self.status);
            }

            SupervisorCommand::SavedConfig { reply } => {
                let _ = reply.send(self.cache.load_config());
            }

            SupervisorCommand::EndpointCount { reply } => {
                let _ = reply.send(self.broadcaster.len());
            }

            SupervisorCommand::Stop { reply } => {
                self.halt();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // --- CONNECT / DISCONNECT ---

    async fn handle_connect(&mut self, config: ConnectionConfig) {
        let same = self.config.as_ref() == Some(&config);

        if same && self.link.is_some() {
            debug!("Connect ignored: already {} with the same config", self.status);
            return;
        }

        if !same {
            info!("Connection config set: {}:{} base '{}'", config.host, config.port, config.base);
            self.halt();
            self.snapshot = None;
            self.backoff.reset();
            if let Err(e) = self.cache.save_config(&config).await {
                error!("Failed to persist connection config: {}", e);
            }
            self.config = Some(config);
        }

        self.parked = false;
        self.retry_at = None;

        if !self.network_online {
            self.set_status(ConnectivityStatus::Offline, None);
            return;
        }
        self.start_attempt(ConnectivityStatus::Connecting);
    }

    fn start_attempt(&mut self, status: ConnectivityStatus) {
        let Some(config) = self.config.clone() else {
            return;
        };
        self.close_link();
        self.retry_at = None;
        self.link_seq += 1;
        let id = self.link_seq;

        self.set_status(status, None);
        debug!("Link {} attempt to {}:{}", id, config.host, config.port);
        let link = self.transport.connect(&config, id, self.events_tx.clone());
        self.link = Some(ActiveLink { id, link, connected: false });
    }

    fn schedule_retry(&mut self) {
        if self.parked || !self.network_online || self.config.is_none() {
            return;
        }
        let delay = self.backoff.next_delay();
        info!("Retrying in {:?} (failure #{})", delay, self.backoff.failures());
        self.retry_at = Some(Instant::now() + delay);
    }

    /// Drops the link and every timer. Status is left to the caller.
    fn halt(&mut self) {
        self.close_link();
        self.retry_at = None;
    }

    fn close_link(&mut self) {
        if let Some(active) = self.link.take() {
            debug!("Closing link {}", active.id);
            active.link.close();
        }
        self.settle_at = None;
        self.stale_at = None;
        self.flush_at = None;
        self.requeue_unacked();
    }

    /// Sends the link never confirmed go back ahead of the queue.
    fn requeue_unacked(&mut self) {
        if self.inflight.is_empty() {
            return;
        }
        let unacked: Vec<PendingCommand> = self.inflight.drain(..).map(|(_, cmd)| cmd).collect();
        warn!("{} command(s) left without ack, queued again", unacked.len());

        let evicted = self.queue.requeue_front(unacked.clone());
        if evicted > 0 {
            warn!("Offline queue full ({}), dropped {} oldest command(s)", self.queue.len(), evicted);
        }
        for cmd in &unacked[evicted..] {
            self.emit(HubEvent::Queued(CommandAck::from(cmd)));
        }
    }

    /// Last endpoint gone: nobody is listening, so release the broker.
    fn stand_down(&mut self) {
        info!("No endpoints left, standing down");
        self.parked = true;
        self.halt();
        self.snapshot = None;
        self.set_status(ConnectivityStatus::Disconnected, None);
    }

    // --- NETWORK AWARENESS ---

    fn handle_network(&mut self, online: bool) {
        if online == self.network_online {
            return;
        }
        self.network_online = online;

        if !online {
            info!("Network offline");
            self.halt();
            self.set_status(ConnectivityStatus::Offline, None);
            return;
        }

        info!("Network restored");
        if self.parked || self.config.is_none() {
            self.set_status(ConnectivityStatus::Disconnected, None);
        } else {
            // Skip whatever was left of the backoff wait; the failure count stays
            self.start_attempt(ConnectivityStatus::Reconnecting);
        }
    }

    // --- PUBLISH ---

    fn handle_publish(&mut self, key: String, value: String) {
        let ack = CommandAck { key: key.clone(), value: value.clone() };

        if self.ledger.check(&key, Instant::now()) {
            debug!("Publish {}={} throttled", key, value);
            self.emit(HubEvent::Throttled(ack));
            return;
        }

        let cmd = PendingCommand { key, value, enqueued_at: current_time_ms() };
        let live = self.link.as_ref().is_some_and(|l| l.connected) && self.config.is_some();

        // Anything still queued is older and must go out first
        if live && self.queue.is_empty() {
            self.send_now(cmd);
            return;
        }

        if let Some(evicted) = self.queue.enqueue(cmd) {
            warn!(
                "Offline queue full ({}), dropped oldest command {}={}",
                self.queue.len(),
                evicted.key,
                evicted.value
            );
        }
        if live {
            self.flush_queue();
        }
        // FIFO: if anything is left, the newest entry is among it
        if !self.queue.is_empty() {
            debug!("Queued {} ({} pending)", ack.key, self.queue.len());
            self.emit(HubEvent::Queued(ack));
        }
    }

    fn send_now(&mut self, cmd: PendingCommand) {
        let (Some(active), Some(config)) = (self.link.as_ref(), self.config.as_ref()) else {
            return;
        };
        let topic = config.command_topic(&cmd.key);
        let result = active.link.publish(&topic, Bytes::from(cmd.value.clone()));

        match result {
            Ok(token) => {
                debug!("Sent {} (token {})", topic, token);
                self.inflight.push_back((token, cmd));
            }
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                self.emit(HubEvent::Error { detail: e.to_string(), key: Some(cmd.key) });
            }
        }
    }

    fn flush_queue(&mut self) {
        self.flush_at = None;
        let (Some(active), Some(config)) = (self.link.as_ref().filter(|l| l.connected), self.config.as_ref()) else {
            return;
        };
        if self.queue.is_empty() {
            return;
        }

        let outcome = self
            .queue
            .flush(|cmd| active.link.publish(&config.command_topic(&cmd.key), Bytes::from(cmd.value.clone())));

        info!("Flushed {} queued command(s)", outcome.sent.len());
        self.inflight.extend(outcome.sent);
        if let Some((cmd, e)) = outcome.failed {
            warn!("Flush stopped at {}: {} ({} left)", cmd.key, e, self.queue.len());
            self.flush_at = Some(Instant::now() + self.flush_retry);
            self.emit(HubEvent::Error { detail: e.to_string(), key: Some(cmd.key) });
        }
    }

    fn on_acked(&mut self, token: PublishToken) {
        let Some(pos) = self.inflight.iter().position(|(t, _)| *t == token) else {
            debug!("Ack for unknown token {}", token);
            return;
        };
        if let Some((_, cmd)) = self.inflight.remove(pos) {
            self.emit(HubEvent::Published(CommandAck::from(&cmd)));
        }
    }

    // --- TRANSPORT EVENTS ---

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.link.as_ref().map(|l| l.id) != Some(event.link) {
            debug!("Ignoring event from abandoned link {}", event.link);
            return;
        }

        match event.kind {
            TransportEventKind::Connected => self.on_connected(),

            TransportEventKind::ConnectFailed(detail) => {
                warn!("Connect failed: {}", detail);
                self.close_link();
                self.set_status(ConnectivityStatus::Error, Some(detail));
                self.schedule_retry();
            }

            TransportEventKind::Closed(detail) => {
                warn!("Link lost: {}", detail);
                self.close_link();
                self.set_status(ConnectivityStatus::Reconnecting, Some(detail));
                self.schedule_retry();
            }

            TransportEventKind::Acked(token) => self.on_acked(token),

            TransportEventKind::Message { topic, payload } => self.on_message(topic, payload).await,
        }
    }

    fn on_connected(&mut self) {
        let Some(active) = self.link.as_mut() else {
            return;
        };
        active.connected = true;
        info!("Link {} connected", active.id);

        self.backoff.reset();
        self.retry_at = None;

        self.resubscribe();
        self.set_status(ConnectivityStatus::Connected, None);
        self.flush_queue();

        let now = Instant::now();
        self.last_state_at = now;
        self.settle_at = Some(now + self.settle_delay);
        self.stale_at = Some(now + self.stale_after);
    }

    async fn on_message(&mut self, topic: String, payload: Bytes) {
        let is_state = self.config.as_ref().map(|c| c.state_topic() == topic).unwrap_or(false);
        if !is_state {
            debug!("Ignoring message on {}", topic);
            return;
        }

        let snapshot = match TelemetrySnapshot::from_payload(&payload, current_time_ms()) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("Dropping state message: {}", e);
                return;
            }
        };

        if let Err(e) = self.cache.save(&snapshot).await {
            error!("Failed to cache snapshot: {}", e);
        }

        let now = Instant::now();
        self.last_state_at = now;
        if self.stale_at.is_some() {
            self.stale_at = Some(now + self.stale_after);
        }

        self.snapshot = Some(snapshot.clone());
        self.emit(HubEvent::State { state: snapshot, cached: false });
    }

    /// Reissues the state subscribe, which makes the broker replay the
    /// retained snapshot. Returns false when there is no live link.
    fn resubscribe(&mut self) -> bool {
        let (Some(active), Some(config)) = (self.link.as_ref().filter(|l| l.connected), self.config.as_ref()) else {
            return false;
        };
        let topic = config.state_topic();
        if let Err(e) = active.link.subscribe(&topic) {
            warn!("Subscribe to {} failed: {}", topic, e);
            return false;
        }
        debug!("Subscribed to {}", topic);
        true
    }

    // --- TIMERS ---

    fn process_time_events(&mut self) {
        let now = Instant::now();

        if self.retry_at.is_some_and(|t| t <= now) {
            self.retry_at = None;
            self.start_attempt(ConnectivityStatus::Reconnecting);
        }

        if self.settle_at.is_some_and(|t| t <= now) {
            self.settle_at = None;
            self.resubscribe();
        }

        if self.flush_at.is_some_and(|t| t <= now) {
            self.flush_queue();
        }

        if self.stale_at.is_some_and(|t| t <= now) {
            let age_ms = now.duration_since(self.last_state_at).as_millis() as u64;
            warn!("No state for {} ms, requesting a fresh snapshot", age_ms);
            self.stale_at = Some(now + self.stale_after);
            self.emit(HubEvent::Stale { age_ms });
            self.resubscribe();
        }
    }

    // --- FAN-OUT ---

    fn set_status(&mut self, status: ConnectivityStatus, detail: Option<String>) {
        if self.status == status && self.detail == detail {
            return;
        }
        debug!("Status {} -> {}", self.status, status);
        self.status = status;
        self.detail = detail.clone();
        self.emit(HubEvent::Status { status, detail });
    }

    fn emit(&mut self, event: HubEvent) {
        let zombies = self.broadcaster.broadcast(&event);
        if !zombies.is_empty() && self.broadcaster.is_empty() {
            self.stand_down();
        }
    }

    /// Live snapshot if any, otherwise the cached one while it is fresh.
    fn replay_state_to(&mut self, id: &EndpointId) {
        let event = match &self.snapshot {
            Some(live) => Some(HubEvent::State { state: live.clone(), cached: false }),
            None => self
                .cache
                .load()
                .map(|s| HubEvent::State { state: Arc::new(s), cached: true }),
        };
        if let Some(event) = event {
            self.broadcaster.send_to(id, event);
        }
    }
}
