#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use telemux::cache::types::PersistenceMode;
use telemux::config::Config;
use telemux::mux::{ConnectionConfig, ConnectivityStatus, ConsumerFacade, Hub, HubEvent};
use telemux::transport::{MemoryBroker, MemoryTransport};
use tempfile::TempDir;

pub const STATE_TOPIC: &str = "gh/one/state/json";

/// Reference timings, cache kept in memory.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.cache.mode = PersistenceMode::Memory;
    config
}

/// Same, with a durable cache in a fresh temp dir (kept alive by the returned guard).
pub fn durable_config() -> (Config, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.cache.mode = PersistenceMode::Sync;
    config.cache.persistence_path = temp_dir.path().join("telemux.db").to_string_lossy().to_string();
    (config, temp_dir)
}

pub fn setup_hub() -> (Hub, MemoryBroker) {
    setup_hub_with(&test_config())
}

pub fn setup_hub_with(config: &Config) -> (Hub, MemoryBroker) {
    let broker = MemoryBroker::new();
    let hub = Hub::spawn(config, Arc::new(MemoryTransport::new(broker.clone()))).unwrap();
    (hub, broker)
}

pub fn device_config() -> ConnectionConfig {
    ConnectionConfig::new("broker.test", 1883, "gh/one").with_credentials("grower", "secret")
}

pub async fn next_event(consumer: &mut ConsumerFacade) -> HubEvent {
    tokio::time::timeout(Duration::from_secs(120), consumer.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("endpoint closed")
}

/// Skips events until one matches.
pub async fn recv_until<F>(consumer: &mut ConsumerFacade, pred: F) -> HubEvent
where
    F: Fn(&HubEvent) -> bool,
{
    loop {
        let event = next_event(consumer).await;
        if pred(&event) {
            return event;
        }
    }
}

pub async fn wait_status(consumer: &mut ConsumerFacade, wanted: ConnectivityStatus) -> HubEvent {
    recv_until(consumer, |e| matches!(e, HubEvent::Status { status, .. } if *status == wanted)).await
}

/// Round-trips the inbox so every command sent before this has been handled.
pub async fn sync(hub: &Hub) {
    hub.status().await.unwrap();
}

pub fn drain(consumer: &mut ConsumerFacade) -> Vec<HubEvent> {
    std::iter::from_fn(|| consumer.try_recv()).collect()
}

pub fn statuses(events: &[HubEvent]) -> Vec<ConnectivityStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            HubEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

pub fn published_on(broker: &MemoryBroker, topic: &str) -> Vec<String> {
    broker
        .published()
        .into_iter()
        .filter(|(t, _)| t == topic)
        .map(|(_, payload)| String::from_utf8_lossy(&payload).to_string())
        .collect()
}
