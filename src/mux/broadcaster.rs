//! Fan-out Broadcaster: registry of attached consumer endpoints.
//!
//! Owned by the supervisor task, so no locking. Registration order is
//! preserved by the linked map and is the delivery order.

use hashlink::LinkedHashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::mux::types::{EndpointId, HubEvent};

pub type EventSender = mpsc::UnboundedSender<HubEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<HubEvent>;

#[derive(Default)]
pub struct Broadcaster {
    endpoints: LinkedHashMap<EndpointId, EventSender>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self { endpoints: LinkedHashMap::new() }
    }

    /// Registers a new endpoint and returns its id and receiving half.
    /// The caller replays the initial state through `send_to` before anything else runs.
    pub fn attach(&mut self) -> (EndpointId, EventReceiver) {
        let id = EndpointId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(id, tx);
        debug!("Endpoint {} attached ({} total)", id, self.endpoints.len());
        (id, rx)
    }

    /// Removes the endpoint. Returns true when the registry became empty.
    pub fn detach(&mut self, id: &EndpointId) -> bool {
        if self.endpoints.remove(id).is_some() {
            debug!("Endpoint {} detached ({} left)", id, self.endpoints.len());
        }
        self.endpoints.is_empty()
    }

    /// Delivers to a single endpoint. A closed receiver drops the endpoint.
    pub fn send_to(&mut self, id: &EndpointId, event: HubEvent) -> bool {
        let delivered = match self.endpoints.get(id) {
            Some(tx) => tx.send(event).is_ok(),
            None => return false,
        };
        if !delivered {
            self.endpoints.remove(id);
        }
        delivered
    }

    /// Delivers to every endpoint in registration order. Endpoints whose
    /// consumer is gone are dropped without affecting the others.
    /// Returns the ids that were dropped.
    pub fn broadcast(&mut self, event: &HubEvent) -> Vec<EndpointId> {
        let mut zombies = Vec::new();
        for (id, tx) in self.endpoints.iter() {
            if tx.send(event.clone()).is_err() {
                zombies.push(*id);
            }
        }
        for id in &zombies {
            self.endpoints.remove(id);
            debug!("Endpoint {} dropped (consumer gone)", id);
        }
        zombies
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.endpoints.contains_key(id)
    }
}
