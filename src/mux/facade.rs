//! Consumer Facade: what one consumer holds.
//!
//! Dropping the facade detaches its endpoint, so a consumer that goes away
//! without saying goodbye is still removed from the registry.

use tokio::sync::oneshot;

use crate::error::MuxError;
use crate::mux::broadcaster::EventReceiver;
use crate::mux::hub::Hub;
use crate::mux::supervisor::SupervisorCommand;
use crate::mux::types::{ConnectionConfig, EndpointId, HubEvent};

pub struct ConsumerFacade {
    id: EndpointId,
    events: EventReceiver,
    hub: Hub,
    detached: bool,
}

impl ConsumerFacade {
    pub(crate) fn new(id: EndpointId, events: EventReceiver, hub: Hub) -> Self {
        Self { id, events, hub, detached: false }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Validates the config here, so `InvalidConfig` comes back to the caller
    /// and never reaches the supervisor.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<(), MuxError> {
        let config = config.normalized()?;
        self.hub.send(SupervisorCommand::Connect { config }).await
    }

    pub async fn publish(&self, key: impl Into<String>, value: impl ToString) -> Result<(), MuxError> {
        self.hub
            .send(SupervisorCommand::Publish { key: key.into(), value: value.to_string() })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), MuxError> {
        self.hub.send(SupervisorCommand::Disconnect).await
    }

    /// Replays the current snapshot to this consumer only.
    pub async fn request_state(&self) -> Result<(), MuxError> {
        self.hub.send(SupervisorCommand::RequestState { id: self.id }).await
    }

    /// Asks the broker for a fresh snapshot.
    pub async fn resync(&self) -> Result<(), MuxError> {
        self.hub.send(SupervisorCommand::Resync).await
    }

    pub async fn set_network(&self, online: bool) -> Result<(), MuxError> {
        self.hub.set_network(online).await
    }

    /// Next event. `None` once the hub dropped this endpoint.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.events.try_recv().ok()
    }

    /// Detaches and waits until the supervisor processed it.
    pub async fn detach(mut self) -> Result<(), MuxError> {
        self.detached = true;
        let (reply, rx) = oneshot::channel();
        self.hub
            .send(SupervisorCommand::Detach { id: self.id, reply: Some(reply) })
            .await?;
        rx.await.map_err(|_| MuxError::HubClosed)
    }
}

impl Drop for ConsumerFacade {
    fn drop(&mut self) {
        if !self.detached {
            self.hub.send_detached(SupervisorCommand::Detach { id: self.id, reply: None });
        }
    }
}
