//! Hub: cloneable handle to the supervisor's inbox.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::cache::StateCache;
use crate::config::Config;
use crate::error::MuxError;
use crate::mux::facade::ConsumerFacade;
use crate::mux::supervisor::{Supervisor, SupervisorCommand};
use crate::mux::types::{ConnectionConfig, ConnectivityStatus};
use crate::transport::Transport;

#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl Hub {
    /// Opens the state cache and starts the supervisor task.
    pub fn spawn(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, MuxError> {
        let cache = StateCache::open(&config.cache)?;
        let (tx, rx) = mpsc::channel(config.supervisor.inbox_capacity.max(1));
        let supervisor = Supervisor::new(config, transport, cache, rx);
        tokio::spawn(supervisor.run());
        Ok(Self { tx })
    }

    /// Registers a new consumer. Its receiver already holds the current
    /// status and, when available, the latest snapshot.
    pub async fn attach(&self) -> Result<ConsumerFacade, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Attach { reply }).await?;
        let (id, events) = rx.await.map_err(|_| MuxError::HubClosed)?;
        Ok(ConsumerFacade::new(id, events, self.clone()))
    }

    pub async fn status(&self) -> Result<ConnectivityStatus, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Status { reply }).await?;
        rx.await.map_err(|_| MuxError::HubClosed)
    }

    /// Feeds an OS-level connectivity signal to the supervisor.
    pub async fn set_network(&self, online: bool) -> Result<(), MuxError> {
        self.send(SupervisorCommand::Network { online }).await
    }

    /// Last config used to connect, password stripped.
    pub async fn saved_config(&self) -> Result<Option<ConnectionConfig>, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::SavedConfig { reply }).await?;
        rx.await.map_err(|_| MuxError::HubClosed)
    }

    pub async fn endpoint_count(&self) -> Result<usize, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::EndpointCount { reply }).await?;
        rx.await.map_err(|_| MuxError::HubClosed)
    }

    pub async fn shutdown(&self) -> Result<(), MuxError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Stop { reply }).await?;
        rx.await.map_err(|_| MuxError::HubClosed)
    }

    pub(crate) async fn send(&self, cmd: SupervisorCommand) -> Result<(), MuxError> {
        self.tx.send(cmd).await.map_err(|_| MuxError::HubClosed)
    }

    /// Non-async send for `Drop` paths. Falls back to a spawned send when the
    /// inbox is full and a runtime is around.
    pub(crate) fn send_detached(&self, cmd: SupervisorCommand) {
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(cmd).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
