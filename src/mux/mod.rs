pub mod types;
pub mod flags;
pub mod backoff;
pub mod throttle;
pub mod offline_queue;
pub mod broadcaster;
pub mod supervisor;
pub mod hub;
pub mod facade;

pub use facade::ConsumerFacade;
pub use hub::Hub;
pub use types::{CommandAck, ConnectionConfig, ConnectivityStatus, EndpointId, HubEvent, TelemetrySnapshot, TransportMode};
