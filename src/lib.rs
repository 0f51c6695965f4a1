pub mod config;
pub mod error;
pub mod utils;
pub mod mux;
pub mod transport;
pub mod cache;
pub mod server;

use std::sync::Arc;
use std::time::Instant;
use crate::config::Config;
use crate::error::MuxError;
use crate::mux::Hub;
use crate::transport::Transport;

// ========================================
// ENGINE (The Singleton)
// ========================================

/// One shared broker connection, handed out to any number of consumers.
/// Cheap to clone.
#[derive(Clone)]
pub struct TelemuxEngine {
    pub hub: Hub,
    pub transport: &'static str,
    pub start_time: Instant,
}

impl TelemuxEngine {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, MuxError> {
        let name = transport.name();
        Ok(Self {
            hub: Hub::spawn(config, transport)?,
            transport: name,
            start_time: Instant::now(),
        })
    }
}
