use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Process lifetime only, nothing touches disk
    Memory,
    /// Every write waits for the commit
    Sync,
    /// Writes are batched and committed every `flush_ms`
    Async { flush_ms: u64 },
}

impl PersistenceMode {
    /// "memory" | "sync" | anything else -> async
    pub fn from_name(name: &str, flush_ms: u64) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "memory" => Self::Memory,
            "sync" => Self::Sync,
            _ => Self::Async { flush_ms },
        }
    }
}

impl Default for PersistenceMode {
    fn default() -> Self {
        Self::Async { flush_ms: 50 }
    }
}

/// Single-slot writes the store knows how to execute
#[derive(Debug, Clone)]
pub enum StorageOp {
    /// Overwrite the cached snapshot (JSON text + capture time)
    SaveSnapshot { snapshot: String, timestamp: u64 },
    /// Overwrite the last used connection config (JSON text, password stripped)
    SaveConfig(String),
}

/// The command sent to the writer task
pub struct StoreCommand {
    pub op: StorageOp,
    /// If present, the caller waits for the commit (Sync mode)
    pub sync_channel: Option<oneshot::Sender<Result<(), String>>>,
}
