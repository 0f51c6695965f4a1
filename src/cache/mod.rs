//! State Cache: durable single-slot snapshot + last used connection config.
//!
//! The persisted row is read once when the cache opens (warm start) and
//! mirrored in memory afterwards; writes go to a dedicated writer task.

pub mod types;
mod sqlite;
mod writer;

use std::path::PathBuf;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::error::MuxError;
use crate::mux::types::{ConnectionConfig, TelemetrySnapshot};
use crate::utils::current_time_ms;
use sqlite::{init_db, load_config, load_snapshot};
use types::{PersistenceMode, StorageOp, StoreCommand};
use writer::run_writer;

pub struct StateCache {
    sender: Option<mpsc::Sender<StoreCommand>>,
    mode: PersistenceMode,
    freshness_ms: u64,
    snapshot: Option<TelemetrySnapshot>,
    config: Option<ConnectionConfig>,
}

impl StateCache {
    /// Opens (or creates) the cache. Must run inside a tokio runtime unless
    /// the mode is `Memory`.
    pub fn open(config: &CacheConfig) -> Result<Self, MuxError> {
        let db_path = PathBuf::from(&config.persistence_path);

        if let PersistenceMode::Memory = config.mode {
            return Ok(Self {
                sender: None,
                mode: PersistenceMode::Memory,
                freshness_ms: config.freshness_ms,
                snapshot: None,
                config: None,
            });
        }

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| MuxError::Cache(format!("create {:?}: {}", parent, e)))?;
        }

        // Schema must exist before the warm start read and before the writer runs
        let conn = Connection::open(&db_path)?;
        init_db(&conn, &config.mode)?;

        let snapshot = match load_snapshot(&conn)? {
            Some((body, timestamp)) => match serde_json::from_str(&body) {
                Ok(data) => Some(TelemetrySnapshot::new(data, timestamp)),
                Err(e) => {
                    warn!("Ignoring unreadable cached snapshot in {:?}: {}", db_path, e);
                    None
                }
            },
            None => None,
        };
        let saved_config = match load_config(&conn)? {
            Some(body) => serde_json::from_str(&body).ok(),
            None => None,
        };
        drop(conn);

        if let Some(s) = &snapshot {
            info!("State cache warm start: snapshot captured at {} ({} keys)", s.timestamp, s.data.len());
        }

        let (tx, rx) = mpsc::channel(config.writer_channel_capacity.max(1));
        tokio::spawn(run_writer(rx, db_path, config.mode.clone()));

        Ok(Self {
            sender: Some(tx),
            mode: config.mode.clone(),
            freshness_ms: config.freshness_ms,
            snapshot,
            config: saved_config,
        })
    }

    /// Overwrites the single slot.
    pub async fn save(&mut self, snapshot: &TelemetrySnapshot) -> Result<(), MuxError> {
        self.snapshot = Some(snapshot.clone());
        let body = serde_json::to_string(&snapshot.data).map_err(|e| MuxError::Cache(e.to_string()))?;
        self.execute(StorageOp::SaveSnapshot { snapshot: body, timestamp: snapshot.timestamp }).await
    }

    /// Cached snapshot if younger than the freshness bound.
    pub fn load(&self) -> Option<TelemetrySnapshot> {
        self.load_at(current_time_ms())
    }

    /// Same as `load` with an explicit clock. Exactly at the bound is stale.
    pub fn load_at(&self, now_ms: u64) -> Option<TelemetrySnapshot> {
        self.snapshot
            .as_ref()
            .filter(|s| s.age_ms(now_ms) < self.freshness_ms)
            .cloned()
    }

    pub async fn save_config(&mut self, config: &ConnectionConfig) -> Result<(), MuxError> {
        let stripped = config.without_secret();
        let body = serde_json::to_string(&stripped).map_err(|e| MuxError::Cache(e.to_string()))?;
        self.config = Some(stripped);
        self.execute(StorageOp::SaveConfig(body)).await
    }

    pub fn load_config(&self) -> Option<ConnectionConfig> {
        self.config.clone()
    }

    async fn execute(&self, op: StorageOp) -> Result<(), MuxError> {
        if let PersistenceMode::Memory = self.mode {
            return Ok(());
        }

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| MuxError::Cache("store uninitialized".into()))?;

        match self.mode {
            PersistenceMode::Sync => {
                let (tx, rx) = oneshot::channel();
                sender
                    .send(StoreCommand { op, sync_channel: Some(tx) })
                    .await
                    .map_err(|_| MuxError::Cache("writer channel closed".into()))?;
                rx.await
                    .map_err(|_| MuxError::Cache("writer dropped reply".into()))?
                    .map_err(MuxError::Cache)
            }
            _ => {
                sender
                    .send(StoreCommand { op, sync_channel: None })
                    .await
                    .map_err(|_| MuxError::Cache("writer channel closed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(ts: u64) -> TelemetrySnapshot {
        let data = json!({"temp": 23.5, "light_on": 1}).as_object().cloned().unwrap();
        TelemetrySnapshot::new(data, ts)
    }

    fn memory_cache(freshness_ms: u64) -> StateCache {
        StateCache::open(&CacheConfig { freshness_ms, mode: PersistenceMode::Memory, ..CacheConfig::default() })
            .unwrap()
    }

    #[tokio::test]
    async fn freshness_bound_is_exclusive() {
        let mut cache = memory_cache(300_000);
        cache.save(&snapshot(1_000_000)).await.unwrap();

        assert!(cache.load_at(1_000_000 + 30_000).is_some());
        assert!(cache.load_at(1_000_000 + 299_999).is_some());
        assert!(cache.load_at(1_000_000 + 300_000).is_none());
        assert!(cache.load_at(1_000_000 + 900_000).is_none());
    }

    #[tokio::test]
    async fn survives_reopen_in_sync_mode() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CacheConfig {
            persistence_path: dir.path().join("cache.db").to_string_lossy().to_string(),
            mode: PersistenceMode::Sync,
            ..CacheConfig::default()
        };
        let now = current_time_ms();
        {
            let mut cache = StateCache::open(&cfg).unwrap();
            cache.save(&snapshot(now - 1_000)).await.unwrap();
            cache.save(&snapshot(now)).await.unwrap();
            cache
                .save_config(&ConnectionConfig::new("h", 1883, "gh/").with_credentials("u", "p"))
                .await
                .unwrap();
        }

        let reopened = StateCache::open(&cfg).unwrap();
        let loaded = reopened.load().expect("fresh snapshot after reopen");
        assert_eq!(loaded.timestamp, now);
        assert_eq!(loaded.get("temp"), Some(&json!(23.5)));

        let saved = reopened.load_config().unwrap();
        assert_eq!(saved.user.as_deref(), Some("u"));
        assert!(saved.pass.is_none());
    }

    #[tokio::test]
    async fn sync_save_reports_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cfg = CacheConfig {
            persistence_path: path.to_string_lossy().to_string(),
            mode: PersistenceMode::Sync,
            ..CacheConfig::default()
        };
        let mut cache = StateCache::open(&cfg).unwrap();

        // table vanishes under the writer
        Connection::open(&path).unwrap().execute("DROP TABLE state_cache", []).unwrap();

        let err = cache.save(&snapshot(current_time_ms())).await.unwrap_err();
        assert!(matches!(err, MuxError::Cache(_)), "got {:?}", err);
    }
}
