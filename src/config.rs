use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use crate::cache::types::PersistenceMode;

static CONFIG: OnceLock<Config> = OnceLock::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub commands: CommandConfig,
    pub cache: CacheConfig,
    pub transport: TransportConfig,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            server: ServerConfig::load(),
            supervisor: SupervisorConfig::load(),
            commands: CommandConfig::load(),
            cache: CacheConfig::load(),
            transport: TransportConfig::load(),
        }
    }
}

// --- MODULES ---

// SERVER
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// "mqtt" or "memory"
    pub transport: String,
}

impl ServerConfig {
    fn load() -> Self {
        Self {
            host:      get_env("TELEMUX_HOST", "127.0.0.1"),
            port:      get_env("TELEMUX_PORT", "7700"),
            log_level: get_env("TELEMUX_LOG", "info"),
            transport: get_env("TELEMUX_TRANSPORT", "mqtt"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7700,
            log_level: "info".to_string(),
            transport: "mqtt".to_string(),
        }
    }
}

// SUPERVISOR
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub inbox_capacity: usize,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_max_ms: u64,
    /// Delay between connect and the follow-up resubscribe that asks for a fresh snapshot
    pub settle_delay_ms: u64,
    /// Connected but silent for this long -> stale
    pub stale_after_ms: u64,
}

impl SupervisorConfig {
    fn load() -> Self {
        Self {
            inbox_capacity:  get_env("SUPERVISOR_INBOX_CAP", "1024"),
            backoff_base_ms: get_env("BACKOFF_BASE_MS", "2000"),
            backoff_factor:  get_env("BACKOFF_FACTOR", "1.7"),
            backoff_max_ms:  get_env("BACKOFF_MAX_MS", "15000"),
            settle_delay_ms: get_env("SETTLE_DELAY_MS", "300"),
            stale_after_ms:  get_env("STALE_AFTER_MS", "35000"),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            backoff_base_ms: 2000,
            backoff_factor: 1.7,
            backoff_max_ms: 15000,
            settle_delay_ms: 300,
            stale_after_ms: 35000,
        }
    }
}

// COMMANDS
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub throttle_ms: u64,
    pub queue_capacity: usize,
    /// Wait before retrying a flush that stopped on a failed publish
    pub flush_retry_ms: u64,
}

impl CommandConfig {
    fn load() -> Self {
        Self {
            throttle_ms:    get_env("PUBLISH_THROTTLE_MS", "400"),
            queue_capacity: get_env("OFFLINE_QUEUE_CAP", "100"),
            flush_retry_ms: get_env("FLUSH_RETRY_MS", "1000"),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { throttle_ms: 400, queue_capacity: 100, flush_retry_ms: 1000 }
    }
}

// CACHE
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub persistence_path: String,
    pub freshness_ms: u64,
    pub mode: PersistenceMode,
    pub writer_channel_capacity: usize,
}

impl CacheConfig {
    fn load() -> Self {
        let mode: String = get_env("CACHE_MODE", "async");
        let flush_ms: u64 = get_env("CACHE_FLUSH_MS", "50");
        Self {
            persistence_path:        get_env("CACHE_PATH", "./data/telemux.db"),
            freshness_ms:            get_env("CACHE_FRESHNESS_MS", "300000"), // 5 minutes
            mode:                    PersistenceMode::from_name(&mode, flush_ms),
            writer_channel_capacity: get_env("CACHE_WRITER_CHAN_CAP", "64"),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistence_path: "./data/telemux.db".to_string(),
            freshness_ms: 300_000,
            mode: PersistenceMode::Memory,
            writer_channel_capacity: 64,
        }
    }
}

// TRANSPORT
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub channel_capacity: usize,
}

impl TransportConfig {
    fn load() -> Self {
        Self {
            connect_timeout_ms: get_env("MQTT_CONNECT_TIMEOUT_MS", "10000"),
            keep_alive_secs:    get_env("MQTT_KEEP_ALIVE_SECS", "30"),
            // Raised to the offline queue capacity plus headroom when smaller
            channel_capacity:   get_env("MQTT_CHAN_CAP", "64"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { connect_timeout_ms: 10_000, keep_alive_secs: 30, channel_capacity: 64 }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            // Logging is not up yet while config loads
            eprintln!("Config error: {} must be valid (got {:?}), using {}", key, raw, default);
            match default.parse() {
                Ok(value) => value,
                Err(_) => unreachable!("default for {} does not parse", key),
            }
        }
    }
}
