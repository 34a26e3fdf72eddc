/// Configuration management for the flowrunner worker
///
/// Handles server, state store, event channel, worker pool, queue retry and
/// persistence parameters. Every value has a default and can be overridden
/// with a `FLOWRUNNER_*` environment variable.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Read an environment variable, falling back to `default` when it is unset
/// or does not parse
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Live execution state
    pub state: StateConfig,
    /// Execution event channel
    pub events: EventsConfig,
    /// Worker pool
    pub worker: WorkerConfig,
    /// Retry policy for failed deliveries
    pub queue: QueueConfig,
    /// Per-execution listener sweep
    pub listeners: ListenerConfig,
    /// Execution history and credential metadata
    pub database: DatabaseConfig,
    /// Node runtime integration
    pub runtime: RuntimeConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Which state store implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Memory,
    Redis,
}

impl FromStr for StateBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "memory" => Ok(StateBackend::Memory),
            "redis" => Ok(StateBackend::Redis),
            other => Err(format!("unknown state backend '{}'", other)),
        }
    }
}

/// Live state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub backend: StateBackend,
    /// Also used by the Redis event bus
    pub redis_url: String,
    /// Retention of a live execution (default: 24h)
    pub active_ttl_secs: u64,
    /// Retention once an execution is terminal (default: 1h)
    pub completion_ttl_secs: u64,
    pub key_prefix: String,
    /// How often expired in-process entries are purged
    pub reclaim_interval_secs: u64,
}

impl StateConfig {
    pub fn active_ttl(&self) -> Duration {
        Duration::from_secs(self.active_ttl_secs)
    }

    pub fn completion_ttl(&self) -> Duration {
        Duration::from_secs(self.completion_ttl_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

/// Event channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel name shared by every worker
    pub channel: String,
    /// Events kept per execution for late subscribers
    pub buffer_max_events: usize,
    pub buffer_ttl_secs: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum jobs processed concurrently
    pub concurrency: usize,
    /// Per-node execution budget
    pub node_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }
}

/// Queue retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub attempts: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
}

/// Listener lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub sweep_interval_secs: u64,
    /// Batches older than this are swept
    pub max_age_secs: u64,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL (e.g., "sqlite://data/flowrunner.db?mode=rwc"); empty disables
    /// history and credential lookup
    pub url: String,
}

/// Node runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Endpoint the HTTP node executor POSTs requests to
    pub node_executor_url: String,
    /// JSON file with node type descriptions; empty starts with none
    pub node_types_path: String,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_string("FLOWRUNNER_HOST", "0.0.0.0"),
                port: env_or("FLOWRUNNER_PORT", 3005),
            },
            state: StateConfig {
                backend: env_or("FLOWRUNNER_STATE_BACKEND", StateBackend::Memory),
                redis_url: env_string("FLOWRUNNER_REDIS_URL", "redis://127.0.0.1:6379"),
                active_ttl_secs: env_or("FLOWRUNNER_ACTIVE_TTL_SECS", 24 * 60 * 60),
                completion_ttl_secs: env_or("FLOWRUNNER_COMPLETION_TTL_SECS", 60 * 60),
                key_prefix: env_string("FLOWRUNNER_KEY_PREFIX", "flowrunner"),
                reclaim_interval_secs: env_or("FLOWRUNNER_RECLAIM_INTERVAL_SECS", 60),
            },
            events: EventsConfig {
                channel: env_string("FLOWRUNNER_EVENTS_CHANNEL", "flowrunner:execution-events"),
                buffer_max_events: env_or("FLOWRUNNER_EVENT_BUFFER_MAX", 50),
                buffer_ttl_secs: env_or("FLOWRUNNER_EVENT_BUFFER_TTL_SECS", 300),
            },
            worker: WorkerConfig {
                concurrency: env_or("FLOWRUNNER_CONCURRENCY", 5),
                node_timeout_ms: env_or("FLOWRUNNER_NODE_TIMEOUT_MS", 300_000),
            },
            queue: QueueConfig {
                attempts: env_or("FLOWRUNNER_QUEUE_ATTEMPTS", 3),
                backoff_base_ms: env_or("FLOWRUNNER_QUEUE_BACKOFF_MS", 1000),
            },
            listeners: ListenerConfig {
                sweep_interval_secs: env_or("FLOWRUNNER_LISTENER_SWEEP_SECS", 60),
                max_age_secs: env_or("FLOWRUNNER_LISTENER_MAX_AGE_SECS", 60 * 60),
            },
            database: DatabaseConfig {
                url: env_string("FLOWRUNNER_DATABASE_URL", "sqlite://data/flowrunner.db?mode=rwc"),
            },
            runtime: RuntimeConfig {
                node_executor_url: env_string(
                    "FLOWRUNNER_NODE_EXECUTOR_URL",
                    "http://127.0.0.1:3006/execute",
                ),
                node_types_path: env_string("FLOWRUNNER_NODE_TYPES_PATH", ""),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.state.key_prefix.is_empty());
        assert!(config.worker.concurrency >= 1);
        assert!(config.state.completion_ttl() <= config.state.active_ttl());
        assert!(!config.state.reclaim_interval().is_zero());
    }

    #[test]
    fn test_state_backend_parsing() {
        assert_eq!("Redis".parse::<StateBackend>().unwrap(), StateBackend::Redis);
        assert_eq!("memory".parse::<StateBackend>().unwrap(), StateBackend::Memory);
        assert!("postgres".parse::<StateBackend>().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("FLOWRUNNER_TEST_GARBAGE_PORT", "not-a-number");
        assert_eq!(env_or::<u16>("FLOWRUNNER_TEST_GARBAGE_PORT", 42), 42);
        assert_eq!(env_or::<u16>("FLOWRUNNER_TEST_UNSET_PORT", 7), 7);
    }
}
