use crate::constants::*;
use crate::models::ConnectorType;
use crate::{ForemanError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub dispatcher: DispatcherConfig,
    pub registry: RegistryConfig,
    pub queue: QueueConfig,
    pub connector: ConnectorConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
    pub retry_max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub retry_base_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,
    pub high_pool_workers: usize,
    pub default_pool_workers: usize,
    pub warmup_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
    /// Connector type used for auto-provisioned agents.
    pub default_connector: ConnectorType,
    pub auto_provision: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_pending_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Path to the Claude Code binary; searched on PATH when unset.
    pub claude_binary_path: Option<String>,
    /// Tools the child is allowed to use, passed as a CLI allow-list.
    pub allowed_tools: Vec<String>,
    #[serde(with = "duration_millis")]
    pub command_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub disconnect_grace: Duration,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub subscriber_outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Snapshot file for the JSON store; in-memory only when unset.
    pub state_file: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let api_key = env::var("FOREMAN_API_KEY").ok();
        match &api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(ForemanError::ConfigurationError(
                    "FOREMAN_API_KEY cannot be blank; generate one with: openssl rand -hex 32"
                        .to_string(),
                ));
            }
            Some(key) if key.len() < 32 => {
                return Err(ForemanError::ConfigurationError(
                    "FOREMAN_API_KEY must be at least 32 characters".to_string(),
                ));
            }
            Some(_) => tracing::info!("API authentication configured"),
            None => tracing::warn!("FOREMAN_API_KEY not set; API runs unauthenticated"),
        }

        let allowed_origins = env::var("FOREMAN_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("FOREMAN_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("FOREMAN_API_PORT", 3000),
            api_key,
            allowed_origins,
        };

        let dispatcher = DispatcherConfig {
            tick_interval: env_duration_ms(
                "FOREMAN_DISPATCHER_TICK_INTERVAL_MS",
                DEFAULT_DISPATCHER_TICK_INTERVAL,
            ),
            retry_max_attempts: env_parse("FOREMAN_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
            retry_base_backoff: env_duration_secs(
                "FOREMAN_RETRY_BASE_BACKOFF_SECS",
                DEFAULT_RETRY_BASE_BACKOFF,
            ),
            shutdown_grace: env_duration_secs("FOREMAN_SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE),
            high_pool_workers: env_parse("FOREMAN_HIGH_POOL_WORKERS", HIGH_POOL_WORKERS).max(1),
            default_pool_workers: env_parse("FOREMAN_DEFAULT_POOL_WORKERS", DEFAULT_POOL_WORKERS)
                .max(1),
            warmup_on_startup: env_parse("FOREMAN_WARMUP_ON_STARTUP", true),
        };

        let default_connector = env::var("FOREMAN_DEFAULT_CONNECTOR")
            .ok()
            .map(|raw| {
                ConnectorType::from_str(&raw).map_err(|e| {
                    ForemanError::ConfigurationError(format!("FOREMAN_DEFAULT_CONNECTOR: {e}"))
                })
            })
            .transpose()?
            .unwrap_or(ConnectorType::ClaudeCode);

        let registry = RegistryConfig {
            heartbeat_timeout: env_duration_secs(
                "FOREMAN_HEARTBEAT_TIMEOUT_SECS",
                DEFAULT_HEARTBEAT_TIMEOUT,
            ),
            sweep_interval: env_duration_secs(
                "FOREMAN_HEARTBEAT_SWEEP_INTERVAL_SECS",
                HEARTBEAT_SWEEP_INTERVAL,
            ),
            default_connector,
            auto_provision: env_parse("FOREMAN_AUTO_PROVISION", true),
        };

        let queue = QueueConfig {
            max_pending_tasks: env_parse("FOREMAN_MAX_PENDING_TASKS", DEFAULT_MAX_PENDING_TASKS),
        };

        let allowed_tools = env::var("FOREMAN_ALLOWED_TOOLS")
            .unwrap_or_else(|_| "Read,Write,Edit,Glob,Grep,Bash".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let connector = ConnectorConfig {
            claude_binary_path: env::var("FOREMAN_CLAUDE_BINARY").ok(),
            allowed_tools,
            command_timeout: env_duration_secs(
                "FOREMAN_COMMAND_TIMEOUT_SECS",
                DEFAULT_PER_AGENT_COMMAND_TIMEOUT,
            ),
            disconnect_grace: env_duration_secs(
                "FOREMAN_CONNECTOR_GRACE_SECS",
                DEFAULT_CONNECTOR_GRACE,
            ),
            max_concurrent: env_parse("FOREMAN_MAX_CONCURRENT_COMMANDS", DEFAULT_MAX_CONCURRENT_COMMANDS)
                .max(1),
        };

        let bus = BusConfig {
            subscriber_outbound_buffer: env_parse(
                "FOREMAN_SUBSCRIBER_BUFFER",
                DEFAULT_SUBSCRIBER_OUTBOUND_BUFFER,
            )
            .max(1),
        };

        let store = StoreConfig {
            state_file: env::var("FOREMAN_STATE_FILE").ok(),
        };

        Ok(Config {
            api,
            dispatcher,
            registry,
            queue,
            connector,
            bus,
            store,
        })
    }
}

impl Default for Config {
    /// Built-in defaults, used by tests and local development. `load`
    /// is the production path.
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                api_key: None,
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            dispatcher: DispatcherConfig {
                tick_interval: DEFAULT_DISPATCHER_TICK_INTERVAL,
                retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
                retry_base_backoff: DEFAULT_RETRY_BASE_BACKOFF,
                shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
                high_pool_workers: HIGH_POOL_WORKERS,
                default_pool_workers: DEFAULT_POOL_WORKERS,
                warmup_on_startup: true,
            },
            registry: RegistryConfig {
                heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
                sweep_interval: HEARTBEAT_SWEEP_INTERVAL,
                default_connector: ConnectorType::ClaudeCode,
                auto_provision: true,
            },
            queue: QueueConfig {
                max_pending_tasks: DEFAULT_MAX_PENDING_TASKS,
            },
            connector: ConnectorConfig {
                claude_binary_path: None,
                allowed_tools: vec![
                    "Read".to_string(),
                    "Write".to_string(),
                    "Edit".to_string(),
                    "Glob".to_string(),
                    "Grep".to_string(),
                    "Bash".to_string(),
                ],
                command_timeout: DEFAULT_PER_AGENT_COMMAND_TIMEOUT,
                disconnect_grace: DEFAULT_CONNECTOR_GRACE,
                max_concurrent: DEFAULT_MAX_CONCURRENT_COMMANDS,
            },
            bus: BusConfig {
                subscriber_outbound_buffer: DEFAULT_SUBSCRIBER_OUTBOUND_BUFFER,
            },
            store: StoreConfig { state_file: None },
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Serde adapter storing durations as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
