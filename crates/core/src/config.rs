use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ReporterError, Result};

/// Top-level configuration for one reporter process.
///
/// Every timeout and interval the coordination layer relies on lives
/// here with an explicit default, instead of being scattered as
/// literals across call sites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub rpc: RpcConfig,
    pub heartbeat: HeartbeatConfig,
    pub generation_queue: GenerationQueueConfig,
    pub scheduler: SchedulerConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerTransport {
    Amqp,
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub transport: BrokerTransport,
    pub url: String,
    pub connection_timeout_seconds: u64,
    /// Bound on the graceful-shutdown window; the connection is closed
    /// once it elapses even with acknowledgements still in flight.
    pub shutdown_grace_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transport: BrokerTransport::Amqp,
            url: "amqp://localhost:5672".to_string(),
            connection_timeout_seconds: 30,
            shutdown_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Queue the scheduler's control procedures are served on.
    pub scheduler_queue: String,
    pub call_timeout_ms: u64,
    pub server_prefetch: u16,
    pub stream_prefetch: u16,
    pub stream_chunk_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            scheduler_queue: "reporting.scheduler.rpc".to_string(),
            call_timeout_ms: 10_000,
            server_prefetch: 16,
            stream_prefetch: 8,
            stream_chunk_size: 64 * 1024,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub exchange: String,
    pub interval_seconds: u64,
    /// A record older than `interval * stale_factor` counts as stale.
    pub stale_factor: u32,
    pub pinger_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            exchange: "reporting.heartbeat".to_string(),
            interval_seconds: 15,
            stale_factor: 2,
            pinger_timeout_ms: 3_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
    pub fn pinger_timeout(&self) -> Duration {
        Duration::from_millis(self.pinger_timeout_ms)
    }
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.interval_seconds * self.stale_factor as u64) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationQueueConfig {
    pub queue: String,
    pub prefetch: u16,
}

impl Default for GenerationQueueConfig {
    fn default() -> Self {
        Self {
            queue: "reporting.generations".to_string(),
            prefetch: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub timers: Vec<TimerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timers: vec![TimerConfig {
                name: "daily-generation".to_string(),
                interval_seconds: 60,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    pub name: String,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8099".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, falling back to defaults
    /// when no path is given. Missing sections take their defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(Path::new(p)).map_err(|e| {
                    ReporterError::config(format!("failed to read config file {p}: {e}"))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| ReporterError::config(format!("failed to parse {p}: {e}")))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.transport == BrokerTransport::Amqp {
            if self.broker.url.is_empty() {
                return Err(ReporterError::config("broker.url must not be empty"));
            }
            if !self.broker.url.starts_with("amqp://") && !self.broker.url.starts_with("amqps://") {
                return Err(ReporterError::config(
                    "broker.url must start with amqp:// or amqps://",
                ));
            }
        }
        if self.rpc.call_timeout_ms == 0 {
            return Err(ReporterError::config(
                "rpc.call_timeout_ms must be greater than 0",
            ));
        }
        if self.rpc.scheduler_queue.is_empty() {
            return Err(ReporterError::config("rpc.scheduler_queue must not be empty"));
        }
        if self.rpc.stream_chunk_size == 0 {
            return Err(ReporterError::config(
                "rpc.stream_chunk_size must be greater than 0",
            ));
        }
        if self.heartbeat.interval_seconds == 0 {
            return Err(ReporterError::config(
                "heartbeat.interval_seconds must be greater than 0",
            ));
        }
        if self.heartbeat.stale_factor < 2 {
            return Err(ReporterError::config(
                "heartbeat.stale_factor must be at least 2",
            ));
        }
        if self.heartbeat.exchange.is_empty() {
            return Err(ReporterError::config("heartbeat.exchange must not be empty"));
        }
        if self.generation_queue.queue.is_empty() {
            return Err(ReporterError::config(
                "generation_queue.queue must not be empty",
            ));
        }
        if self.generation_queue.prefetch == 0 {
            return Err(ReporterError::config(
                "generation_queue.prefetch must be greater than 0",
            ));
        }
        for timer in &self.scheduler.timers {
            if timer.name.is_empty() {
                return Err(ReporterError::config("scheduler timer name must not be empty"));
            }
            if timer.interval_seconds == 0 {
                return Err(ReporterError::config(format!(
                    "scheduler timer '{}' interval must be greater than 0",
                    timer.name
                )));
            }
        }
        Ok(())
    }
}
