use std::{fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use gap_engine::StoreConfig;
use processor::{device_rpc::DeviceRpcConfig, runner::RunnerConfig, TimerConfig, MAX_TIMER_SECS};
use serde::{Deserialize, Serialize};

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "GAP_BACKFILL_";

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8900".to_string()
}

fn default_database_url() -> String {
    StoreConfig::default().database_url
}

fn default_max_connections() -> u32 {
    StoreConfig::default().max_connections
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// JSON log lines; defaults to on everywhere except the local env.
    #[serde(default)]
    pub structured_logging: Option<bool>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub device_rpc: DeviceRpcConfig,
    #[serde(default)]
    pub runners: RunnerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            instance_id: None,
            listen_addr: default_listen_addr(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            structured_logging: None,
            telemetry: Default::default(),
            timers: Default::default(),
            device_rpc: Default::default(),
            runners: Default::default(),
            transport: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Reads the YAML file at `path`, then applies `GAP_BACKFILL_*`
    /// environment overrides, e.g. `GAP_BACKFILL_TIMERS__BACKFILL_TIMEOUT_SECS`.
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::extract(
            Figment::new()
                .merge(Yaml::string(&config_str))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Result<ServerConfig> {
        Self::extract(Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    #[cfg(test)]
    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        Self::extract(Figment::new().merge(Yaml::string(config_str)))
    }

    fn extract(figment: Figment) -> Result<ServerConfig> {
        let mut config: ServerConfig = figment.extract()?;
        config.validate()?;
        let env = config.env.clone();
        config
            .instance_id
            .get_or_insert_with(|| generate_instance_id(&env));
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.database_url.trim().is_empty() {
            return Err(anyhow!("database_url must not be empty"));
        }
        if self.device_rpc.endpoint.trim().is_empty() {
            return Err(anyhow!("device_rpc.endpoint must not be empty"));
        }
        if self.runners.batch_size == 0 {
            return Err(anyhow!("runners.batch_size must be positive"));
        }
        if self.transport.queue_redelivery_secs > MAX_TIMER_SECS {
            return Err(anyhow!(
                "transport.queue_redelivery_secs must be at most {MAX_TIMER_SECS}"
            ));
        }
        self.timers.validate()
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging.unwrap_or(self.env != LOCAL_ENV)
    }

    /// Fixed once the config is loaded; only a hand-built config without an
    /// id gets a fresh one per call.
    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| generate_instance_id(&self.env))
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.max_connections,
        }
    }
}

fn generate_instance_id(env: &str) -> String {
    format!("{}-{}", env, nanoid::nanoid!(8))
}

fn default_metrics_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Falls back to OTEL_EXPORTER_OTLP_ENDPOINT, then localhost:4317.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

fn default_queue_redelivery_secs() -> u64 {
    30
}

fn default_max_dequeue_count() -> u32 {
    processor::queue::DEFAULT_MAX_DEQUEUE_COUNT
}

fn default_stream_capacity() -> usize {
    1024
}

/// Settings of the in-process queues and streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Visibility timeout of a queue message handed back after a failed
    /// invocation.
    #[serde(default = "default_queue_redelivery_secs")]
    pub queue_redelivery_secs: u64,
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_redelivery_secs: default_queue_redelivery_secs(),
            max_dequeue_count: default_max_dequeue_count(),
            stream_capacity: default_stream_capacity(),
        }
    }
}

impl TransportConfig {
    pub fn queue_redelivery(&self) -> Duration {
        Duration::from_secs(self.queue_redelivery_secs)
    }
}
