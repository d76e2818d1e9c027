use std::net::SocketAddr;
use std::time::Duration;

use courier_dispatch::DispatchSettings;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        let level = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&level.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.bus.consumers == 0 {
            return Err("bus.consumers must be > 0".into());
        }
        if self.bus.topic.is_empty() {
            return Err("bus.topic must not be empty".into());
        }
        if matches!(self.storage.backend, StorageBackend::Postgres) {
            match &self.storage.postgres {
                None => {
                    return Err("storage.postgres config is required when backend is 'postgres'".into());
                }
                Some(pg) if pg.url.is_empty() => {
                    return Err("storage.postgres.url must not be empty".into());
                }
                Some(pg) if pg.pool_size == 0 => {
                    return Err("storage.postgres.pool_size must be > 0".into());
                }
                Some(_) => {}
            }
        }
        if self.dispatch.scheduler_tick_secs == 0 {
            return Err("dispatch.scheduler_tick_secs must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    16 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process storage; records do not survive a restart.
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: Option<PostgresSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSettings {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_pool_size() -> u32 {
    10
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Number of consumer workers sharing the group.
    #[serde(default = "default_consumers")]
    pub consumers: usize,
}

fn default_topic() -> String {
    "notifications".into()
}
fn default_consumer_group() -> String {
    "courier-engine".into()
}
fn default_consumers() -> usize {
    2
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            consumer_group: default_consumer_group(),
            consumers: default_consumers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    /// Recipients per bus message when fanning out a batch ingress call.
    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,
}

fn default_max_retries() -> i32 {
    3
}
fn default_retry_base_ms() -> u64 {
    5_000
}
fn default_retry_cap_ms() -> u64 {
    60_000
}
fn default_scheduler_tick_secs() -> u64 {
    30
}
fn default_shutdown_deadline_secs() -> u64 {
    30
}
fn default_batch_chunk_size() -> usize {
    100
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            batch_chunk_size: default_batch_chunk_size(),
        }
    }
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_retries: self.max_retries,
            retry_base: Duration::from_millis(self.retry_base_ms),
            retry_cap: Duration::from_millis(self.retry_cap_ms),
            scheduler_tick: Duration::from_secs(self.scheduler_tick_secs),
            shutdown_deadline: Duration::from_secs(self.shutdown_deadline_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File, FileFormat};
    use std::path::PathBuf;

    /// Loads `courier.toml` (or an explicit path) with `COURIER__`-prefixed
    /// environment overrides, e.g. `COURIER__SERVER__PORT=9090`.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("courier.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Parses a TOML document directly; used by tests.
    pub fn load_config_from_str(toml: &str) -> Result<AppConfig, String> {
        let cfg = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
