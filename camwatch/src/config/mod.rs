//! Application configuration.
//!
//! Everything comes from one TOML file. Every key has a default, so an
//! empty or missing file is a valid (if idle) configuration.

pub mod file;
pub mod watcher;

pub use file::{load_config, parse_config};
pub use watcher::ConfigWatcher;

use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::database::HeartbeatWriterConfig;
use crate::logging::LogSettings;
use crate::registry::StreamEntry;
use crate::scheduler::SchedulerConfig;

const DEFAULT_DATABASE_URL: &str = "sqlite:camwatch.db?mode=rwc";
const DEFAULT_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_HYDRATE_RECORDS: u32 = 1000;
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_WATCH_INTERVAL_SECS: u64 = 3;

/// Root of the configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// IANA timezone used when rendering timestamps.
    pub timezone: Option<String>,
    pub engine: SchedulerConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub logging: LogSettings,
    pub watch: WatchConfig,
    pub streams: Vec<StreamEntry>,
}

impl AppConfig {
    /// Configured display timezone, UTC when unset.
    pub fn timezone(&self) -> crate::Result<Tz> {
        match self.timezone.as_deref().map(str::trim) {
            None | Some("") => Ok(Tz::UTC),
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| crate::Error::config(format!("unknown timezone '{name}'"))),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Records per stream read back at startup to seed uptime.
    pub hydrate_records: u32,
    #[serde(flatten)]
    pub writer: HeartbeatWriterConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            hydrate_records: DEFAULT_HYDRATE_RECORDS,
            writer: HeartbeatWriterConfig::default(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub listen: String,
    /// Allow any origin. Off unless a browser dashboard needs it.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: DEFAULT_LISTEN.to_string(),
            cors: false,
        }
    }
}

/// `[watch]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: DEFAULT_WATCH_INTERVAL_SECS,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
