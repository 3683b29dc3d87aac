use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Upper bound for a single relay status request.
const MAX_RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level configuration for the relaystats service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listen address for the status page and metrics. Default: ":20000".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path of the snapshot database. Default: "/opt/relaystats/relaystats.db".
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How often a polling cycle runs. Default: 5s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Relay directory configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Relay status request configuration.
    #[serde(default)]
    pub relay: RelayConfig,

    /// InfluxDB export configuration.
    #[serde(default)]
    pub influx: InfluxConfig,
}

/// Relay directory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory endpoint returning `{"relays": [{"url": ...}]}`.
    #[serde(default = "default_discovery_endpoint")]
    pub endpoint: String,

    /// How long a fetched relay list stays fresh. Default: 60s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Directory request timeout. Default: 10s.
    #[serde(default = "default_discovery_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Relay status request configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Per-relay request timeout. Default: 3s.
    #[serde(default = "default_relay_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// InfluxDB export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    /// Enable the InfluxDB exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// InfluxDB base URL. Default: "http://localhost:8086".
    #[serde(default = "default_influx_address")]
    pub address: String,

    /// Target database. Default: "syncthingrelay".
    #[serde(default = "default_influx_database")]
    pub database: String,

    /// InfluxDB username.
    #[serde(default)]
    pub username: String,

    /// InfluxDB password.
    #[serde(default)]
    pub password: String,

    /// Body compression (none, gzip). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum cycles queued for export (dropped if full). Default: 64.
    #[serde(default = "default_influx_max_queue_size")]
    pub max_queue_size: usize,

    /// Write request timeout. Default: 10s.
    #[serde(default = "default_influx_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

// --- Default value functions ---

fn default_listen_addr() -> String {
    ":20000".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/opt/relaystats/relaystats.db")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_discovery_endpoint() -> String {
    "https://relays.syncthing.net/endpoint".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_relay_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_influx_address() -> String {
    "http://localhost:8086".to_string()
}

fn default_influx_database() -> String {
    "syncthingrelay".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_influx_max_queue_size() -> usize {
    64
}

fn default_influx_timeout() -> Duration {
    Duration::from_secs(10)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_path: default_database_path(),
            poll_interval: default_poll_interval(),
            discovery: DiscoveryConfig::default(),
            relay: RelayConfig::default(),
            influx: InfluxConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_discovery_endpoint(),
            refresh_interval: default_refresh_interval(),
            timeout: default_discovery_timeout(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout: default_relay_timeout(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_influx_address(),
            database: default_influx_database(),
            username: String::new(),
            password: String::new(),
            compression: default_compression(),
            max_queue_size: default_influx_max_queue_size(),
            timeout: default_influx_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from a YAML document.
    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty map.
        let cfg: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(data)?
        };

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            bail!("listen_addr is required");
        }

        if self.database_path.as_os_str().is_empty() {
            bail!("database_path is required");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }

        if self.discovery.endpoint.is_empty() {
            bail!("discovery.endpoint is required");
        }

        if self.discovery.refresh_interval.is_zero() {
            bail!("discovery.refresh_interval must be positive");
        }

        if self.discovery.timeout.is_zero() {
            bail!("discovery.timeout must be positive");
        }

        if self.relay.timeout.is_zero() || self.relay.timeout > MAX_RELAY_TIMEOUT {
            bail!(
                "relay.timeout must be within (0, {}s]",
                MAX_RELAY_TIMEOUT.as_secs()
            );
        }

        if self.influx.enabled {
            if self.influx.address.is_empty() {
                bail!("influx.address is required when influx is enabled");
            }

            if self.influx.database.is_empty() {
                bail!("influx.database is required when influx is enabled");
            }

            match self.influx.compression.as_str() {
                "none" | "gzip" => {}
                other => bail!("influx.compression {other:?} is not supported (none, gzip)"),
            }

            if self.influx.max_queue_size == 0 {
                bail!("influx.max_queue_size must be positive");
            }

            if self.influx.timeout.is_zero() {
                bail!("influx.timeout must be positive");
            }
        }

        Ok(())
    }

    /// Resolve the listen address, expanding ":port" shorthand to all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }
}
