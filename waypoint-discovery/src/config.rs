//! Discovery client configuration

use crate::error::{DiscoveryError, Result};
use crate::node::{Protocol, serde_secs};
use crate::scheduling::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use waypoint_config::{ConfigManager, ConfigValidator, Validate};

/// Prefix for environment overrides, e.g. `WAYPOINT_DRIVER=etcd`.
pub const ENV_PREFIX: &str = "WAYPOINT";

/// Backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Health-check registry with blocking queries (Consul)
    Consul,
    /// Key-value store with leases and watches (etcd)
    Etcd,
}

impl FromStr for DriverKind {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "consul" | "registry" => Ok(DriverKind::Consul),
            "etcd" | "kv" => Ok(DriverKind::Etcd),
            other => Err(DiscoveryError::UnsupportedDriver(other.to_string())),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdConfig {
    /// When false the client neither registers nor watches.
    #[serde(default = "default_true")]
    pub enable: bool,

    /// `consul` or `etcd`
    pub driver: String,

    /// Backend endpoints (`host:port` or full URLs)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Scheme applied to endpoints without one
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Dial timeout; also the blocking-query wait time
    #[serde(with = "serde_secs", default = "default_timeout")]
    pub timeout: Duration,

    /// Pause after a backend error before a watch or renewal retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Instances of this process to advertise
    #[serde(default)]
    pub registers: Vec<RegisterNode>,

    /// Remote services to resolve
    #[serde(default)]
    pub discoveries: Vec<DiscoveryNode>,
}

/// A locally served instance to register with the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNode {
    #[serde(default)]
    pub namespace: String,
    pub id: String,
    pub name: String,
    pub addr: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_weight")]
    pub weight: i32,
    /// Health check interval; lease renewal period for kv backends
    #[serde(with = "serde_secs", default = "default_interval")]
    pub interval: Duration,
    /// Health check timeout; lease TTL for kv backends
    #[serde(with = "serde_secs", default = "default_register_timeout")]
    pub timeout: Duration,
    /// Health endpoint; an empty value registers without a check
    #[serde(default)]
    pub health_check: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_fail_limit")]
    pub fail_limit: u32,
}

/// A remote service to watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryNode {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Only nodes carrying this tag are discovered (empty = any)
    #[serde(default)]
    pub tag: String,
    /// `robin`, `random`, `weight` or `iphash`
    #[serde(default = "default_algorithm")]
    pub scheduling_algorithm: String,
    /// Caller-reported failures tolerated per node
    #[serde(default = "default_fail_limit")]
    pub fail_limit: u32,
    /// Seconds to pause between successful registry polls
    #[serde(default = "default_retry_time")]
    pub retry_time: u64,
}

fn default_true() -> bool {
    true
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_weight() -> i32 {
    1
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_register_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_fail_limit() -> u32 {
    3
}

fn default_algorithm() -> String {
    "robin".to_string()
}

fn default_retry_time() -> u64 {
    1
}

impl RdConfig {
    /// Create a configuration for the given driver and endpoints.
    pub fn new(driver: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            enable: true,
            driver: driver.into(),
            endpoints,
            scheme: default_scheme(),
            timeout: default_timeout(),
            retry_backoff_ms: default_retry_backoff_ms(),
            registers: Vec::new(),
            discoveries: Vec::new(),
        }
    }

    /// Load from a JSON or TOML file, then apply `WAYPOINT_*` overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut manager = ConfigManager::with_prefix(ENV_PREFIX);
        manager.load_file(path)?;
        manager.load_env()?;
        Ok(manager.load_validated()?)
    }

    pub fn with_register(mut self, node: RegisterNode) -> Self {
        self.registers.push(node);
        self
    }

    pub fn with_discovery(mut self, node: DiscoveryNode) -> Self {
        self.discoveries.push(node);
        self
    }

    pub fn driver_kind(&self) -> Result<DriverKind> {
        self.driver.parse()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Endpoints as base URLs, applying `scheme` where none is given.
    pub fn endpoint_urls(&self) -> Result<Vec<Url>> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let raw = if endpoint.contains("://") {
                    endpoint.clone()
                } else {
                    format!("{}://{}", self.scheme, endpoint)
                };
                Url::parse(&raw).map_err(|e| {
                    DiscoveryError::InvalidConfiguration(format!("endpoint {}: {}", endpoint, e))
                })
            })
            .collect()
    }
}

impl Validate for RdConfig {
    fn validate(&self) -> waypoint_config::Result<()> {
        ConfigValidator::one_of(
            &self.driver.to_ascii_lowercase(),
            &["consul", "registry", "etcd", "kv"],
            "driver",
        )?;
        ConfigValidator::not_empty_list(&self.endpoints, "endpoints")?;
        ConfigValidator::one_of(&self.scheme, &["http", "https"], "scheme")?;

        for reg in &self.registers {
            ConfigValidator::not_empty(&reg.id, "registers.id")?;
            ConfigValidator::not_empty(&reg.name, "registers.name")?;
            ConfigValidator::not_empty(&reg.addr, "registers.addr")?;
            ConfigValidator::is_port(reg.port, "registers.port")?;
        }

        for disc in &self.discoveries {
            ConfigValidator::not_empty(&disc.name, "discoveries.name")?;
        }

        Ok(())
    }
}

impl RegisterNode {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        addr: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            namespace: String::new(),
            id: id.into(),
            name: name.into(),
            addr: addr.into(),
            port,
            protocol: Protocol::Http,
            weight: default_weight(),
            interval: default_interval(),
            timeout: default_register_timeout(),
            health_check: String::new(),
            tags: Vec::new(),
            fail_limit: default_fail_limit(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_health_check(mut self, target: impl Into<String>) -> Self {
        self.health_check = target.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl DiscoveryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            enable: true,
            namespace: String::new(),
            name: name.into(),
            tag: String::new(),
            scheduling_algorithm: default_algorithm(),
            fail_limit: default_fail_limit(),
            retry_time: default_retry_time(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.scheduling_algorithm = algorithm.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_fail_limit(mut self, fail_limit: u32) -> Self {
        self.fail_limit = fail_limit;
        self
    }

    pub fn with_retry_time(mut self, secs: u64) -> Self {
        self.retry_time = secs;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        Algorithm::from_name(&self.scheduling_algorithm)
    }
}
