//! Service node model

use crate::config::RegisterNode;
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Wire protocol a node serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
}

impl Protocol {
    /// Parse the `protocol` metadata value of a registry entry.
    ///
    /// Unknown or missing values are treated as HTTP.
    pub fn from_meta(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("grpc") => Protocol::Grpc,
            _ => Protocol::Http,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lazily created outbound client shared by every snapshot of a node.
#[derive(Debug, Clone, Default)]
struct ConnectionSlot(Arc<Mutex<Option<reqwest::Client>>>);

/// One known instance of a named service.
///
/// The fail counter, enabled flag and connection handle are runtime state:
/// they are never serialized and only the discovery table mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Namespace (Consul enterprise namespace or a logical grouping)
    #[serde(default)]
    pub namespace: String,

    /// Instance ID (unique per instance)
    pub id: String,

    /// Service name
    pub name: String,

    /// Host/IP address
    pub addr: String,

    /// Port number
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default = "default_weight")]
    pub weight: i32,

    /// Current connection count, as advertised by the instance
    #[serde(default)]
    pub cur_conns: u32,

    /// Health check interval
    #[serde(default, with = "serde_secs")]
    pub interval: Duration,

    /// Health check timeout
    #[serde(default, with = "serde_secs")]
    pub timeout: Duration,

    /// Health check URL or gRPC target
    #[serde(default)]
    pub health_url: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Caller-reported failures tolerated before the node is disabled
    #[serde(default)]
    pub fail_limit: u32,

    #[serde(skip)]
    fail_count: u32,

    #[serde(skip)]
    enabled: bool,

    #[serde(skip)]
    connection: ConnectionSlot,
}

fn default_weight() -> i32 {
    1
}

impl ServiceNode {
    /// Create a new enabled node
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
            cur_conns: 0,
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            health_url: String::new(),
            tags: Vec::new(),
            fail_limit: 0,
            fail_count: 0,
            enabled: true,
            connection: ConnectionSlot::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_fail_limit(mut self, fail_limit: u32) -> Self {
        self.fail_limit = fail_limit;
        self
    }

    /// Set health check URL
    pub fn with_health_check(mut self, url: impl Into<String>) -> Self {
        self.health_url = url.into();
        self
    }

    /// Full service URL, e.g. `grpc://10.0.0.5:5001`
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.addr, self.port)
    }

    /// `host:port` pair
    pub fn address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    /// Caller-side failure signal. Returns whether the node is still enabled.
    pub(crate) fn record_failure(&mut self) -> bool {
        self.fail_count = self.fail_count.saturating_add(1);
        if self.fail_count > self.fail_limit {
            self.enabled = false;
        }
        self.enabled
    }

    /// Backend reported the node healthy.
    pub(crate) fn observe_passing(&mut self) {
        self.fail_count = 0;
        self.enabled = true;
    }

    /// Copy the backend-owned fields of `latest`, keeping identity and connection.
    pub(crate) fn refresh_from(&mut self, latest: &ServiceNode) {
        self.addr.clone_from(&latest.addr);
        self.port = latest.port;
        self.protocol = latest.protocol;
        self.namespace.clone_from(&latest.namespace);
        self.tags.clone_from(&latest.tags);
        self.weight = latest.weight;
    }

    /// Outbound client for this node, created on first use and reused afterwards.
    ///
    /// gRPC nodes get an HTTP/2 prior-knowledge client.
    pub fn connection(&self) -> Result<reqwest::Client> {
        let mut slot = self.connection.0.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder();
        if !self.timeout.is_zero() {
            builder = builder.connect_timeout(self.timeout);
        }
        if self.protocol == Protocol::Grpc {
            builder = builder.http2_prior_knowledge();
        }

        let client = builder.build()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    pub fn has_connection(&self) -> bool {
        self.connection.0.lock().is_some()
    }

    /// Release the connection handle. Called when the node leaves the table.
    pub(crate) fn close(&mut self) {
        self.enabled = false;
        self.connection.0.lock().take();
    }
}

impl From<&RegisterNode> for ServiceNode {
    fn from(reg: &RegisterNode) -> Self {
        ServiceNode {
            namespace: reg.namespace.clone(),
            protocol: reg.protocol,
            weight: reg.weight,
            interval: reg.interval,
            timeout: reg.timeout,
            health_url: reg.health_check.clone(),
            tags: reg.tags.clone(),
            fail_limit: reg.fail_limit,
            ..ServiceNode::new(&reg.id, &reg.name, &reg.addr, reg.port)
        }
    }
}

/// Durations as whole seconds.
pub(crate) mod serde_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
