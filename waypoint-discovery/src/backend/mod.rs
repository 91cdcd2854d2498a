//! Coordination backend boundary
//!
//! Two backend families sit behind two traits:
//!
//! - [`RegistryBackend`]: a health-check registry (Consul) offering service
//!   registration and blocking health queries that return a full membership
//!   snapshot plus a resume index.
//! - [`KvBackend`]: a key-value store (etcd) offering leases, prefix reads
//!   and a push-based watch stream of put/delete events.
//!
//! HTTP clients for both live in [`consul`] and [`etcd`]; [`memory`] holds
//! in-process implementations for development and tests.

pub mod consul;
pub mod etcd;
pub mod memory;

use crate::config::RegisterNode;
use crate::error::Result;
use crate::node::{Protocol, ServiceNode};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// Registry-style boundary
// ============================================================================

/// Aggregated health of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

impl HealthStatus {
    /// Parse a check status. Unknown values count as critical.
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "passing" => HealthStatus::Passing,
            "warning" => HealthStatus::Warning,
            "maintenance" => HealthStatus::Maintenance,
            _ => HealthStatus::Critical,
        }
    }

    /// Worst status among the checks; no checks means passing.
    pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> Self {
        statuses
            .into_iter()
            .max()
            .unwrap_or(HealthStatus::Passing)
    }
}

/// One service instance as reported by a health query.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub id: String,
    pub service: String,
    pub namespace: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub status: HealthStatus,
}

impl ServiceEntry {
    /// Node model for this entry; the protocol comes from the `protocol` meta key.
    pub fn to_node(&self, fail_limit: u32) -> ServiceNode {
        let mut node = ServiceNode::new(&self.id, &self.service, &self.address, self.port)
            .with_namespace(&self.namespace)
            .with_protocol(Protocol::from_meta(
                self.meta.get("protocol").map(String::as_str),
            ))
            .with_fail_limit(fail_limit);
        node.tags.clone_from(&self.tags);
        node
    }
}

/// Active health check attached to a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub protocol: Protocol,
    /// HTTP URL or gRPC target, depending on `protocol`
    pub target: String,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Registration request for a registry backend.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub check: Option<HealthCheck>,
}

impl From<&RegisterNode> for Registration {
    fn from(node: &RegisterNode) -> Self {
        let check = (!node.health_check.is_empty()).then(|| HealthCheck {
            protocol: node.protocol,
            target: node.health_check.clone(),
            interval: node.interval,
            timeout: node.timeout,
        });

        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            namespace: node.namespace.clone(),
            address: node.addr.clone(),
            port: node.port,
            tags: node.tags.clone(),
            meta: HashMap::from([("protocol".to_string(), node.protocol.to_string())]),
            check,
        }
    }
}

/// Blocking health query.
#[derive(Debug, Clone)]
pub struct HealthQuery {
    pub service: String,
    /// Empty for any tag
    pub tag: String,
    /// Empty for the default namespace
    pub namespace: String,
    /// Index to block on; 0 returns immediately
    pub wait_index: u64,
    /// Maximum time the backend may block
    pub wait: Duration,
}

/// Full membership snapshot plus the index to resume from.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub entries: Vec<ServiceEntry>,
    pub last_index: u64,
}

/// Health-check registry client.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Register (or re-register) a service instance
    async fn register(&self, registration: &Registration) -> Result<()>;

    /// Remove a service instance; unknown ids are not an error
    async fn deregister(&self, service_id: &str) -> Result<()>;

    /// Snapshot of all instances of a service, blocking until `wait_index` changes
    async fn health_service(&self, query: &HealthQuery) -> Result<QueryResult>;
}

// ============================================================================
// KV-style boundary
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Attached lease, 0 for none
    pub lease: i64,
}

/// Change notification from a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvEvent {
    Put(KeyValue),
    /// Deletes carry only the key
    Delete { key: String },
}

impl KvEvent {
    pub fn key(&self) -> &str {
        match self {
            KvEvent::Put(kv) => &kv.key,
            KvEvent::Delete { key } => key,
        }
    }
}

/// Prefix read result.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: i64,
}

/// Stream of event batches; an `Err` item means the watch is broken.
pub type WatchStream = BoxStream<'static, Result<Vec<KvEvent>>>;

/// Lease-based key-value store client.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Grant a lease living `ttl_secs` without renewal
    async fn lease_grant(&self, ttl_secs: i64) -> Result<i64>;

    /// Renew once; `DiscoveryError::LeaseNotFound` when the lease is gone
    async fn lease_keep_alive(&self, lease: i64) -> Result<()>;

    /// Revoke a lease and the keys attached to it; unknown leases are not an error
    async fn lease_revoke(&self, lease: i64) -> Result<()>;

    async fn put(&self, key: &str, value: &[u8], lease: i64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn range(&self, prefix: &str) -> Result<RangeResult>;

    /// Watch every key under `prefix`, replaying from `start_revision`
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;
}

/// Exclusive end of the key range covering `prefix`.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: range to the end of the keyspace.
    vec![0]
}
