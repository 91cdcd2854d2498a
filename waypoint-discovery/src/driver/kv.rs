//! Key-value driver (etcd)
//!
//! Registration publishes the serialized node under `{name}/{lease}` with a
//! lease whose TTL is the node timeout, and renews it every node interval.
//! A lost lease is re-granted and the record re-published.
//!
//! Watching seeds the table with a prefix read, then follows put/delete
//! events from the next revision. Delete events only carry the key, so each
//! watch task keeps its own key to node-id index. A broken stream triggers a
//! fresh read and a new watch.

use super::{DriverOptions, Shutdown, TaskSet};
use crate::backend::etcd::EtcdBackend;
use crate::backend::{KeyValue, KvBackend, KvEvent};
use crate::client::ServiceDiscovery;
use crate::config::{DiscoveryNode, RdConfig, RegisterNode};
use crate::error::{DiscoveryError, Result};
use crate::node::ServiceNode;
use crate::scheduling::Algorithm;
use crate::table::DiscoveryTable;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

/// Key prefix holding every instance of `name`.
pub fn service_prefix(name: &str) -> String {
    format!("{}/", name)
}

/// Key of one published instance.
pub fn instance_key(name: &str, lease: i64) -> String {
    format!("{}/{}", name, lease)
}

/// A record this process currently has in the store.
#[derive(Debug, Clone)]
struct Publication {
    key: String,
    lease: i64,
}

/// Discovery driver for a lease-based key-value store
pub struct KvDriver {
    shared: Arc<Shared>,
}

struct Shared {
    backend: Arc<dyn KvBackend>,
    table: DiscoveryTable,
    /// node id to its live record
    published: Mutex<HashMap<String, Publication>>,
    /// node ids with a running renewal task
    registering: Mutex<HashSet<String>>,
    watched: Mutex<HashSet<String>>,
    renewals: TaskSet,
    watches: TaskSet,
    options: DriverOptions,
    span: Span,
}

impl KvDriver {
    pub fn new(backend: Arc<dyn KvBackend>, options: DriverOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                table: DiscoveryTable::new(),
                published: Mutex::new(HashMap::new()),
                registering: Mutex::new(HashSet::new()),
                watched: Mutex::new(HashSet::new()),
                renewals: TaskSet::new(),
                watches: TaskSet::new(),
                options,
                span: info_span!("rd", driver = "etcd"),
            }),
        }
    }

    /// Driver talking to every configured etcd endpoint, with failover
    pub fn etcd(config: &RdConfig) -> Result<Self> {
        let endpoints = config
            .endpoint_urls()?
            .into_iter()
            .map(|url| url.to_string())
            .collect();
        let backend = EtcdBackend::new(endpoints, config.timeout)?;
        Ok(Self::new(
            Arc::new(backend),
            DriverOptions::from_config(config),
        ))
    }

    pub fn table(&self) -> &DiscoveryTable {
        &self.shared.table
    }

    /// Key and lease currently published for node `id`
    pub fn publication(&self, id: &str) -> Option<(String, i64)> {
        self.shared
            .published
            .lock()
            .get(id)
            .map(|p| (p.key.clone(), p.lease))
    }
}

impl Drop for KvDriver {
    fn drop(&mut self) {
        self.shared.renewals.cancel();
        self.shared.watches.cancel();
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Lease TTL in seconds: the node timeout, at least one second.
pub fn lease_ttl(node: &RegisterNode) -> i64 {
    node.timeout.as_secs().max(1) as i64
}

/// Renewal period: the node interval, capped at a third of the TTL so a
/// lease never lapses between two renewals.
pub fn renew_period(node: &RegisterNode) -> Duration {
    let cap = Duration::from_secs(lease_ttl(node) as u64) / 3;
    if node.interval.is_zero() {
        cap
    } else {
        node.interval.min(cap)
    }
}

/// Grant a lease and write the record under it.
async fn publish(shared: &Shared, node: &RegisterNode, record: &[u8], ttl: i64) -> Result<i64> {
    let lease = shared.backend.lease_grant(ttl).await?;
    let key = instance_key(&node.name, lease);
    shared.backend.put(&key, record, lease).await?;

    info!(key = %key, lease, ttl, "Published node");
    shared
        .published
        .lock()
        .insert(node.id.clone(), Publication { key, lease });
    Ok(lease)
}

async fn keep_registered(
    shared: Arc<Shared>,
    node: RegisterNode,
    record: Vec<u8>,
    mut shutdown: Shutdown,
) {
    let ttl = lease_ttl(&node);
    let renew_every = renew_period(&node);
    let mut lease = None;

    loop {
        match lease {
            None => {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = publish(&shared, &node, &record, ttl) => result,
                };
                match result {
                    Ok(granted) => lease = Some(granted),
                    Err(e) => {
                        warn!(error = %e, "Publishing node failed");
                        if !shutdown.sleep(shared.options.retry_backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            Some(id) => {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = shared.backend.lease_keep_alive(id) => result,
                };
                match result {
                    Ok(()) => trace!(lease = id, "Lease renewed"),
                    Err(DiscoveryError::LeaseNotFound(_)) => {
                        warn!(lease = id, "Lease lost, re-publishing");
                        lease = None;
                        continue;
                    }
                    Err(e) => {
                        warn!(lease = id, error = %e, "Lease renewal failed");
                        if !shutdown.sleep(shared.options.retry_backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }
        }

        if !shutdown.sleep(renew_every).await {
            break;
        }
    }

    debug!("Stopped renewing");
}

// ============================================================================
// Watching
// ============================================================================

/// Per-task view of which key holds which node.
struct KeyIndex {
    name: String,
    algorithm: Algorithm,
    tag: String,
    fail_limit: u32,
    keys: HashMap<String, String>,
}

impl KeyIndex {
    fn new(spec: &DiscoveryNode) -> Self {
        Self {
            name: spec.name.clone(),
            algorithm: spec.algorithm(),
            tag: spec.tag.clone(),
            fail_limit: spec.fail_limit,
            keys: HashMap::new(),
        }
    }

    /// Apply a put. Returns the node id when the record was accepted.
    fn put(&mut self, table: &DiscoveryTable, kv: KeyValue) -> Option<String> {
        let mut node: ServiceNode = match serde_json::from_slice(&kv.value) {
            Ok(node) => node,
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping malformed node record");
                return None;
            }
        };

        if !self.tag.is_empty() && !node.has_tag(&self.tag) {
            debug!(key = %kv.key, tag = %self.tag, "Node lacks watched tag");
            self.delete(table, &kv.key);
            return None;
        }

        node.fail_limit = self.fail_limit;
        let id = node.id.clone();
        table.observe_passing(&self.name, self.algorithm, node);
        self.keys.insert(kv.key, id.clone());
        Some(id)
    }

    /// Apply a delete. The node only leaves the table once no other key holds it.
    fn delete(&mut self, table: &DiscoveryTable, key: &str) {
        let Some(id) = self.keys.remove(key) else {
            debug!(key, "Delete for untracked key");
            return;
        };
        if self.keys.values().any(|other| *other == id) {
            debug!(key, id = %id, "Node still published under another key");
            return;
        }
        table.observe_removed(&self.name, &id);
    }

    fn apply(&mut self, table: &DiscoveryTable, event: KvEvent) {
        match event {
            KvEvent::Put(kv) => {
                self.put(table, kv);
            }
            KvEvent::Delete { key } => self.delete(table, &key),
        }
    }

    /// Replace everything with a fresh read.
    fn reseed(&mut self, table: &DiscoveryTable, kvs: Vec<KeyValue>) {
        self.keys.clear();
        let live: HashSet<String> = kvs.into_iter().filter_map(|kv| self.put(table, kv)).collect();
        let evicted = table.retain_ids(&self.name, &live);
        debug!(nodes = live.len(), evicted, "Seeded from range read");
    }
}

async fn watch_service(shared: Arc<Shared>, spec: DiscoveryNode, mut shutdown: Shutdown) {
    let prefix = service_prefix(&spec.name);
    let mut index = KeyIndex::new(&spec);
    let backoff = shared.options.retry_backoff;

    info!(prefix = %prefix, "Watching service");

    'resync: loop {
        let range = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = shared.backend.range(&prefix) => result,
        };
        let range = match range {
            Ok(range) => range,
            Err(e) => {
                warn!(error = %e, "Range read failed");
                if !shutdown.sleep(backoff).await {
                    break;
                }
                continue;
            }
        };

        index.reseed(&shared.table, range.kvs);

        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = shared.backend.watch(&prefix, range.revision + 1) => result,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Opening watch failed");
                if !shutdown.sleep(backoff).await {
                    break;
                }
                continue;
            }
        };

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break 'resync,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(events)) => {
                    for event in events {
                        index.apply(&shared.table, event);
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Watch stream failed, resyncing");
                    break;
                }
                None => {
                    warn!("Watch stream closed, resyncing");
                    break;
                }
            }
        }

        if !shutdown.sleep(backoff).await {
            break;
        }
    }

    info!("Stopped watching service");
}

#[async_trait]
impl ServiceDiscovery for KvDriver {
    async fn register(&self, node: &RegisterNode) -> Result<()> {
        let span = info_span!(parent: &self.shared.span, "register", id = %node.id);

        let record = serde_json::to_vec(&ServiceNode::from(node)).map_err(|e| {
            span.in_scope(|| error!(error = %e, "Encoding node failed"));
            DiscoveryError::RegistrationFailed(e.to_string())
        })?;

        if !self.shared.registering.lock().insert(node.id.clone()) {
            span.in_scope(|| debug!("Already registered"));
            return Ok(());
        }

        let shutdown = self.shared.renewals.signal();
        self.shared.renewals.spawn(
            keep_registered(self.shared.clone(), node.clone(), record, shutdown).instrument(span),
        );
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        // Stop renewal first so nothing re-publishes behind us.
        self.shared.renewals.stop().await;
        self.shared.registering.lock().clear();

        let published: Vec<(String, Publication)> =
            self.shared.published.lock().drain().collect();
        let mut failed = Vec::new();

        for (id, publication) in published {
            let span = info_span!(parent: &self.shared.span, "deregister", id = %id);
            let result = async {
                self.shared.backend.delete(&publication.key).await?;
                self.shared.backend.lease_revoke(publication.lease).await
            }
            .instrument(span.clone())
            .await;

            match result {
                Ok(()) => span.in_scope(|| info!(key = %publication.key, "Deregistered")),
                Err(e) => {
                    span.in_scope(|| error!(error = %e, "Deregistration failed"));
                    failed.push((id, publication));
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        let message = failed
            .iter()
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        self.shared.published.lock().extend(failed);
        Err(DiscoveryError::DeregistrationFailed(message))
    }

    async fn watch(&self, spec: &DiscoveryNode) -> Result<()> {
        if !self.shared.watched.lock().insert(spec.name.clone()) {
            debug!(service = %spec.name, "Already watching");
            return Ok(());
        }

        self.shared.table.bind_scheduler(&spec.name, spec.algorithm());

        let span = info_span!(parent: &self.shared.span, "watch", service = %spec.name);
        let shutdown = self.shared.watches.signal();
        self.shared.watches.spawn(
            watch_service(self.shared.clone(), spec.clone(), shutdown).instrument(span),
        );
        Ok(())
    }

    fn get_service(&self, name: &str, client_addr: &str) -> Result<ServiceNode> {
        self.shared.table.select(name, client_addr)
    }

    fn report_failure(&self, node: &ServiceNode) -> Option<bool> {
        self.shared.table.report_failure(&node.name, &node.id)
    }

    fn nodes(&self, name: &str) -> Vec<ServiceNode> {
        self.shared.table.nodes(name)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shared.watches.stop().await;
        self.shared.watched.lock().clear();
        let result = self.deregister().await;
        self.shared.table.clear();
        self.shared.span.in_scope(|| info!("Driver shut down"));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryKv;

    fn options() -> DriverOptions {
        DriverOptions {
            retry_backoff: Duration::from_millis(10),
            query_wait: Duration::from_millis(200),
        }
    }

    fn register_node(id: &str) -> RegisterNode {
        RegisterNode::new(id, "api", "10.0.0.5", 5001)
            .with_interval(Duration::from_millis(20))
            .with_timeout(Duration::from_secs(5))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_keys() {
        assert_eq!(service_prefix("api"), "api/");
        assert_eq!(instance_key("api", 42), "api/42");
        assert!(!instance_key("api-gateway", 1).starts_with(&service_prefix("api")));
    }

    #[test]
    fn test_renew_period_stays_under_ttl() {
        let defaults = RegisterNode::new("n1", "api", "10.0.0.1", 80);
        assert_eq!(lease_ttl(&defaults), 5);
        assert!(renew_period(&defaults) < Duration::from_secs(2));

        let fast = register_node("n1");
        assert_eq!(renew_period(&fast), Duration::from_millis(20));

        let zero = RegisterNode::new("n1", "api", "10.0.0.1", 80).with_timeout(Duration::ZERO);
        assert_eq!(lease_ttl(&zero), 1);
    }

    #[test]
    fn test_key_index_delete_needs_every_key_gone() {
        let table = DiscoveryTable::new();
        let mut index = KeyIndex::new(&DiscoveryNode::new("api"));
        let record = serde_json::to_vec(&ServiceNode::new("n1", "api", "10.0.0.1", 80)).unwrap();

        for key in ["api/1", "api/2"] {
            index.put(
                &table,
                KeyValue {
                    key: key.into(),
                    value: record.clone(),
                    lease: 0,
                },
            );
        }
        assert_eq!(table.nodes("api").len(), 1);

        index.delete(&table, "api/1");
        assert_eq!(table.nodes("api").len(), 1);
        index.delete(&table, "api/2");
        assert!(table.nodes("api").is_empty());
    }

    #[test]
    fn test_key_index_skips_malformed_and_untagged() {
        let table = DiscoveryTable::new();
        let mut index = KeyIndex::new(&DiscoveryNode::new("api").with_tag("v2"));

        let junk = KeyValue {
            key: "api/1".into(),
            value: b"not json".to_vec(),
            lease: 0,
        };
        assert!(index.put(&table, junk).is_none());

        let untagged = KeyValue {
            key: "api/2".into(),
            value: serde_json::to_vec(&ServiceNode::new("n2", "api", "10.0.0.2", 80)).unwrap(),
            lease: 0,
        };
        assert!(index.put(&table, untagged).is_none());

        let tagged = KeyValue {
            key: "api/3".into(),
            value: serde_json::to_vec(&ServiceNode::new("n3", "api", "10.0.0.3", 80).with_tag("v2"))
                .unwrap(),
            lease: 0,
        };
        assert_eq!(index.put(&table, tagged), Some("n3".to_string()));
        assert_eq!(table.nodes("api").len(), 1);
    }

    #[tokio::test]
    async fn test_register_publishes_and_watch_discovers() {
        let kv = InMemoryKv::new();
        let driver = KvDriver::new(Arc::new(kv.clone()), options());

        driver.register(&register_node("api-1")).await.unwrap();
        driver.watch(&DiscoveryNode::new("api")).await.unwrap();

        eventually(|| driver.get_service("api", "").is_ok()).await;
        let node = driver.get_service("api", "").unwrap();
        assert_eq!(node.id, "api-1");
        assert_eq!(node.url(), "http://10.0.0.5:5001");

        let (key, lease) = driver.publication("api-1").unwrap();
        assert_eq!(key, instance_key("api", lease));
        assert!(kv.get(&key).is_some());

        driver.shutdown().await.unwrap();
        assert!(kv.keys("api/").is_empty());
        assert_eq!(kv.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_lease_is_regranted() {
        let kv = InMemoryKv::new();
        let driver = KvDriver::new(Arc::new(kv.clone()), options());
        driver.register(&register_node("api-1")).await.unwrap();

        eventually(|| driver.publication("api-1").is_some()).await;
        let (old_key, old_lease) = driver.publication("api-1").unwrap();
        assert!(kv.expire_lease(old_lease));
        assert!(kv.get(&old_key).is_none());

        eventually(|| matches!(driver.publication("api-1"), Some((_, lease)) if lease != old_lease))
            .await;
        let (new_key, _) = driver.publication("api-1").unwrap();
        assert!(kv.get(&new_key).is_some());
        assert_eq!(kv.grant_count(), 2);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_retries_through_write_errors() {
        let kv = InMemoryKv::new();
        kv.fail_next_writes(3);

        let driver = KvDriver::new(Arc::new(kv.clone()), options());
        driver.register(&register_node("api-1")).await.unwrap();

        eventually(|| driver.publication("api-1").is_some()).await;
        let (key, lease) = driver.publication("api-1").unwrap();
        assert!(kv.get(&key).is_some());
        assert_eq!(kv.grant_count(), 1);

        // Failed renewals back off and keep the same lease.
        kv.fail_next_writes(2);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(driver.publication("api-1"), Some((key.clone(), lease)));
        assert!(kv.get(&key).is_some());
        assert_eq!(kv.grant_count(), 1);

        // The renewal task is still running and reacts to a lost lease.
        assert!(kv.expire_lease(lease));
        eventually(|| matches!(driver.publication("api-1"), Some((_, l)) if l != lease)).await;
        assert_eq!(kv.grant_count(), 2);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_event_removes_node() {
        let kv = InMemoryKv::new();
        let record = serde_json::to_vec(&ServiceNode::new("n1", "api", "10.0.0.1", 80)).unwrap();
        kv.put_raw("api/1", &record);

        let driver = KvDriver::new(Arc::new(kv.clone()), options());
        driver.watch(&DiscoveryNode::new("api")).await.unwrap();
        eventually(|| driver.nodes("api").len() == 1).await;

        kv.delete("api/1").await.unwrap();
        eventually(|| driver.nodes("api").is_empty()).await;

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_resyncs_after_stream_error() {
        let kv = InMemoryKv::new();
        kv.fail_next_reads(2);

        let driver = KvDriver::new(Arc::new(kv.clone()), options());
        driver.watch(&DiscoveryNode::new("api")).await.unwrap();

        let record = serde_json::to_vec(&ServiceNode::new("n1", "api", "10.0.0.1", 80)).unwrap();
        kv.put_raw("api/1", &record);
        eventually(|| driver.nodes("api").len() == 1).await;

        kv.interrupt_watches();
        let record = serde_json::to_vec(&ServiceNode::new("n2", "api", "10.0.0.2", 80)).unwrap();
        kv.put_raw("api/2", &record);
        eventually(|| driver.nodes("api").len() == 2).await;

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deregister_stops_renewal() {
        let kv = InMemoryKv::new();
        let driver = KvDriver::new(Arc::new(kv.clone()), options());
        driver.register(&register_node("api-1")).await.unwrap();
        eventually(|| driver.publication("api-1").is_some()).await;

        driver.deregister().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(kv.keys("api/").is_empty());
        assert_eq!(kv.grant_count(), 1);
        assert!(driver.publication("api-1").is_none());
    }
}
