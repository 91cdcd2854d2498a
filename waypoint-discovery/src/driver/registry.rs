//! Registry driver (Consul)
//!
//! Each watched service gets one task running blocking health queries.
//! Every successful query returns the complete membership, which is
//! reconciled against the table: passing entries are added or refreshed,
//! any other status removes the node, and nodes missing from the snapshot
//! are evicted.

use super::{DriverOptions, Shutdown, TaskSet};
use crate::backend::consul::ConsulBackend;
use crate::backend::{HealthQuery, HealthStatus, Registration, RegistryBackend, ServiceEntry};
use crate::client::ServiceDiscovery;
use crate::config::{DiscoveryNode, RdConfig, RegisterNode};
use crate::error::{DiscoveryError, Result};
use crate::node::ServiceNode;
use crate::scheduling::Algorithm;
use crate::table::DiscoveryTable;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// Next blocking-query index. An index that goes backwards means the
/// backend state was reset, so start over from 0. A missing or zero index
/// counts as 1, otherwise every later query would return immediately.
pub fn next_index(previous: u64, returned: u64) -> u64 {
    let returned = returned.max(1);
    if returned < previous { 0 } else { returned }
}

/// Discovery driver for a health-check registry
pub struct RegistryDriver {
    shared: Arc<Shared>,
}

struct Shared {
    backend: Arc<dyn RegistryBackend>,
    table: DiscoveryTable,
    registered: Mutex<Vec<String>>,
    watched: Mutex<HashSet<String>>,
    tasks: TaskSet,
    options: DriverOptions,
    span: Span,
}

impl RegistryDriver {
    pub fn new(backend: Arc<dyn RegistryBackend>, options: DriverOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                table: DiscoveryTable::new(),
                registered: Mutex::new(Vec::new()),
                watched: Mutex::new(HashSet::new()),
                tasks: TaskSet::new(),
                options,
                span: info_span!("rd", driver = "consul"),
            }),
        }
    }

    /// Driver talking to the first configured Consul endpoint
    pub fn consul(config: &RdConfig) -> Result<Self> {
        let endpoint = config.endpoint_urls()?.into_iter().next().ok_or_else(|| {
            DiscoveryError::InvalidConfiguration("consul requires an endpoint".to_string())
        })?;
        let backend = ConsulBackend::new(endpoint.as_str(), config.timeout)?;
        Ok(Self::new(
            Arc::new(backend),
            DriverOptions::from_config(config),
        ))
    }

    pub fn table(&self) -> &DiscoveryTable {
        &self.shared.table
    }

    /// Ids this driver registered and has not yet deregistered
    pub fn registered(&self) -> Vec<String> {
        self.shared.registered.lock().clone()
    }
}

impl Drop for RegistryDriver {
    fn drop(&mut self) {
        self.shared.tasks.cancel();
    }
}

/// Reconcile one full snapshot into the table.
fn apply_snapshot(
    table: &DiscoveryTable,
    spec: &DiscoveryNode,
    algorithm: Algorithm,
    entries: Vec<ServiceEntry>,
) {
    let mut seen = HashSet::with_capacity(entries.len());

    for entry in entries {
        seen.insert(entry.id.clone());
        if entry.status == HealthStatus::Passing {
            table.observe_passing(&spec.name, algorithm, entry.to_node(spec.fail_limit));
        } else {
            debug!(id = %entry.id, status = ?entry.status, "Node not passing");
            table.observe_removed(&spec.name, &entry.id);
        }
    }

    let evicted = table.retain_ids(&spec.name, &seen);
    if evicted > 0 {
        debug!(evicted, "Evicted nodes absent from snapshot");
    }
}

async fn watch_service(shared: Arc<Shared>, spec: DiscoveryNode, mut shutdown: Shutdown) {
    let algorithm = spec.algorithm();
    let pause = Duration::from_secs(spec.retry_time);
    let mut index = 0;

    info!(algorithm = algorithm.as_str(), "Watching service");

    loop {
        let query = HealthQuery {
            service: spec.name.clone(),
            tag: spec.tag.clone(),
            namespace: spec.namespace.clone(),
            wait_index: index,
            wait: shared.options.query_wait,
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = shared.backend.health_service(&query) => result,
        };

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Health query failed");
                if !shutdown.sleep(shared.options.retry_backoff).await {
                    break;
                }
                continue;
            }
        };

        index = next_index(index, snapshot.last_index);
        apply_snapshot(&shared.table, &spec, algorithm, snapshot.entries);

        if !pause.is_zero() && !shutdown.sleep(pause).await {
            break;
        }
    }

    info!("Stopped watching service");
}

#[async_trait]
impl ServiceDiscovery for RegistryDriver {
    async fn register(&self, node: &RegisterNode) -> Result<()> {
        let registration = Registration::from(node);
        let span = info_span!(parent: &self.shared.span, "register", id = %node.id);

        self.shared
            .backend
            .register(&registration)
            .instrument(span.clone())
            .await
            .inspect_err(|e| {
                span.in_scope(|| error!(error = %e, "Registration failed"));
            })?;

        let mut registered = self.shared.registered.lock();
        if !registered.contains(&node.id) {
            registered.push(node.id.clone());
        }
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        let ids = std::mem::take(&mut *self.shared.registered.lock());
        let mut failed = Vec::new();

        for id in ids {
            let span = info_span!(parent: &self.shared.span, "deregister", id = %id);
            match self.shared.backend.deregister(&id).instrument(span.clone()).await {
                Ok(()) => span.in_scope(|| info!("Deregistered")),
                Err(e) => {
                    span.in_scope(|| error!(error = %e, "Deregistration failed"));
                    failed.push(id);
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        let message = failed.join(", ");
        self.shared.registered.lock().extend(failed);
        Err(DiscoveryError::DeregistrationFailed(message))
    }

    async fn watch(&self, spec: &DiscoveryNode) -> Result<()> {
        if !self.shared.watched.lock().insert(spec.name.clone()) {
            debug!(service = %spec.name, "Already watching");
            return Ok(());
        }

        self.shared.table.bind_scheduler(&spec.name, spec.algorithm());

        let span = info_span!(parent: &self.shared.span, "watch", service = %spec.name);
        let shutdown = self.shared.tasks.signal();
        self.shared.tasks.spawn(
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
        self.shared.tasks.stop().await;
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
    use crate::backend::QueryResult;
    use crate::backend::memory::InMemoryRegistry;
    use std::collections::HashMap;

    fn options() -> DriverOptions {
        DriverOptions {
            retry_backoff: Duration::from_millis(10),
            query_wait: Duration::from_millis(200),
        }
    }

    fn entry(id: &str, status: HealthStatus) -> ServiceEntry {
        ServiceEntry {
            id: id.into(),
            service: "api".into(),
            namespace: String::new(),
            address: "10.0.0.1".into(),
            port: 8080,
            tags: Vec::new(),
            meta: HashMap::new(),
            status,
        }
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
    fn test_next_index() {
        assert_eq!(next_index(0, 5), 5);
        assert_eq!(next_index(5, 5), 5);
        assert_eq!(next_index(5, 9), 9);
        assert_eq!(next_index(9, 3), 0);
        assert_eq!(next_index(0, 0), 1);
        assert_eq!(next_index(1, 0), 1);
    }

    /// Registry that never reports an index and records what it was asked.
    #[derive(Default)]
    struct NoIndex {
        wait_indexes: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl RegistryBackend for NoIndex {
        async fn register(&self, _registration: &Registration) -> Result<()> {
            Ok(())
        }

        async fn deregister(&self, _service_id: &str) -> Result<()> {
            Ok(())
        }

        async fn health_service(&self, query: &HealthQuery) -> Result<QueryResult> {
            self.wait_indexes.lock().push(query.wait_index);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(QueryResult {
                entries: Vec::new(),
                last_index: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_zero_index_still_blocks() {
        let backend = Arc::new(NoIndex::default());
        let driver = RegistryDriver::new(backend.clone(), options());
        driver
            .watch(&DiscoveryNode::new("api").with_retry_time(0))
            .await
            .unwrap();

        eventually(|| backend.wait_indexes.lock().len() >= 3).await;
        driver.shutdown().await.unwrap();

        let seen = backend.wait_indexes.lock().clone();
        assert_eq!(seen[0], 0);
        assert!(seen[1..].iter().all(|&index| index == 1));
    }

    #[test]
    fn test_apply_snapshot() {
        let table = DiscoveryTable::new();
        let spec = DiscoveryNode::new("api");

        apply_snapshot(
            &table,
            &spec,
            Algorithm::RoundRobin,
            vec![entry("n1", HealthStatus::Passing), entry("n2", HealthStatus::Passing)],
        );
        assert_eq!(table.nodes("api").len(), 2);

        apply_snapshot(
            &table,
            &spec,
            Algorithm::RoundRobin,
            vec![entry("n1", HealthStatus::Critical), entry("n2", HealthStatus::Passing)],
        );
        let nodes = table.nodes("api");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "n2");

        apply_snapshot(&table, &spec, Algorithm::RoundRobin, Vec::new());
        assert!(table.nodes("api").is_empty());
    }

    #[tokio::test]
    async fn test_register_watch_and_shutdown() {
        let registry = InMemoryRegistry::new();
        let driver = RegistryDriver::new(Arc::new(registry.clone()), options());

        driver
            .register(&RegisterNode::new("api-1", "api", "10.0.0.5", 5001))
            .await
            .unwrap();
        driver
            .watch(&DiscoveryNode::new("api").with_retry_time(0))
            .await
            .unwrap();

        eventually(|| driver.get_service("api", "").is_ok()).await;
        assert_eq!(driver.get_service("api", "").unwrap().url(), "http://10.0.0.5:5001");

        registry.set_status("api-1", HealthStatus::Critical).await;
        eventually(|| driver.get_service("api", "").is_err()).await;

        driver.shutdown().await.unwrap();
        assert_eq!(registry.count().await, 0);
        assert!(driver.registered().is_empty());
        assert_eq!(driver.shared.tasks.active(), 0);
    }

    #[tokio::test]
    async fn test_watch_recovers_after_backend_errors() {
        let registry = InMemoryRegistry::new();
        registry.upsert(entry("n1", HealthStatus::Passing)).await;
        registry.fail_next(3);

        let driver = RegistryDriver::new(Arc::new(registry.clone()), options());
        driver
            .watch(&DiscoveryNode::new("api").with_retry_time(0))
            .await
            .unwrap();

        eventually(|| driver.get_service("api", "").is_ok()).await;
        assert!(registry.query_count() >= 4);
        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_same_name_twice_spawns_once() {
        let registry = InMemoryRegistry::new();
        let driver = RegistryDriver::new(Arc::new(registry), options());

        let spec = DiscoveryNode::new("api");
        driver.watch(&spec).await.unwrap();
        driver.watch(&spec).await.unwrap();
        assert_eq!(driver.shared.tasks.active(), 1);

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_service_before_any_event() {
        let driver = RegistryDriver::new(Arc::new(InMemoryRegistry::new()), options());
        driver.watch(&DiscoveryNode::new("api")).await.unwrap();

        assert!(matches!(
            driver.get_service("api", ""),
            Err(DiscoveryError::NoServiceAvailable(_))
        ));
        driver.shutdown().await.unwrap();
    }
}
