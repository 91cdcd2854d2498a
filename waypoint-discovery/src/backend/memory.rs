//! In-memory backends (for testing/development)
//!
//! [`InMemoryRegistry`] mimics a health-check registry with blocking queries;
//! [`InMemoryKv`] mimics a lease-based key-value store with revisioned
//! watches. Both can inject transient failures.

use super::{
    HealthQuery, HealthStatus, KeyValue, KvBackend, KvEvent, QueryResult, RangeResult,
    Registration, RegistryBackend, ServiceEntry, WatchStream,
};
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, broadcast, watch};

/// Consume one injected failure, if any are pending.
fn take_failure(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected() -> DiscoveryError {
    DiscoveryError::Backend("injected failure".to_string())
}

// ============================================================================
// Registry
// ============================================================================

/// In-memory health-check registry
#[derive(Clone)]
pub struct InMemoryRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    services: RwLock<BTreeMap<String, ServiceEntry>>,
    index: watch::Sender<u64>,
    failures: AtomicUsize,
    queries: AtomicUsize,
}

impl InMemoryRegistry {
    /// Create new in-memory registry
    pub fn new() -> Self {
        let (index, _) = watch::channel(1);
        Self {
            inner: Arc::new(RegistryInner {
                services: RwLock::new(BTreeMap::new()),
                index,
                failures: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
            }),
        }
    }

    fn bump(&self) {
        self.inner.index.send_modify(|index| *index += 1);
    }

    /// Insert or replace an entry, waking blocked queries
    pub async fn upsert(&self, entry: ServiceEntry) {
        self.inner
            .services
            .write()
            .await
            .insert(entry.id.clone(), entry);
        self.bump();
    }

    /// Change the aggregated status of an entry
    pub async fn set_status(&self, id: &str, status: HealthStatus) -> bool {
        let changed = match self.inner.services.write().await.get_mut(id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        };
        if changed {
            self.bump();
        }
        changed
    }

    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.inner.services.write().await.remove(id).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<ServiceEntry> {
        self.inner.services.read().await.get(id).cloned()
    }

    /// Get count of registered entries
    pub async fn count(&self) -> usize {
        self.inner.services.read().await.len()
    }

    /// Make the next `n` health queries fail
    pub fn fail_next(&self, n: usize) {
        self.inner.failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Health queries received so far, failed ones included
    pub fn query_count(&self) -> usize {
        self.inner.queries.load(Ordering::SeqCst)
    }

    pub fn index(&self) -> u64 {
        *self.inner.index.borrow()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryBackend for InMemoryRegistry {
    async fn register(&self, registration: &Registration) -> Result<()> {
        self.upsert(ServiceEntry {
            id: registration.id.clone(),
            service: registration.name.clone(),
            namespace: registration.namespace.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: registration.tags.clone(),
            meta: registration.meta.clone(),
            status: HealthStatus::Passing,
        })
        .await;
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        self.remove(service_id).await;
        Ok(())
    }

    async fn health_service(&self, query: &HealthQuery) -> Result<QueryResult> {
        self.inner.queries.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.inner.failures) {
            return Err(injected());
        }

        if query.wait_index > 0 {
            let mut rx = self.inner.index.subscribe();
            let changed = async {
                loop {
                    let current = *rx.borrow_and_update();
                    if current > query.wait_index || rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            let _ = tokio::time::timeout(query.wait, changed).await;
        }

        let entries = self
            .inner
            .services
            .read()
            .await
            .values()
            .filter(|e| e.service == query.service)
            .filter(|e| query.tag.is_empty() || e.tags.contains(&query.tag))
            .filter(|e| query.namespace.is_empty() || e.namespace == query.namespace)
            .cloned()
            .collect();

        Ok(QueryResult {
            entries,
            last_index: self.index(),
        })
    }
}

// ============================================================================
// Key-value store
// ============================================================================

#[derive(Debug, Clone)]
enum Notice {
    Event(i64, KvEvent),
    /// Break every open watch stream
    Interrupt,
}

#[derive(Default)]
struct KvState {
    kvs: BTreeMap<String, KeyValue>,
    /// lease id to TTL
    leases: HashMap<i64, i64>,
    next_lease: i64,
    revision: i64,
    history: Vec<(i64, KvEvent)>,
    grants: usize,
}

impl KvState {
    fn emit(&mut self, event: KvEvent, events: &broadcast::Sender<Notice>) {
        self.revision += 1;
        self.history.push((self.revision, event.clone()));
        let _ = events.send(Notice::Event(self.revision, event));
    }

    fn delete_key(&mut self, key: &str, events: &broadcast::Sender<Notice>) -> bool {
        if self.kvs.remove(key).is_none() {
            return false;
        }
        self.emit(
            KvEvent::Delete {
                key: key.to_string(),
            },
            events,
        );
        true
    }

    /// Drop a lease and every key attached to it.
    fn drop_lease(&mut self, lease: i64, events: &broadcast::Sender<Notice>) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let attached: Vec<String> = self
            .kvs
            .values()
            .filter(|kv| kv.lease == lease)
            .map(|kv| kv.key.clone())
            .collect();
        for key in attached {
            self.delete_key(&key, events);
        }
        true
    }
}

/// In-memory lease-based key-value store
#[derive(Clone)]
pub struct InMemoryKv {
    inner: Arc<KvInner>,
}

struct KvInner {
    state: Mutex<KvState>,
    events: broadcast::Sender<Notice>,
    read_failures: AtomicUsize,
    write_failures: AtomicUsize,
}

impl InMemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(KvInner {
                state: Mutex::new(KvState::default()),
                events,
                read_failures: AtomicUsize::new(0),
                write_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Expire a lease as if its TTL ran out
    pub fn expire_lease(&self, lease: i64) -> bool {
        self.inner
            .state
            .lock()
            .drop_lease(lease, &self.inner.events)
    }

    /// Write a key without a lease, bypassing failure injection
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            lease: 0,
        };
        let mut state = self.inner.state.lock();
        state.kvs.insert(kv.key.clone(), kv.clone());
        state.emit(KvEvent::Put(kv), &self.inner.events);
    }

    pub fn get(&self, key: &str) -> Option<KeyValue> {
        self.inner.state.lock().kvs.get(key).cloned()
    }

    /// Keys under `prefix`, in order
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .kvs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Live leases
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    /// Leases granted so far
    pub fn grant_count(&self) -> usize {
        self.inner.state.lock().grants
    }

    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// Make the next `n` range or watch calls fail
    pub fn fail_next_reads(&self, n: usize) {
        self.inner.read_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Make the next `n` grant, keepalive or put calls fail
    pub fn fail_next_writes(&self, n: usize) {
        self.inner.write_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Break every open watch stream with an error
    pub fn interrupt_watches(&self) {
        let _ = self.inner.events.send(Notice::Interrupt);
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for InMemoryKv {
    async fn lease_grant(&self, ttl_secs: i64) -> Result<i64> {
        if take_failure(&self.inner.write_failures) {
            return Err(injected());
        }
        let mut state = self.inner.state.lock();
        state.next_lease += 1;
        state.grants += 1;
        let lease = state.next_lease;
        state.leases.insert(lease, ttl_secs);
        Ok(lease)
    }

    async fn lease_keep_alive(&self, lease: i64) -> Result<()> {
        if take_failure(&self.inner.write_failures) {
            return Err(injected());
        }
        if self.inner.state.lock().leases.contains_key(&lease) {
            Ok(())
        } else {
            Err(DiscoveryError::LeaseNotFound(lease))
        }
    }

    async fn lease_revoke(&self, lease: i64) -> Result<()> {
        self.inner
            .state
            .lock()
            .drop_lease(lease, &self.inner.events);
        Ok(())
    }

    async fn put(&self, key: &str, value: &[u8], lease: i64) -> Result<()> {
        if take_failure(&self.inner.write_failures) {
            return Err(injected());
        }
        let mut state = self.inner.state.lock();
        if lease != 0 && !state.leases.contains_key(&lease) {
            return Err(DiscoveryError::LeaseNotFound(lease));
        }
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            lease,
        };
        state.kvs.insert(kv.key.clone(), kv.clone());
        state.emit(KvEvent::Put(kv), &self.inner.events);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner
            .state
            .lock()
            .delete_key(key, &self.inner.events);
        Ok(())
    }

    async fn range(&self, prefix: &str) -> Result<RangeResult> {
        if take_failure(&self.inner.read_failures) {
            return Err(injected());
        }
        let state = self.inner.state.lock();
        Ok(RangeResult {
            kvs: state
                .kvs
                .values()
                .filter(|kv| kv.key.starts_with(prefix))
                .cloned()
                .collect(),
            revision: state.revision,
        })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        if take_failure(&self.inner.read_failures) {
            return Err(injected());
        }

        // Subscribe and read history under one lock so nothing is missed or repeated.
        let (rx, backlog) = {
            let state = self.inner.state.lock();
            let rx = self.inner.events.subscribe();
            let backlog: Vec<Result<Vec<KvEvent>>> = state
                .history
                .iter()
                .filter(|(rev, ev)| *rev >= start_revision && ev.key().starts_with(prefix))
                .map(|(_, ev)| Ok(vec![ev.clone()]))
                .collect();
            (rx, backlog)
        };

        let live = stream::unfold(
            (rx, prefix.to_string()),
            move |(mut rx, prefix)| async move {
                loop {
                    match rx.recv().await {
                        Ok(Notice::Event(rev, event))
                            if rev >= start_revision && event.key().starts_with(&prefix) =>
                        {
                            return Some((Ok(vec![event]), (rx, prefix)));
                        }
                        Ok(Notice::Event(..)) => continue,
                        Ok(Notice::Interrupt) => {
                            let err = DiscoveryError::Backend("watch interrupted".to_string());
                            return Some((Err(err), (rx, prefix)));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let err = DiscoveryError::Backend(format!("watch lagged by {n} events"));
                            return Some((Err(err), (rx, prefix)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(stream::iter(backlog).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterNode;
    use std::time::Duration;

    fn query(name: &str, index: u64) -> HealthQuery {
        HealthQuery {
            service: name.into(),
            tag: String::new(),
            namespace: String::new(),
            wait_index: index,
            wait: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_register_and_query() {
        let registry = InMemoryRegistry::new();
        let node = RegisterNode::new("api-1", "api", "10.0.0.5", 5001).with_tag("v1");
        registry.register(&Registration::from(&node)).await.unwrap();

        let result = registry.health_service(&query("api", 0)).await.unwrap();
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].status, HealthStatus::Passing);
        assert!(result.last_index > 0);

        let mut tagged = query("api", 0);
        tagged.tag = "v2".into();
        assert!(registry.health_service(&tagged).await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_ok() {
        let registry = InMemoryRegistry::new();
        registry.deregister("ghost").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_query_times_out() {
        let registry = InMemoryRegistry::new();
        let index = registry.index();

        let result = registry.health_service(&query("api", index)).await.unwrap();
        assert_eq!(result.last_index, index);
    }

    #[tokio::test]
    async fn test_blocking_query_wakes_on_change() {
        let registry = InMemoryRegistry::new();
        let index = registry.index();

        let writer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let node = RegisterNode::new("api-1", "api", "10.0.0.5", 5001);
            writer.register(&Registration::from(&node)).await.unwrap();
        });

        let result = registry.health_service(&query("api", index)).await.unwrap();
        assert!(result.last_index > index);
        assert_eq!(result.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let registry = InMemoryRegistry::new();
        registry.fail_next(1);
        assert!(registry.health_service(&query("api", 0)).await.is_err());
        assert!(registry.health_service(&query("api", 0)).await.is_ok());
        assert_eq!(registry.query_count(), 2);
    }

    #[tokio::test]
    async fn test_kv_lease_lifecycle() {
        let kv = InMemoryKv::new();
        let lease = kv.lease_grant(5).await.unwrap();
        kv.put("api/1", b"{}", lease).await.unwrap();
        kv.lease_keep_alive(lease).await.unwrap();

        assert!(kv.expire_lease(lease));
        assert!(kv.get("api/1").is_none());
        assert!(matches!(
            kv.lease_keep_alive(lease).await,
            Err(DiscoveryError::LeaseNotFound(id)) if id == lease
        ));
        assert!(matches!(
            kv.put("api/1", b"{}", lease).await,
            Err(DiscoveryError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kv_range_prefix() {
        let kv = InMemoryKv::new();
        kv.put_raw("api/1", b"a");
        kv.put_raw("api-gateway/1", b"b");

        let range = kv.range("api/").await.unwrap();
        assert_eq!(range.kvs.len(), 1);
        assert_eq!(range.revision, 2);
    }

    #[tokio::test]
    async fn test_kv_watch_replays_from_revision() {
        let kv = InMemoryKv::new();
        kv.put_raw("api/1", b"a");
        let revision = kv.revision();
        kv.put_raw("api/2", b"b");

        let mut events = kv.watch("api/", revision + 1).await.unwrap();
        let replayed = events.next().await.unwrap().unwrap();
        assert_eq!(replayed[0].key(), "api/2");

        kv.delete("api/1").await.unwrap();
        let live = events.next().await.unwrap().unwrap();
        assert_eq!(live[0], KvEvent::Delete { key: "api/1".into() });
    }

    #[tokio::test]
    async fn test_kv_watch_interrupt() {
        let kv = InMemoryKv::new();
        let mut events = kv.watch("api/", 1).await.unwrap();
        kv.interrupt_watches();
        assert!(events.next().await.unwrap().is_err());
    }
}
