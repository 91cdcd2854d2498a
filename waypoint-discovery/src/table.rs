//! Discovered-node table
//!
//! One table per driver instance. Watch tasks write to it one event at a
//! time; `get_service` reads it through the bound scheduling policy. Callers
//! only ever receive clones of the table's nodes.

use crate::error::{DiscoveryError, Result};
use crate::node::ServiceNode;
use crate::scheduling::{Algorithm, SchedulingHandler};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Outcome of applying one backend observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new node was appended
    Added,
    /// An existing node was refreshed in place
    Updated,
    /// A node was evicted
    Removed,
    /// The event referred to an unknown node
    Missing,
}

#[derive(Default)]
struct TableState {
    discovered: HashMap<String, Vec<ServiceNode>>,
    schedulers: HashMap<String, Box<dyn SchedulingHandler>>,
}

/// Service name to node collection, plus the scheduler bound to each name.
#[derive(Default)]
pub struct DiscoveryTable {
    state: RwLock<TableState>,
}

impl DiscoveryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a scheduling policy to `name` unless one is already bound.
    pub fn bind_scheduler(&self, name: &str, algorithm: Algorithm) {
        let mut state = self.state.write();
        state
            .schedulers
            .entry(name.to_string())
            .or_insert_with(|| algorithm.handler());
    }

    /// Apply a passing (or put) observation for `node` under `name`.
    pub fn observe_passing(&self, name: &str, algorithm: Algorithm, node: ServiceNode) -> Applied {
        let mut state = self.state.write();
        state
            .schedulers
            .entry(name.to_string())
            .or_insert_with(|| algorithm.handler());

        let nodes = state.discovered.entry(name.to_string()).or_default();
        if let Some(existing) = nodes.iter_mut().find(|n| n.id == node.id) {
            existing.refresh_from(&node);
            existing.observe_passing();
            debug!(service = name, id = %node.id, "refreshed node");
            return Applied::Updated;
        }

        let mut node = node;
        node.name = name.to_string();
        node.observe_passing();
        debug!(service = name, id = %node.id, url = %node.url(), "added node");
        nodes.push(node);
        Applied::Added
    }

    /// Apply a failing (or delete) observation for node `id` under `name`.
    pub fn observe_removed(&self, name: &str, id: &str) -> Applied {
        let mut state = self.state.write();
        let Some(nodes) = state.discovered.get_mut(name) else {
            debug!(service = name, id, "remove for unknown service");
            return Applied::Missing;
        };

        match nodes.iter().position(|n| n.id == id) {
            Some(index) => {
                let mut node = nodes.remove(index);
                node.close();
                debug!(service = name, id, "removed node");
                Applied::Removed
            }
            None => {
                debug!(service = name, id, "remove for unknown node");
                Applied::Missing
            }
        }
    }

    /// Evict every node of `name` whose id is not in `live`.
    ///
    /// Returns the number of evicted nodes.
    pub fn retain_ids(&self, name: &str, live: &HashSet<String>) -> usize {
        let mut state = self.state.write();
        let Some(nodes) = state.discovered.get_mut(name) else {
            return 0;
        };

        let before = nodes.len();
        nodes.retain_mut(|node| {
            if live.contains(&node.id) {
                true
            } else {
                debug!(service = name, id = %node.id, "node absent from backend");
                node.close();
                false
            }
        });
        before - nodes.len()
    }

    /// Pick a node for `name` using its bound policy.
    pub fn select(&self, name: &str, client_addr: &str) -> Result<ServiceNode> {
        let state = self.state.read();

        let nodes = state
            .discovered
            .get(name)
            .filter(|nodes| !nodes.is_empty())
            .ok_or_else(|| DiscoveryError::NoServiceAvailable(name.to_string()))?;

        let scheduler = state
            .schedulers
            .get(name)
            .ok_or_else(|| DiscoveryError::NoServiceAvailable(name.to_string()))?;

        scheduler
            .select(nodes, name, client_addr)
            .cloned()
            .ok_or_else(|| DiscoveryError::NoServiceAvailable(name.to_string()))
    }

    /// Caller-side failure report.
    ///
    /// Returns whether the node is still enabled, or `None` if the table no
    /// longer holds it.
    pub fn report_failure(&self, name: &str, id: &str) -> Option<bool> {
        let mut state = self.state.write();
        let node = state
            .discovered
            .get_mut(name)?
            .iter_mut()
            .find(|n| n.id == id)?;

        let enabled = node.record_failure();
        if !enabled {
            debug!(
                service = name,
                id,
                fail_count = node.fail_count(),
                fail_limit = node.fail_limit,
                "node disabled after caller failures"
            );
        }
        Some(enabled)
    }

    /// Snapshot of every node known for `name`, enabled or not.
    pub fn nodes(&self, name: &str) -> Vec<ServiceNode> {
        self.state
            .read()
            .discovered
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Names with a bound scheduler.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().schedulers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every node, releasing connection handles.
    pub fn clear(&self) {
        let mut state = self.state.write();
        for node in state.discovered.values_mut().flatten() {
            node.close();
        }
        state.discovered.clear();
    }
}
