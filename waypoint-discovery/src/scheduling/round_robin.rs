//! Round-robin scheduling

use super::{Algorithm, SchedulingHandler, scan_enabled};
use crate::node::ServiceNode;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates through the collection, skipping disabled nodes.
///
/// The cursor is taken modulo the current length on every call, so the
/// collection may grow or shrink between calls.
#[derive(Debug, Default)]
pub struct RoundRobinHandler {
    cursor: AtomicUsize,
}

impl RoundRobinHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulingHandler for RoundRobinHandler {
    fn select<'a>(
        &self,
        nodes: &'a [ServiceNode],
        _service_name: &str,
        _client_addr: &str,
    ) -> Option<&'a ServiceNode> {
        if nodes.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        scan_enabled(nodes, start)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::RoundRobin
    }
}
