//! Client-address hash scheduling

use super::{Algorithm, SchedulingHandler, scan_enabled};
use crate::node::ServiceNode;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Maps a client address to a stable start index and scans forward to the
/// first enabled node. The same client keeps hitting the same node while
/// the collection is unchanged.
#[derive(Debug, Default)]
pub struct IpHashHandler;

impl IpHashHandler {
    pub fn new() -> Self {
        Self
    }
}

impl SchedulingHandler for IpHashHandler {
    fn select<'a>(
        &self,
        nodes: &'a [ServiceNode],
        _service_name: &str,
        client_addr: &str,
    ) -> Option<&'a ServiceNode> {
        if nodes.is_empty() {
            return None;
        }

        let mut hasher = DefaultHasher::new();
        client_addr.hash(&mut hasher);
        let start = (hasher.finish() % nodes.len() as u64) as usize;
        scan_enabled(nodes, start)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::IpHash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::test_support::nodes;
    use std::collections::HashSet;

    #[test]
    fn test_same_client_same_node() {
        let set = nodes(5, &[]);
        let handler = IpHashHandler::new();

        let first = handler.select(&set, "api", "172.16.0.9").unwrap().id.clone();
        for _ in 0..10 {
            assert_eq!(handler.select(&set, "api", "172.16.0.9").unwrap().id, first);
        }
    }

    #[test]
    fn test_clients_spread_across_nodes() {
        let set = nodes(4, &[]);
        let handler = IpHashHandler::new();

        let seen: HashSet<String> = (0..200)
            .map(|i| format!("10.0.{}.{}", i / 250, i % 250))
            .map(|addr| handler.select(&set, "api", &addr).unwrap().id.clone())
            .collect();
        assert!(seen.len() > 1);
    }
}
