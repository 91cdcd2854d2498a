//! Node scheduling policies
//!
//! A policy picks one enabled node out of a service's node collection. The
//! driver binds one policy instance per discovered service name and consults
//! it on every `get_service` call.
//!
//! Policies receive the full collection (disabled nodes included) and the
//! caller's address hint; adding a policy means implementing
//! [`SchedulingHandler`] and naming it in [`Algorithm`].

mod ip_hash;
mod random;
mod round_robin;
mod weighted;

pub use ip_hash::IpHashHandler;
pub use random::RandomHandler;
pub use round_robin::RoundRobinHandler;
pub use weighted::WeightedRandomHandler;

use crate::node::ServiceNode;

/// Selects a node for one request.
pub trait SchedulingHandler: Send + Sync {
    /// Pick an enabled node, or `None` when there is none.
    fn select<'a>(
        &self,
        nodes: &'a [ServiceNode],
        service_name: &str,
        client_addr: &str,
    ) -> Option<&'a ServiceNode>;

    /// Algorithm implemented by this handler
    fn algorithm(&self) -> Algorithm;
}

/// Scheduling algorithm, selected by name in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Rotate through nodes
    RoundRobin,

    /// Uniform random selection
    Random,

    /// Random selection proportional to node weight
    WeightedRandom,

    /// Stable selection by client address
    IpHash,
}

impl Algorithm {
    /// Resolve a configured name. Unknown names fall back to round-robin.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "random" => Algorithm::Random,
            "weight" | "weighted" => Algorithm::WeightedRandom,
            "iphash" | "ip_hash" => Algorithm::IpHash,
            _ => Algorithm::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "robin",
            Algorithm::Random => "random",
            Algorithm::WeightedRandom => "weight",
            Algorithm::IpHash => "iphash",
        }
    }

    /// Create a fresh policy instance
    pub fn handler(&self) -> Box<dyn SchedulingHandler> {
        match self {
            Algorithm::RoundRobin => Box::new(RoundRobinHandler::new()),
            Algorithm::Random => Box::new(RandomHandler::new()),
            Algorithm::WeightedRandom => Box::new(WeightedRandomHandler::new()),
            Algorithm::IpHash => Box::new(IpHashHandler::new()),
        }
    }
}

/// First enabled node scanning forward from `start`, wrapping once.
pub(crate) fn scan_enabled(nodes: &[ServiceNode], start: usize) -> Option<&ServiceNode> {
    let len = nodes.len();
    (0..len)
        .map(|offset| &nodes[(start + offset) % len])
        .find(|node| node.is_enabled())
}


#[cfg(test)]
mod tests {
    use super::test_support::nodes;
    use super::*;

    const ALL: [Algorithm; 4] = [
        Algorithm::RoundRobin,
        Algorithm::Random,
        Algorithm::WeightedRandom,
        Algorithm::IpHash,
    ];

    #[test]
    fn test_algorithm_names() {
        assert_eq!(Algorithm::from_name("robin"), Algorithm::RoundRobin);
        assert_eq!(Algorithm::from_name("random"), Algorithm::Random);
        assert_eq!(Algorithm::from_name("Weight"), Algorithm::WeightedRandom);
        assert_eq!(Algorithm::from_name("ip_hash"), Algorithm::IpHash);
        assert_eq!(Algorithm::from_name("least_conn"), Algorithm::RoundRobin);

        for algorithm in ALL {
            assert_eq!(Algorithm::from_name(algorithm.as_str()), algorithm);
            assert_eq!(algorithm.handler().algorithm(), algorithm);
        }
    }

    #[test]
    fn test_no_policy_selects_disabled_node() {
        let set = nodes(5, &[0, 2, 3]);
        for algorithm in ALL {
            let handler = algorithm.handler();
            for i in 0..50 {
                let hint = format!("192.168.0.{}", i);
                // Random may give up after len draws; it must still never pick a disabled node.
                if let Some(node) = handler.select(&set, "api", &hint) {
                    assert!(node.is_enabled(), "{:?} picked {}", algorithm, node.id);
                }
            }
        }
    }

    #[test]
    fn test_none_when_nothing_enabled() {
        for algorithm in ALL {
            let handler = algorithm.handler();
            assert!(handler.select(&[], "api", "").is_none());
            assert!(handler.select(&nodes(3, &[0, 1, 2]), "api", "").is_none());
        }
    }

    #[test]
    fn test_deterministic_policies_find_single_enabled_node() {
        let set = nodes(4, &[0, 1, 3]);
        for algorithm in [Algorithm::RoundRobin, Algorithm::WeightedRandom, Algorithm::IpHash] {
            let handler = algorithm.handler();
            for _ in 0..8 {
                assert_eq!(handler.select(&set, "api", "10.1.1.1").unwrap().id, "n2");
            }
        }
    }

    #[test]
    fn test_scan_wraps_once() {
        let set = nodes(3, &[1, 2]);
        assert_eq!(scan_enabled(&set, 1).unwrap().id, "n0");
        assert!(scan_enabled(&nodes(2, &[0, 1]), 0).is_none());
    }
}
