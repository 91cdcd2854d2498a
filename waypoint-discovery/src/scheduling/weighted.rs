//! Weighted random scheduling

use super::{Algorithm, SchedulingHandler};
use crate::node::ServiceNode;
use rand::Rng;

/// Picks an enabled node with probability proportional to its weight.
/// Weights below 1 count as 1.
#[derive(Debug, Default)]
pub struct WeightedRandomHandler;

impl WeightedRandomHandler {
    pub fn new() -> Self {
        Self
    }
}

fn effective_weight(node: &ServiceNode) -> u64 {
    node.weight.max(1) as u64
}

impl SchedulingHandler for WeightedRandomHandler {
    fn select<'a>(
        &self,
        nodes: &'a [ServiceNode],
        _service_name: &str,
        _client_addr: &str,
    ) -> Option<&'a ServiceNode> {
        let total: u64 = nodes
            .iter()
            .filter(|node| node.is_enabled())
            .map(effective_weight)
            .sum();
        if total == 0 {
            return None;
        }

        let mut pick = rand::rng().random_range(0..total);
        for node in nodes.iter().filter(|node| node.is_enabled()) {
            let weight = effective_weight(node);
            if pick < weight {
                return Some(node);
            }
            pick -= weight;
        }
        None
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::WeightedRandom
    }
}
