//! Random scheduling

use super::{Algorithm, SchedulingHandler};
use crate::node::ServiceNode;
use rand::Rng;

/// Uniform random selection with a bounded number of draws.
///
/// A disabled draw is retried, at most `nodes.len()` times in total, so a
/// fully disabled collection returns `None` instead of looping.
#[derive(Debug, Default)]
pub struct RandomHandler;

impl RandomHandler {
    pub fn new() -> Self {
        Self
    }
}

impl SchedulingHandler for RandomHandler {
    fn select<'a>(
        &self,
        nodes: &'a [ServiceNode],
        _service_name: &str,
        _client_addr: &str,
    ) -> Option<&'a ServiceNode> {
        let mut rng = rand::rng();
        (0..nodes.len())
            .map(|_| &nodes[rng.random_range(0..nodes.len())])
            .find(|node| node.is_enabled())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Random
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::test_support::nodes;
    use std::collections::HashSet;

    #[test]
    fn test_eventually_picks_every_enabled_node() {
        let set = nodes(3, &[]);
        let handler = RandomHandler::new();

        let seen: HashSet<String> = (0..500)
            .filter_map(|_| handler.select(&set, "api", ""))
            .map(|node| node.id.clone())
            .collect();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_single_node() {
        let set = nodes(1, &[]);
        assert_eq!(RandomHandler::new().select(&set, "api", "").unwrap().id, "n0");
    }
}
