// Waypoint - client-side service registration and discovery
//
// This library advertises local service instances to a coordination backend
// (Consul or etcd) and resolves remote services into health-filtered node
// sets, picking one node per request through a scheduling policy.

// Re-export discovery functionality
pub use waypoint_discovery::*;

// Re-export member crates
pub use waypoint_config;
pub use waypoint_discovery;

#[cfg(feature = "log")]
pub use waypoint_log;

/// Prelude for common imports.
///
/// ```
/// use waypoint::prelude::*;
/// ```
pub mod prelude {
    pub use waypoint_discovery::{
        Algorithm, DiscoveryError, DiscoveryNode, Protocol, RdClient, RdConfig, RegisterNode,
        ServiceDiscovery, ServiceNode,
    };

    #[cfg(feature = "log")]
    pub use waypoint_log::{LogConfig, init_from_env};
}
