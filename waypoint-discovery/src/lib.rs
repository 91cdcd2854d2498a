//! Client-side service registration and discovery
//!
//! A process advertises its own instances to a coordination backend and
//! resolves other services into a live, health-filtered set of nodes, one
//! node per request through a pluggable scheduling policy.
//!
//! ## Features
//!
//! - **Registration** - Consul check-based registration, or etcd lease-based
//!   publication with automatic renewal and re-grant
//! - **Discovery** - one background watch per service reconciling backend
//!   events into a shared table
//! - **Circuit breaking** - caller failure reports disable a node past its
//!   fail limit until the backend reports it healthy again
//! - **Scheduling** - round-robin, random, weighted random, IP hash, or a
//!   custom [`SchedulingHandler`]
//! - **Multiple Backends** - Consul, etcd, or in-memory
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use waypoint_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RdConfig::new("etcd", vec!["127.0.0.1:2379".into()])
//!         .with_register(RegisterNode::new("api-1", "api", "10.0.0.5", 8080))
//!         .with_discovery(DiscoveryNode::new("users").with_algorithm("random"));
//!
//!     let client = RdClient::connect(config).await?;
//!
//!     match client.get_service("users", "10.0.0.5") {
//!         Ok(node) => {
//!             let http = node.connection()?;
//!             if http.get(format!("{}/profile", node.url())).send().await.is_err() {
//!                 client.report_failure(&node);
//!             }
//!         }
//!         Err(e) => eprintln!("no users node yet: {}", e),
//!     }
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### In-Memory Backends (Testing)
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waypoint_discovery::*;
//! use waypoint_discovery::backend::memory::InMemoryRegistry;
//!
//! let registry = InMemoryRegistry::new();
//! let driver = Arc::new(RegistryDriver::new(Arc::new(registry.clone()), DriverOptions::default()));
//! let client = RdClient::with_driver(driver, config).await?;
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod node;
pub mod scheduling;
pub mod table;

pub use client::{RdClient, ServiceDiscovery, build_driver};
pub use config::{DiscoveryNode, DriverKind, RdConfig, RegisterNode};
pub use driver::{DriverOptions, KvDriver, RegistryDriver};
pub use error::{DiscoveryError, Result};
pub use node::{Protocol, ServiceNode};
pub use scheduling::{Algorithm, SchedulingHandler};
pub use table::DiscoveryTable;
