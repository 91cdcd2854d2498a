//! Discovery facade
//!
//! [`ServiceDiscovery`] is the backend-agnostic driver interface;
//! [`RdClient`] wires a driver to a configuration: it registers every
//! configured local instance and starts a watch for every enabled discovery.

use crate::config::{DiscoveryNode, DriverKind, RdConfig, RegisterNode};
use crate::driver::{KvDriver, RegistryDriver};
use crate::error::Result;
use crate::node::ServiceNode;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use waypoint_config::Validate;

/// Registration and discovery driver
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Publish a local instance and keep it published
    async fn register(&self, node: &RegisterNode) -> Result<()>;

    /// Remove every record this driver published
    async fn deregister(&self) -> Result<()>;

    /// Start following a remote service. Returns immediately.
    async fn watch(&self, spec: &DiscoveryNode) -> Result<()>;

    /// Pick an enabled node of `name`; never waits on the backend
    fn get_service(&self, name: &str, client_addr: &str) -> Result<ServiceNode>;

    /// Caller-side failure report against a node obtained from `get_service`.
    ///
    /// Returns whether the node is still enabled, or `None` if it has left
    /// the table.
    fn report_failure(&self, node: &ServiceNode) -> Option<bool>;

    /// Every known node of `name`, enabled or not
    fn nodes(&self, name: &str) -> Vec<ServiceNode>;

    /// Stop background tasks, then deregister
    async fn shutdown(&self) -> Result<()>;
}

/// Build the driver for `config.driver`.
pub fn build_driver(config: &RdConfig) -> Result<Arc<dyn ServiceDiscovery>> {
    let driver: Arc<dyn ServiceDiscovery> = match config.driver_kind()? {
        DriverKind::Consul => Arc::new(RegistryDriver::consul(config)?),
        DriverKind::Etcd => Arc::new(KvDriver::etcd(config)?),
    };
    Ok(driver)
}

async fn start(driver: &dyn ServiceDiscovery, config: &RdConfig) -> Result<()> {
    for node in &config.registers {
        driver.register(node).await?;
    }

    for spec in &config.discoveries {
        if spec.enable {
            driver.watch(spec).await?;
        } else {
            info!(service = %spec.name, "Discovery entry disabled");
        }
    }
    Ok(())
}

/// Registration and discovery client
///
/// # Examples
///
/// ```rust,ignore
/// use waypoint_discovery::{DiscoveryNode, RdClient, RdConfig};
///
/// let config = RdConfig::new("consul", vec!["127.0.0.1:8500".into()])
///     .with_discovery(DiscoveryNode::new("users"));
/// let client = RdClient::connect(config).await?;
///
/// let node = client.get_service("users", "10.1.2.3")?;
/// println!("calling {}", node.url());
/// ```
pub struct RdClient {
    driver: Arc<dyn ServiceDiscovery>,
    config: RdConfig,
}

impl RdClient {
    /// Validate `config`, build its driver, register and start watching.
    pub async fn connect(config: RdConfig) -> Result<Self> {
        config.driver_kind()?;
        config.validate()?;
        let driver = build_driver(&config)?;
        Self::with_driver(driver, config).await
    }

    /// Load configuration from a file (plus `WAYPOINT_*` overrides) and connect.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect(RdConfig::from_file(path)?).await
    }

    /// Wire an existing driver to `config`.
    ///
    /// If any registration or watch fails, everything already started is
    /// shut down again before the error is returned.
    pub async fn with_driver(driver: Arc<dyn ServiceDiscovery>, config: RdConfig) -> Result<Self> {
        if !config.enable {
            info!("Discovery disabled by configuration");
            return Ok(Self { driver, config });
        }

        if let Err(e) = start(driver.as_ref(), &config).await {
            error!(error = %e, "Discovery client failed to start, rolling back");
            if let Err(cleanup) = driver.shutdown().await {
                warn!(error = %cleanup, "Rollback left records behind");
            }
            return Err(e);
        }

        info!(
            driver = %config.driver,
            registers = config.registers.len(),
            discoveries = config.discoveries.len(),
            "Discovery client ready"
        );
        Ok(Self { driver, config })
    }

    pub fn config(&self) -> &RdConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.driver
    }

    pub fn get_service(&self, name: &str, client_addr: &str) -> Result<ServiceNode> {
        self.driver.get_service(name, client_addr)
    }

    pub fn report_failure(&self, node: &ServiceNode) -> Option<bool> {
        self.driver.report_failure(node)
    }

    pub fn nodes(&self, name: &str) -> Vec<ServiceNode> {
        self.driver.nodes(name)
    }

    /// Register an extra local instance
    pub async fn register(&self, node: &RegisterNode) -> Result<()> {
        self.driver.register(node).await
    }

    /// Watch an extra remote service
    pub async fn watch(&self, spec: &DiscoveryNode) -> Result<()> {
        self.driver.watch(spec).await
    }

    pub async fn deregister(&self) -> Result<()> {
        self.driver.deregister().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.driver.shutdown().await.inspect_err(|e| {
            warn!(error = %e, "Shutdown left records behind");
        })
    }
}
