//! Discovery error types

use thiserror::Error;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Service discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No enabled node is known for the service.
    #[error("No service available: {0}")]
    NoServiceAvailable(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Deregistration failed: {0}")]
    DeregistrationFailed(String),

    /// The backend no longer knows the lease.
    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    /// Transport or server-side failure talking to the backend.
    #[error("Backend unavailable: {0}")]
    Backend(String),

    /// A backend record could not be decoded.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] waypoint_config::ConfigError),
}

impl DiscoveryError {
    /// Whether the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoServiceAvailable(_)
                | Self::Backend(_)
                | Self::HttpError(_)
                | Self::LeaseNotFound(_)
        )
    }
}
