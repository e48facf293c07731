use thiserror::Error;

/// Error types that can be produced by the service discovery component.
#[derive(Error, Debug)]
pub enum ServiceDiscoError {
    /// Malformed construction input, such as an invalid property expression.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The transport adapter refused or could not start a browse subscription.
    #[error("Browse failed: {0}")]
    BrowseFailed(String),

    /// The transport adapter refused to publish or withdraw a local service.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Adapter failure after a browser was started. Only ever logged.
    #[error("Transient adapter error: {0}")]
    Transient(String),

    /// mDNS service errors.
    #[error("mDNS error: {0}")]
    MdnsError(#[from] mdns_sd::Error),

    /// Standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Errors encountered during mDNS daemon shutdown.
    #[error("Discovery shutdown error: {0}")]
    ShutdownError(String),

    /// State errors, indicating an invalid operation for the current state.
    #[error("State error: {0}")]
    StateError(String),

    /// Configuration documents that could not be parsed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for the service discovery component.
pub type Result<T> = std::result::Result<T, ServiceDiscoError>;
