//! Error types for the studio webhook
//!
//! Every non-pass-through failure in the admission pipeline ends up here and
//! is surfaced to the API server as a denied admission (the webhook registers
//! with failurePolicy=Fail). Pass-through outcomes are not errors.

use thiserror::Error;

/// Result type for webhook operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for webhook operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Registry lookup failed (transport or server failure, not a miss)
    #[error("registry error: {0}")]
    Registry(String),

    /// A binding carries a pod selector that does not parse. This is a
    /// data-integrity bug in the registry, so admission is denied instead of
    /// silently skipping the binding.
    #[error("invalid pod selector {selector:?}: {message}")]
    Selector {
        /// The raw selector string from the binding
        selector: String,
        /// What the parser rejected
        message: String,
    },

    /// A matched binding references a dev container that no longer exists
    #[error("dev container {0} not found")]
    MissingContainer(i64),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Proxy bootstrap could not be serialized to YAML
    #[error("proxy config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error (startup, TLS, manifest resolution)
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a registry error from any displayable cause
    pub fn registry(err: impl std::fmt::Display) -> Self {
        Self::Registry(err.to_string())
    }
}
