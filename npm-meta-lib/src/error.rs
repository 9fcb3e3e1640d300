//! Error types for npm-meta
//!
//! One error type covers the upstream client, the metadata store and the
//! reconciliation layer, so the API layer can map every failure kind to a
//! distinct status and message.

use thiserror::Error;

/// Result type alias using MetaError
pub type Result<T> = std::result::Result<T, MetaError>;

/// Comprehensive error type for all npm-meta operations
#[derive(Error, Debug)]
pub enum MetaError {
    /// Upstream refused the credentials or the session token expired
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Timeout or network failure talking to Nginx Proxy Manager
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream validation error (e.g. duplicate incoming port)
    #[error("Upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    /// No free incoming port left in the configured range
    #[error("No free port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    /// The rule was created upstream but its metadata could not be stored
    #[error("Rule {rule_id} created but metadata was not saved: {reason}")]
    MetadataPersistFailed { rule_id: i64, reason: String },

    /// The local metadata store could not be read or written
    #[error("Local store unavailable: {0}")]
    LocalStoreUnavailable(String),

    /// The referenced forwarding rule does not exist upstream
    #[error("Forwarding rule {0} not found")]
    RuleNotFound(i64),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MetaError {
    /// Create an authentication error with context
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Create an upstream-unavailable error with context
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    /// Create an upstream rejection carrying the upstream status and detail
    pub fn rejected(status: u16, msg: impl Into<String>) -> Self {
        Self::UpstreamRejected {
            status,
            message: msg.into(),
        }
    }

    /// Create a local store error with context
    pub fn store(msg: impl Into<String>) -> Self {
        Self::LocalStoreUnavailable(msg.into())
    }

    /// Create an invalid input error with context
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a config error with context
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable machine-readable identifier for the failure kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::PortRangeExhausted { .. } => "port_range_exhausted",
            Self::MetadataPersistFailed { .. } => "metadata_persist_failed",
            Self::LocalStoreUnavailable(_) => "local_store_unavailable",
            Self::RuleNotFound(_) => "rule_not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::Other(_) => "internal",
        }
    }

    /// Whether retrying the same call unchanged may succeed.
    ///
    /// `UpstreamRejected` needs different input (e.g. another port), so it is
    /// not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::LocalStoreUnavailable(_)
        )
    }
}
