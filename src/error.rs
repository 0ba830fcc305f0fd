use thiserror::Error;

/// Unified error type for pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    // Registry errors
    #[error("Proxy {address} ({protocol}) already exists")]
    DuplicateAddress { address: String, protocol: String },

    #[error("Proxy not found: {id}")]
    NotFound { id: u64 },

    // Rotation errors
    #[error("No healthy proxies available")]
    NoHealthyProxy,

    // Store errors
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    // Validation errors
    #[error("Invalid proxy address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Check whether the error indicates a missing record rather than a failure
    /// of the operation itself. Health-check code treats these as benign races.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::NotFound { .. })
    }
}

// All database-level failures surface as StorageUnavailable; the store's
// narrow interface reports row absence through Option, never through errors.
impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        PoolError::StorageUnavailable(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::InvalidAddress(err.to_string())
    }
}
