use thiserror::Error;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum TabSyncError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Action / conflict misuse (surfaced to the caller)
    #[error("Unknown action type: {0}")]
    UnknownActionType(String),

    #[error("Conflict {conflict_id} requires a user choice referencing one of its actions")]
    MissingUserChoice { conflict_id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Best-effort infrastructure (logged and swallowed inside the core)
    #[error("Native broadcast transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TabSyncError {
    pub fn action_not_found(id: impl Into<String>) -> Self {
        TabSyncError::NotFound {
            kind: "Action",
            id: id.into(),
        }
    }

    pub fn conflict_not_found(id: impl Into<String>) -> Self {
        TabSyncError::NotFound {
            kind: "Conflict",
            id: id.into(),
        }
    }

    /// True for errors the caller should treat as "already resolved elsewhere"
    pub fn is_not_found(&self) -> bool {
        matches!(self, TabSyncError::NotFound { .. })
    }
}

/// Result type alias for TabSyncError
pub type Result<T> = std::result::Result<T, TabSyncError>;

/// Errors raised by the broadcast transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("native channel unavailable: {0}")]
    Unavailable(String),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("storage relay failed: {0}")]
    Relay(#[from] StoreError),
}

/// Errors raised by the local key-value store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("quota exceeded: writing {requested} bytes would exceed {quota} bytes")]
    QuotaExceeded { requested: usize, quota: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("io failure on {key}: {reason}")]
    Io { key: String, reason: String },
}
