//! Error types for the kiln domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; all of them fold into
//! [`Error`] and expose a stable machine-checkable [`code`](Error::code).

use thiserror::Error;

/// The top-level error type for all kiln operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Conversation store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Generation gate errors ---
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    // --- Routing errors ---
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    // --- Request validation ---
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error category for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.code(),
            Self::Generation(e) => e.code(),
            Self::Routing(e) => e.code(),
            Self::InvalidParameters(_) | Self::Serialization(_) => "invalid_parameters",
            Self::Config { .. } | Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConversationNotFound(_) => "not_found",
            Self::Storage(_) | Self::QueryFailed(_) | Self::MigrationFailed(_) => "storage_error",
        }
    }
}

/// Why a model load ultimately failed, after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailureCause {
    NotFound,
    Network,
    Unknown,
}

impl std::fmt::Display for LoadFailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Network => "network",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Invalid generation parameters: {0}")]
    InvalidParameters(String),

    #[error("Model loading failed ({cause}): {message}")]
    ModelLoadFailed {
        cause: LoadFailureCause,
        message: String,
    },

    #[error("Generation slot busy: lock not acquired within {waited_ms}ms")]
    Busy { waited_ms: u64 },

    #[error("Generation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Runtime failure: {0}")]
    Runtime(String),
}

impl GenerationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoModelLoaded => "no_model_loaded",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::ModelLoadFailed { .. } => "model_load_failed",
            Self::Busy { .. } => "busy",
            Self::Timeout { .. } => "timeout",
            Self::Runtime(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    #[error("Peer unreachable at {endpoint}: {reason}")]
    PeerUnreachable { endpoint: String, reason: String },

    #[error("Peer returned status {status_code}: {message}")]
    PeerRejected { status_code: u16, message: String },

    #[error("Invalid peer response: {0}")]
    InvalidResponse(String),
}

impl RoutingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PeerUnreachable { .. } => "peer_unreachable",
            Self::PeerRejected { .. } | Self::InvalidResponse(_) => "internal",
        }
    }
}

/// Errors raised by an external model runtime.
///
/// The gate classifies these into [`LoadFailureCause`] when a load gives up.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("{0}")]
    Other(String),
}
