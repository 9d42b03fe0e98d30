use thiserror::Error;

pub type AudienceResult<T> = Result<T, AudienceError>;

#[derive(Error, Debug)]
pub enum AudienceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No conditions to evaluate")]
    NoConditions,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AudienceError {
    pub fn config(msg: impl Into<String>) -> Self {
        AudienceError::Configuration(msg.into())
    }

    /// Stable machine-readable code used by the REST layer.
    pub fn code(&self) -> &'static str {
        match self {
            AudienceError::Configuration(_) => "configuration_error",
            AudienceError::NoConditions => "no_conditions",
            AudienceError::NotFound(_) => "not_found",
            AudienceError::Query(_) => "query_error",
            AudienceError::Delivery(_) => "delivery_error",
            AudienceError::Store(_) => "store_error",
            AudienceError::Render(_) => "render_error",
            AudienceError::Serialization(_) => "serialization_error",
            AudienceError::Io(_) => "io_error",
            AudienceError::Internal(_) => "internal_error",
        }
    }
}

/// Raw-query failures. Messages from the engine are carried verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Execution(String),

    #[error("query exceeded the {timeout_ms} ms time limit")]
    Timeout { timeout_ms: u64 },

    #[error("query returned {returned} rows but the dataset only holds {total}")]
    NotASubset { returned: u64, total: u64 },
}

/// Connector-side failures. Captured per job, never propagated to the scheduler loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("destination {0} is not configured")]
    NotConfigured(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("destination rejected the upload with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("delivery timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("local write failed: {0}")]
    Io(String),
}

/// Persistence failures for segment and schedule records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store I/O failure: {0}")]
    Io(String),

    #[error("store encoding failure: {0}")]
    Encoding(String),

    #[error("corrupt record at {location}: {reason}")]
    Corrupt { location: String, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
