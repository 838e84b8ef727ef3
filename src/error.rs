use redis::RedisError;
use thiserror::Error;

/// Rejections raised before any state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("document_type must not be empty")]
    EmptyDocumentType,

    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("format_template must not be empty")]
    EmptyTemplate,

    #[error("unknown placeholder {{{0}}} in format template")]
    UnknownPlaceholder(String),

    #[error("invalid width {width:?} for placeholder {{{name}}}")]
    InvalidWidth { name: String, width: String },

    #[error("document type {0} counts per warehouse, a warehouse is required")]
    MissingWarehouse(String),

    #[error("counter reset for {0} must be explicitly confirmed")]
    ResetNotConfirmed(String),

    #[error("per-warehouse document type {0} needs a {{warehouse}} placeholder in its template")]
    WarehousePlaceholderRequired(String),

    #[error("malformed request body: {0}")]
    MalformedBody(String),
}

#[derive(Error, Debug)]
pub enum NumberingError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("document type already defined: {0}")]
    DuplicateType(String),

    #[error("document type not found: {0}")]
    NotFound(String),

    #[error("document type is inactive: {0}")]
    Inactive(String),

    #[error("counter for {0} is busy, retry later")]
    Busy(String),

    #[error("counter overflow for {0}")]
    Overflow(String),

    #[error("store error: {0}")]
    Store(String),
}

impl NumberingError {
    /// Only contention is worth retrying; everything else fails the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NumberingError::Busy(_))
    }
}

impl From<RedisError> for NumberingError {
    fn from(err: RedisError) -> Self {
        NumberingError::Store(format!("redis: {}", err))
    }
}

impl From<serde_json::Error> for NumberingError {
    fn from(err: serde_json::Error) -> Self {
        NumberingError::Store(format!("serialization: {}", err))
    }
}
