use thiserror::Error;

/// Main error type for the lifecycle engine
#[derive(Error, Debug)]
pub enum PylonError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Stale data: {0}")]
    StaleData(String),

    // Order execution errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order timeout: {0}")]
    OrderTimeout(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Duplicate order: {0}")]
    DuplicateOrder(String),

    #[error("Insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    #[error("Exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // State machine errors
    #[error("Invalid state transition: from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Unexpected state: {0}")]
    UnexpectedState(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Budget errors
    #[error("Insufficient budget: requested {requested}, free {free}")]
    InsufficientBudget {
        requested: rust_decimal::Decimal,
        free: rust_decimal::Decimal,
    },

    #[error("Unknown reservation: {0}")]
    UnknownReservation(uuid::Uuid),

    // Snapshot errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Unsupported snapshot version: {found} (expected {expected})")]
    SnapshotVersion { found: u32, expected: u32 },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for PylonError
pub type Result<T> = std::result::Result<T, PylonError>;

impl PylonError {
    /// Whether a failed exchange call is worth retrying.
    ///
    /// Transport-level trouble (timeouts, rate limits, outages) is
    /// retryable; rejections and validation failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PylonError::OrderTimeout(_)
                | PylonError::RateLimited(_)
                | PylonError::ExchangeUnavailable(_)
                | PylonError::MarketDataUnavailable(_)
                | PylonError::Io(_)
        )
    }
}

/// Specific error types for order execution
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Order already filled")]
    AlreadyFilled,

    #[error("Order already cancelled")]
    AlreadyCancelled,

    #[error("Partial fill: requested {requested}, filled {filled}")]
    PartialFill {
        requested: rust_decimal::Decimal,
        filled: rust_decimal::Decimal,
    },

    #[error("Fill overflows order: target {target}, cumulative {cumulative}")]
    OverFill {
        target: rust_decimal::Decimal,
        cumulative: rust_decimal::Decimal,
    },

    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u32 },
}

impl From<OrderError> for PylonError {
    fn from(err: OrderError) -> Self {
        PylonError::OrderSubmission(err.to_string())
    }
}
