// =============================================================================
// Error taxonomy — semantic error kinds shared across the engine
// =============================================================================
//
// Strategies branch on the kind, not on message text:
//   - Validation / Invariant errors are never retried.
//   - Credential errors are fatal for the bot holding the key.
//   - Transient errors are retried by the exchange client before surfacing.
//   - OrderNotFound is benign when looking up a specific order.
// =============================================================================

use axum::http::StatusCode;
use thiserror::Error;

/// Engine-wide error type. Task-level plumbing uses `anyhow`; this type
/// exists where callers need to branch on the failure class.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied input failed validation. Surfaces as 4xx.
    #[error("validation: {0}")]
    Validation(String),

    /// API key invalid, bad signature, unauthorized. Fatal for the owning bot.
    #[error("credential: {0}")]
    Credential(String),

    /// Timeout, 5xx, or rate-limit from the exchange. Retried with backoff
    /// before this surfaces.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The order no longer exists on the exchange — already filled or
    /// cancelled and processed.
    #[error("order not found")]
    OrderNotFound,

    /// Business invariant violated: insufficient balance, below exchange
    /// minimums, price off increment. Skipped, never retried.
    #[error("invariant: {0}")]
    Invariant(String),

    /// Resource does not exist or belongs to another user.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else: storage failure, serialization failure, corruption.
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable code for the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Credential(_) => "credential_error",
            Self::Transient(_) => "exchange_unavailable",
            Self::OrderNotFound => "order_not_found",
            Self::Invariant(_) => "invariant_violation",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the API layer.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Invariant(_) => StatusCode::BAD_REQUEST,
            Self::Credential(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) | Self::OrderNotFound => StatusCode::NOT_FOUND,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for errors the exchange client may retry once.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
