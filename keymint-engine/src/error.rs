//! The engine error taxonomy.
//!
//! Kinds map one-to-one onto the failure classes callers must tell apart:
//! bad input, absent entities, invariant conflicts, transient provider/mail
//! failures, reconciliation integrity mismatches, and queue backpressure.
//! HTTP surfaces map kinds to statuses via [`EngineError::http_status`].

use http::StatusCode;
use keymint_common::ids::TxnId;

/// An opaque storage-layer failure (connection loss, constraint violation,
/// serialization conflict). Always treated as a 5xx-equivalent.
#[derive(Debug, thiserror::Error)]
#[error("{0:#}")]
pub struct StoreError(#[source] pub anyhow::Error);

impl StoreError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// User-facing bad input. Not retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity absent for a given key.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Invariant violation (duplicate product ref, order already waitlisted,
    /// license already taken).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Webhook signature verification failed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Transient; internal callers back off.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// HTTP/network failure against a gateway or the mail API. Transient by
    /// default; retried per component policy.
    #[error("External provider error: {0}")]
    Provider(String),

    /// Amount/currency/external-id mismatch during reconciliation. Fatal for
    /// the single operation; never applied to state.
    #[error("Integrity mismatch: {0}")]
    Integrity(String),

    /// Email queue is at capacity; the submission was rejected.
    #[error("Email queue is full")]
    QueueFull,

    /// A concurrent verification holds the per-transaction guard.
    #[error("Transaction {0} is already being verified")]
    AlreadyProcessing(TxnId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Whether a retry at a later time could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Provider(_) | Self::Store(_)
        )
    }

    /// The HTTP status this error surfaces as.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::AlreadyProcessing(_) =>
                StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::provider("503 from gateway").is_transient());
        assert!(EngineError::RateLimited("checkout".into()).is_transient());
        assert!(!EngineError::validation("bad qty").is_transient());
        assert!(!EngineError::integrity("amount mismatch").is_transient());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            EngineError::validation("x").http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::not_found("Order", 9).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(EngineError::QueueFull.http_status(),
            StatusCode::SERVICE_UNAVAILABLE);
    }
}
