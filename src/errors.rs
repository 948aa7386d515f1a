// Domain error taxonomy and its HTTP projection.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("scan not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("scanner timed out")]
    Timeout,

    #[error("image not found")]
    ImageNotFound,

    #[error("image pull failed: {0}")]
    PullFailed(String),

    #[error("scanner exited with an unclassified error: {0}")]
    ScannerError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database transaction error: {0}")]
    Transaction(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("duplicate submission: {0}")]
    DuplicateSubmission(String),
}

impl ScanError {
    /// The persisted/surfaced short code from the error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::Validation(_) => "VALIDATION_ERROR",
            ScanError::NotFound(_) => "SCAN_NOT_FOUND",
            ScanError::Timeout => "TIMEOUT",
            ScanError::ImageNotFound => "IMAGE_NOT_FOUND",
            ScanError::PullFailed(_) => "PULL_FAILED",
            ScanError::ScannerError(_) => "TRIVY_ERROR",
            ScanError::Internal(_) => "INTERNAL_ERROR",
            ScanError::Database(_) => "DATABASE_ERROR",
            ScanError::Transaction(_) => "DATABASE_TRANSACTION_ERROR",
            ScanError::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ScanError::DuplicateSubmission(_) => "DUPLICATE_SUBMISSION",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ScanError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ScanError::NotFound(_) => StatusCode::NOT_FOUND,
            ScanError::Timeout
            | ScanError::ImageNotFound
            | ScanError::PullFailed(_)
            | ScanError::ScannerError(_)
            | ScanError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ScanError::Database(_) | ScanError::Transaction(_) => StatusCode::SERVICE_UNAVAILABLE,
            ScanError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ScanError::DuplicateSubmission(_) => StatusCode::CONFLICT,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        if matches!(self, ScanError::Database(_) | ScanError::Transaction(_)) {
            tracing::error!(error = %self, "store unavailable");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            error_code: self.code().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Error codes that are excluded from retry eligibility. `PULL_FAILED` is
/// deliberately absent from this set even for its auth/rate-limit subkinds.
pub const PERMANENT_ERROR_CODES: &[&str] = &["IMAGE_NOT_FOUND", "INVALID_IMAGE", "AUTH_FAILED"];

pub fn is_permanent(error_code: &str) -> bool {
    PERMANENT_ERROR_CODES.contains(&error_code)
}

/// Postgres error code 23505 is `unique_violation`. Used to turn a racing
/// idempotency-key insert into a 409 instead of a generic 503.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_failed_is_not_permanent() {
        assert!(!is_permanent("PULL_FAILED"));
    }

    #[test]
    fn image_not_found_is_permanent() {
        assert!(is_permanent("IMAGE_NOT_FOUND"));
    }

    #[test]
    fn trivy_error_is_transient() {
        assert!(!is_permanent("TRIVY_ERROR"));
    }
}
