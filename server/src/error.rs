//! Uniform error kinds.
//!
//! Every component returns the narrowest kind it can justify; the edges map
//! kinds to protocol codes (HTTP status, gRPC status, OTLP partial-success
//! counts). `Fatal` indicates a broken internal invariant: it is logged at
//! ERROR and surfaced to callers as a retryable 503 so an operator can
//! investigate without clients hard-failing.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client-side mistake: malformed OTLP, bad filter, unparseable regex,
    /// YAML syntax error. Non-retryable.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Trace/agent does not exist in scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// Deadline exceeded or client disconnected.
    #[error("request cancelled")]
    Cancelled,

    /// Transient: schema not ready, queue full, database unreachable.
    /// Retryable.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// Idempotency fingerprint matched an existing row with incompatible
    /// contents.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invariant broken internally.
    #[error("internal error: {0}")]
    Fatal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Stable machine-readable code for the JSON error body.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Cancelled => "cancelled",
            Self::Unavailable(_) => "unavailable",
            Self::Conflict(_) => "conflict",
            Self::Fatal(_) => "internal",
        }
    }

    /// Whether a caller may retry the identical request.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Cancelled)
    }

    const fn http_status(&self) -> StatusCode {
        match self {
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) | Self::Fatal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// gRPC mapping for the OTLP export services.
    pub fn to_status(&self) -> tonic::Status {
        match self {
            Self::Invalid(msg) => tonic::Status::invalid_argument(msg.clone()),
            Self::NotFound(msg) => tonic::Status::not_found(msg.clone()),
            Self::Cancelled => tonic::Status::deadline_exceeded("request cancelled"),
            Self::Conflict(msg) => tonic::Status::aborted(msg.clone()),
            Self::Unavailable(msg) => tonic::Status::unavailable(msg.clone()),
            // Fatal is surfaced as unavailable; the real cause stays in the
            // server log.
            Self::Fatal(_) => tonic::Status::unavailable("internal error"),
        }
    }
}

/// The Retryable/Fatal split for database errors. Connection-level and
/// pool-level failures are worth retrying; constraint violations reaching
/// this path indicate a programming error (expected conflicts are absorbed
/// by `ON CONFLICT DO NOTHING` in the store).
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(format!("database unavailable: {e}"))
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(format!("unique violation: {db}"))
            }
            _ => Self::Fatal(format!("database error: {e}")),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        if let Self::Fatal(msg) = &self {
            tracing::error!(error = %msg, "Internal invariant violated");
        }
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (self.http_status(), Json(body)).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::invalid("x").code(), "invalid_argument");
        assert_eq!(Error::not_found("x").code(), "not_found");
        assert_eq!(Error::Cancelled.code(), "cancelled");
        assert_eq!(Error::unavailable("x").code(), "unavailable");
        assert_eq!(Error::conflict("x").code(), "conflict");
        assert_eq!(Error::fatal("x").code(), "internal");
    }

    #[test]
    fn retryable_split() {
        assert!(Error::unavailable("x").is_retryable());
        assert!(Error::Cancelled.is_retryable());
        assert!(!Error::invalid("x").is_retryable());
        assert!(!Error::fatal("x").is_retryable());
    }

    #[test]
    fn fatal_is_surfaced_as_unavailable() {
        assert_eq!(Error::fatal("broken").http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::fatal("broken").to_status().code(),
            tonic::Code::Unavailable
        );
    }

    #[test]
    fn pool_timeout_maps_to_unavailable() {
        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
