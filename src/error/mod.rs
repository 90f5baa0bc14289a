//! Error types for the database gateway.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Document filter, pipeline or write payload violated the document policy.
    #[error("Query rejected: {0}")]
    QueryRejected(SanitizationError),

    /// SQL text or parameters violated the statement policy.
    #[error("SQL injection blocked: {0}")]
    SqlInjection(SanitizationError),

    #[error("Rate limit exceeded for '{route}', retry after {retry_after_ms}ms")]
    RateLimited {
        route: String,
        reset_at: DateTime<Utc>,
        retry_after_ms: u64,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Operation '{operation}' is not supported by {backend} connections")]
    UnsupportedOperation {
        operation: &'static str,
        backend: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Stable machine-readable code for responses and audit logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(e) if e.is_not_found() => "not_found",
            Self::Database(e) if e.is_connection_error() => "connection_error",
            Self::Database(_) => "query_failed",
            Self::QueryRejected(_) => "query_rejected",
            Self::SqlInjection(_) => "sql_injection",
            Self::RateLimited { .. } => "rate_limited",
            Self::Config(_) => "config_error",
            Self::Protocol(_) => "protocol_error",
            Self::UnsupportedOperation { .. } => "unsupported_operation",
            Self::Io(_) => "io_error",
            Self::Json(_) => "invalid_json",
        }
    }

    /// The sanitizer rejection carried by this error, if any.
    pub fn rejection(&self) -> Option<&SanitizationError> {
        match self {
            Self::QueryRejected(e) | Self::SqlInjection(e) => Some(e),
            _ => None,
        }
    }
}

/// Connection, query and lookup failures against a backend.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Liveness probe failed: {0}")]
    ProbeFailed(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Connection '{0}' is closed")]
    Closed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Unsupported parameter type for column type {0}")]
    UnsupportedParamType(String),

    #[error("MongoDB error: {0}")]
    Mongo(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(String),
}

impl DatabaseError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Errors that indicate the pool itself is unusable, as opposed to a bad query.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ProbeFailed(_)
                | Self::Timeout(_)
                | Self::PoolExhausted
                | Self::Closed(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// What a sanitizer rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    DisallowedOperator,
    DisallowedStage,
    DepthExceeded,
    DangerousKeyword,
    DangerousPattern,
    StatementNotAllowed,
    ParamTypeInvalid,
    PlaceholderMismatch,
    LengthExceeded,
    MultipleStatements,
    TooManyParams,
    InvalidShape,
    EmptyFilter,
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DisallowedOperator => "disallowed operator",
            Self::DisallowedStage => "disallowed pipeline stage",
            Self::DepthExceeded => "maximum depth exceeded",
            Self::DangerousKeyword => "dangerous keyword",
            Self::DangerousPattern => "dangerous pattern",
            Self::StatementNotAllowed => "statement not allowed",
            Self::ParamTypeInvalid => "invalid parameter type",
            Self::PlaceholderMismatch => "placeholder count mismatch",
            Self::LengthExceeded => "payload too long",
            Self::MultipleStatements => "multiple statements",
            Self::TooManyParams => "too many parameters",
            Self::InvalidShape => "invalid payload shape",
            Self::EmptyFilter => "empty filter",
        };
        f.write_str(name)
    }
}

/// Sanitizer rejection: the kind, the offending token and a human readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {token} ({message})")]
pub struct SanitizationError {
    pub kind: RejectionKind,
    pub token: String,
    pub message: Cow<'static, str>,
}

impl SanitizationError {
    pub fn new(
        kind: RejectionKind,
        token: impl Into<String>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind,
            token: token.into(),
            message: message.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
}

/// Framing errors of the JSON-lines service.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: invalid JSON")]
    ParseError,

    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

/// Result type alias for GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for SanitizationError.
pub type SanitizeResult<T> = std::result::Result<T, SanitizationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let rejection = SanitizationError::new(RejectionKind::DisallowedOperator, "$where", "denied");
        assert_eq!(GatewayError::QueryRejected(rejection.clone()).code(), "query_rejected");
        assert_eq!(GatewayError::SqlInjection(rejection).code(), "sql_injection");
        assert_eq!(
            GatewayError::from(DatabaseError::not_found("connection", "c1")).code(),
            "not_found"
        );
        assert_eq!(
            GatewayError::from(DatabaseError::Timeout(5000)).code(),
            "connection_error"
        );
        assert_eq!(
            GatewayError::from(DatabaseError::QueryFailed("syntax".into())).code(),
            "query_failed"
        );
    }

    #[test]
    fn test_rejection_message_names_token() {
        let err = SanitizationError::new(
            RejectionKind::DisallowedOperator,
            "$where",
            "operator is denied",
        );
        let message = GatewayError::QueryRejected(err).to_string();
        assert!(message.contains("$where"));
        assert!(message.contains("disallowed operator"));
    }

    #[test]
    fn test_error_conversion() {
        let db_error = DatabaseError::ConnectionFailed("refused".into());
        let err: GatewayError = db_error.into();
        assert!(matches!(err, GatewayError::Database(_)));
        assert!(err.rejection().is_none());
    }
}
