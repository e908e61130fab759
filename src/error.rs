/// Unified error handling for the credential service.
///
/// Domain-specific error enums are kept separate (validation, auth,
/// token verification, storage, configuration) and converge into a
/// single `AppError` used for control flow and for HTTP response
/// mapping via actix's `ResponseError`.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use std::error::Error as StdError;
use std::fmt;

/// Input validation failures. Always mapped to 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyField(&'static str),
    TooShort(&'static str, usize),
    TooLong(&'static str, usize),
    InvalidFormat(&'static str),
    WeakPassword,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyField(field) => write!(f, "{} is empty", field),
            ValidationError::TooShort(field, min) => {
                write!(f, "{} is too short (minimum {} characters)", field, min)
            }
            ValidationError::TooLong(field, max) => {
                write!(f, "{} is too long (maximum {} characters)", field, max)
            }
            ValidationError::InvalidFormat(field) => write!(f, "{} has invalid format", field),
            ValidationError::WeakPassword => write!(
                f,
                "password must be 8-128 characters with at least one digit, one lowercase letter, and one uppercase letter"
            ),
        }
    }
}

impl StdError for ValidationError {}

/// Failures of the four public credential operations.
///
/// `InvalidCredentials` deliberately covers bad passwords, unknown
/// emails, and bad/expired/revoked refresh tokens alike so that the
/// response never reveals which of those occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    DuplicateIdentity,
    InvalidCredentials,
    /// Refresh token unknown, revoked, or expired. Internal to the
    /// refresh-token manager; collapsed to `InvalidCredentials` at the
    /// service boundary.
    InvalidToken,
    MissingToken,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::DuplicateIdentity => write!(f, "identity with this email already exists"),
            AuthError::InvalidCredentials => write!(f, "invalid credentials"),
            AuthError::InvalidToken => write!(f, "invalid refresh token"),
            AuthError::MissingToken => write!(f, "missing authentication token"),
        }
    }
}

impl StdError for AuthError {}

/// Access-token verification failures.
///
/// Consumed by the request-authenticating middleware, never by the
/// credential operations themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    InvalidSignature,
    /// The supplied instant is outside the token's `[nbf, exp]` window.
    Expired,
    /// Issuer or audience does not match this deployment.
    AudienceMismatch,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::InvalidSignature => write!(f, "token signature is invalid"),
            VerifyError::Expired => write!(f, "token is outside its validity window"),
            VerifyError::AudienceMismatch => write!(f, "token issuer or audience mismatch"),
        }
    }
}

impl StdError for VerifyError {}

/// Token-store and identity-provider storage failures.
///
/// Surfaced unchanged to the caller as a transient-failure kind; the
/// core never swallows or retries them.
#[derive(Debug)]
pub enum StoreError {
    UniqueViolation(String),
    NotFound(String),
    Query(String),
    Pool(String),
    Unexpected(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UniqueViolation(msg) => write!(f, "duplicate entry: {}", msg),
            StoreError::NotFound(msg) => write!(f, "not found: {}", msg),
            StoreError::Query(msg) => write!(f, "query error: {}", msg),
            StoreError::Pool(msg) => write!(f, "storage connection error: {}", msg),
            StoreError::Unexpected(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl StdError for StoreError {}

/// Fatal startup-time configuration problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MisconfiguredSigningKey,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MisconfiguredSigningKey => {
                write!(f, "signing key is missing or empty")
            }
        }
    }
}

impl StdError for ConfigError {}

/// Central error type all operations return.
#[derive(Debug)]
pub enum AppError {
    Validation(ValidationError),
    Auth(AuthError),
    Verify(VerifyError),
    Store(StoreError),
    Config(ConfigError),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(e) => write!(f, "{}", e),
            AppError::Auth(e) => write!(f, "{}", e),
            AppError::Verify(e) => write!(f, "{}", e),
            AppError::Store(e) => write!(f, "{}", e),
            AppError::Config(e) => write!(f, "{}", e),
            AppError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl StdError for AppError {}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err)
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<VerifyError> for AppError {
    fn from(err: VerifyError) -> Self {
        AppError::Verify(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// True when the error is a Postgres unique-constraint violation
/// (SQLSTATE 23505). Token generation treats this as fatal-retry.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            return StoreError::UniqueViolation(err.to_string());
        }
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("record not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Pool(err.to_string())
            }
            sqlx::Error::Database(db) => StoreError::Query(db.to_string()),
            other => StoreError::Unexpected(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Store(err.into())
    }
}

/// Structured HTTP error body.
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error_id: String,
    pub message: String,
    pub code: String,
    pub status: u16,
    pub timestamp: String,
}

impl AppError {
    /// Client-facing (status, code, message) triple.
    ///
    /// Authentication failures collapse to a single message so the
    /// response cannot be used as an oracle for which check failed.
    fn response_parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(e) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),
            AppError::Auth(AuthError::DuplicateIdentity) => (
                StatusCode::CONFLICT,
                "DUPLICATE_IDENTITY",
                "An account with this email already exists".to_string(),
            ),
            AppError::Auth(AuthError::MissingToken) => (
                StatusCode::UNAUTHORIZED,
                "MISSING_TOKEN",
                "Missing authentication token".to_string(),
            ),
            AppError::Auth(_) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                "Invalid credentials".to_string(),
            ),
            AppError::Verify(_) => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_INVALID",
                "Invalid or expired token".to_string(),
            ),
            AppError::Store(StoreError::Pool(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Storage temporarily unavailable".to_string(),
            ),
            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                "Storage error occurred".to_string(),
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                "Server configuration error".to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }

    fn log(&self, error_id: &str) {
        match self {
            AppError::Validation(e) => {
                tracing::warn!(error_id = error_id, error = %e, "Validation error");
            }
            AppError::Auth(e) => {
                tracing::warn!(error_id = error_id, error = %e, "Authentication failure");
            }
            AppError::Verify(e) => {
                tracing::warn!(error_id = error_id, error = %e, "Token verification failure");
            }
            AppError::Store(e) => {
                tracing::error!(error_id = error_id, error = %e, "Storage error");
            }
            AppError::Config(e) => {
                tracing::error!(error_id = error_id, error = %e, "Configuration error");
            }
            AppError::Internal(msg) => {
                tracing::error!(error_id = error_id, error = %msg, "Internal error");
            }
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let error_id = uuid::Uuid::new_v4().to_string();
        self.log(&error_id);

        let (status, code, message) = self.response_parts();
        HttpResponse::build(status).json(ErrorResponse {
            error_id,
            message,
            code: code.to_string(),
            status: status.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    fn status_code(&self) -> StatusCode {
        self.response_parts().0
    }
}
