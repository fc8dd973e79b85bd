/// Error Handling Module
///
/// Unified error handling for the session service.
/// It covers:
/// 1. Domain-Specific Error Types (validation, repository, collaborators, auth)
/// 2. The unified `AppError` used for control flow
/// 3. HTTP response mapping with stable reason codes
/// 4. Structured error logging by severity

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use std::error::Error as StdError;
use std::fmt;

/// ============================================================================
/// 1. DOMAIN-SPECIFIC ERROR TYPES
/// ============================================================================

/// Validation errors for input data
#[derive(Debug, Clone)]
pub enum ValidationError {
    EmptyField(String),
    TooShort(String, usize),
    TooLong(String, usize),
    InvalidFormat(String),
    SuspiciousContent(String),
    PossibleSQLInjection,
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
            ValidationError::SuspiciousContent(field) => {
                write!(f, "{} contains suspicious content", field)
            }
            ValidationError::PossibleSQLInjection => {
                write!(f, "input contains potentially dangerous SQL patterns")
            }
        }
    }
}

impl StdError for ValidationError {}

/// Errors raised by the session store, the purpose token store and the user repository
#[derive(Debug, Clone)]
pub enum RepositoryError {
    /// The keyed record does not exist (or has expired)
    NotFound(String),
    /// Unique key collision or an optimistic-lock (watch) failure
    Conflict(String),
    QueryExecution(String),
    ConnectionPool(String),
    UnexpectedError(String),
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryError::NotFound(msg) => write!(f, "Not found: {}", msg),
            RepositoryError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            RepositoryError::QueryExecution(msg) => write!(f, "Query error: {}", msg),
            RepositoryError::ConnectionPool(msg) => write!(f, "Storage connection error: {}", msg),
            RepositoryError::UnexpectedError(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl StdError for RepositoryError {}

/// Collaborator (role / mail / user service) call errors
///
/// The first field of every variant names the collaborator.
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Short-circuited by an open breaker
    ServiceUnavailable(String),
    /// Connection refused, reset, DNS failure and friends
    Transport(String, String),
    Timeout(String),
    /// Well-formed error response from the collaborator: (service, status, body)
    Rejected(String, u16, String),
    /// The collaborator answered but the payload could not be decoded
    Decode(String, String),
}

impl ExternalError {
    pub fn service(&self) -> &str {
        match self {
            ExternalError::ServiceUnavailable(service)
            | ExternalError::Transport(service, _)
            | ExternalError::Timeout(service)
            | ExternalError::Rejected(service, _, _)
            | ExternalError::Decode(service, _) => service,
        }
    }

    /// Only infrastructure failures count against a circuit breaker.
    /// Application-level answers (4xx) mean the dependency is healthy.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            ExternalError::Transport(_, _) | ExternalError::Timeout(_) => true,
            ExternalError::Rejected(_, status, _) => *status >= 500,
            ExternalError::ServiceUnavailable(_) | ExternalError::Decode(_, _) => false,
        }
    }

    pub(crate) fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExternalError::Timeout(service.to_string())
        } else if err.is_decode() {
            ExternalError::Decode(service.to_string(), err.to_string())
        } else if let Some(status) = err.status() {
            ExternalError::Rejected(service.to_string(), status.as_u16(), err.to_string())
        } else {
            ExternalError::Transport(service.to_string(), err.to_string())
        }
    }
}

impl fmt::Display for ExternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalError::ServiceUnavailable(service) => {
                write!(f, "{} is unavailable (circuit open)", service)
            }
            ExternalError::Transport(service, msg) => {
                write!(f, "{} transport failure: {}", service, msg)
            }
            ExternalError::Timeout(service) => write!(f, "{} call timed out", service),
            ExternalError::Rejected(service, status, msg) => {
                write!(f, "{} rejected the call ({}): {}", service, status, msg)
            }
            ExternalError::Decode(service, msg) => {
                write!(f, "{} returned an unreadable payload: {}", service, msg)
            }
        }
    }
}

impl StdError for ExternalError {}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    MissingRequired(String),
    InvalidValue(String),
    ParseError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingRequired(msg) => write!(f, "Missing required config: {}", msg),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config value: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "Config parse error: {}", msg),
        }
    }
}

impl StdError for ConfigError {}

/// Authentication, token and permission errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No or invalid caller identity
    Unauthenticated,
    /// Authenticated but lacking the required permission or binding
    Unauthorized,
    InvalidCredentials,
    AccountBanned,
    /// Token type other than "bearer"
    DifferentScheme,
    MalformedToken,
    RefreshTokenNotFound,
    /// Access token is not the one currently bound to its session
    BadRelation,
    /// The session outlived its owner
    TokenBelongToNothing,
    TokenNotFound,
    TokenDifferentUsage,
    TokenExpired,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated => "UNAUTHENTICATED",
            AuthError::Unauthorized => "UNAUTHORIZED",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::AccountBanned => "ACCOUNT_BANNED",
            AuthError::DifferentScheme => "DIFFERENT_SCHEME",
            AuthError::MalformedToken => "MALFORMED_TOKEN",
            AuthError::RefreshTokenNotFound => "REFRESH_TOKEN_NOT_FOUND",
            AuthError::BadRelation => "BAD_RELATION",
            AuthError::TokenBelongToNothing => "TOKEN_BELONG_TO_NOTHING",
            AuthError::TokenNotFound => "TOKEN_NOT_FOUND",
            AuthError::TokenDifferentUsage => "TOKEN_DIFFERENT_USAGE",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Unauthenticated => write!(f, "Missing or invalid caller identity"),
            AuthError::Unauthorized => write!(f, "Caller is not allowed to perform this action"),
            AuthError::InvalidCredentials => write!(f, "Invalid email or password"),
            AuthError::AccountBanned => write!(f, "Account is banned"),
            AuthError::DifferentScheme => write!(f, "Unsupported token type"),
            AuthError::MalformedToken => write!(f, "Malformed token"),
            AuthError::RefreshTokenNotFound => write!(f, "Session not found"),
            AuthError::BadRelation => write!(f, "Access token is not bound to this session"),
            AuthError::TokenBelongToNothing => write!(f, "Token owner no longer exists"),
            AuthError::TokenNotFound => write!(f, "Token not found"),
            AuthError::TokenDifferentUsage => write!(f, "Token was issued for a different usage"),
            AuthError::TokenExpired => write!(f, "Token has expired"),
        }
    }
}

impl StdError for AuthError {}

/// ============================================================================
/// 2. UNIFIED APPLICATION ERROR TYPE
/// ============================================================================

/// Central error type that all application errors map to
#[derive(Debug)]
pub enum AppError {
    Validation(ValidationError),
    Repository(RepositoryError),
    External(ExternalError),
    Auth(AuthError),
    Config(ConfigError),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(e) => write!(f, "{}", e),
            AppError::Repository(e) => write!(f, "{}", e),
            AppError::External(e) => write!(f, "{}", e),
            AppError::Auth(e) => write!(f, "{}", e),
            AppError::Config(e) => write!(f, "{}", e),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StdError for AppError {}

// ============================================================================
// FROM IMPLEMENTATIONS (Control Flow Error Conversion)
// ============================================================================

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err)
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        AppError::Repository(err)
    }
}

impl From<ExternalError> for AppError {
    fn from(err: ExternalError) -> Self {
        AppError::External(err)
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                RepositoryError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                RepositoryError::ConnectionPool(err.to_string())
            }
            sqlx::Error::Database(_) => RepositoryError::QueryExecution(err.to_string()),
            _ => RepositoryError::UnexpectedError(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Repository(err.into())
    }
}

// ============================================================================
// 3. HTTP RESPONSE MAPPING
// ============================================================================

/// Error response structure for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Human-readable error message
    pub message: String,
    /// Stable reason code for client-side handling
    pub code: String,
    pub status: u16,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_id: String, message: String, code: String, status: u16) -> Self {
        Self {
            error_id,
            message,
            code,
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Trait for converting errors to HTTP responses with proper logging
pub trait ErrorHandler {
    fn error_response(&self, request_id: &str) -> (StatusCode, ErrorResponse);
    fn log_error(&self, request_id: &str);
}

impl AppError {
    /// Status, reason code and client-facing message.
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(e) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),

            AppError::Repository(e) => match e {
                RepositoryError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()),
                RepositoryError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", e.to_string()),
                RepositoryError::ConnectionPool(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Storage temporarily unavailable".to_string(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "REPOSITORY_ERROR",
                    "Storage error occurred".to_string(),
                ),
            },

            AppError::External(e) => match e {
                ExternalError::ServiceUnavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    e.to_string(),
                ),
                _ => (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_ERROR",
                    format!("{} call failed", e.service()),
                ),
            },

            AppError::Auth(e) => {
                let status = match e {
                    AuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
                    AuthError::Unauthorized
                    | AuthError::BadRelation
                    | AuthError::TokenBelongToNothing => StatusCode::FORBIDDEN,
                    AuthError::RefreshTokenNotFound => StatusCode::NOT_FOUND,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, e.code(), e.to_string())
            }

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

    pub fn code(&self) -> &'static str {
        self.classify().1
    }
}

impl ErrorHandler for AppError {
    fn error_response(&self, request_id: &str) -> (StatusCode, ErrorResponse) {
        let (status, code, message) = self.classify();
        let error_response = ErrorResponse::new(
            request_id.to_string(),
            message,
            code.to_string(),
            status.as_u16(),
        );

        (status, error_response)
    }

    fn log_error(&self, request_id: &str) {
        match self {
            AppError::Validation(e) => {
                tracing::warn!(request_id = request_id, error = %e, "Validation error");
            }
            AppError::Repository(RepositoryError::Conflict(_)) => {
                tracing::warn!(request_id = request_id, error = %self, "Repository conflict");
            }
            AppError::Repository(RepositoryError::NotFound(_)) => {
                tracing::info!(request_id = request_id, error = %self, "Record not found");
            }
            AppError::Repository(e) => {
                tracing::error!(request_id = request_id, error = %e, "Repository error");
            }
            AppError::External(e) => {
                tracing::error!(
                    request_id = request_id,
                    service = e.service(),
                    error = %e,
                    "Collaborator call failed"
                );
            }
            AppError::Auth(e) => {
                tracing::warn!(
                    request_id = request_id,
                    code = e.code(),
                    error = %e,
                    "Authentication error"
                );
            }
            AppError::Config(e) => {
                tracing::error!(request_id = request_id, error = %e, "Configuration error");
            }
            AppError::Internal(msg) => {
                tracing::error!(request_id = request_id, error = %msg, "Internal error");
            }
        }
    }
}

/// Implement ResponseError for Actix-web integration
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.log_error(&request_id);

        let (status, error_response) = <Self as ErrorHandler>::error_response(self, &request_id);

        HttpResponse::build(status).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        self.classify().0
    }
}
