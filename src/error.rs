//! Error types for the resilience core
//!
//! This module provides the error taxonomy consumed by every recovery
//! mechanism: structured error codes, categories, severities and the
//! retryability rules that drive retries, circuit breaking and dead-lettering.

use crate::error_recovery::circuit_breaker::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Comprehensive error types for wrapped operations and the recovery machinery
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// Lost database connection
    #[error("Database connection lost: {0}")]
    DatabaseConnectionLost(String),

    /// External service errors
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Invalid input errors
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Permission denied errors
    #[error("Permission denied: {0}")]
    Authorization(String),

    /// Business rule violations
    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Retry handler configured so that it can never run an operation
    #[error("Invalid retry configuration: {0}")]
    InvalidRetryConfig(String),

    /// Circuit breaker rejected the call without invoking the operation
    #[error("Service unavailable: circuit '{circuit}' is {state} after {failure_count} failures")]
    CircuitOpen {
        circuit: String,
        state: CircuitState,
        failure_count: u32,
        next_attempt: Option<DateTime<Utc>>,
    },

    /// Persistence layer errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Fully structured error raised by a wrapped operation
    #[error("{0}")]
    Application(Box<ApplicationError>),

    /// HTTP client errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Structured error code for machine-readable error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Network errors (1000-1099)
    NetworkError,
    ConnectionTimeout,
    ConnectionRefused,

    // Database errors (1100-1199)
    DatabaseError,
    DatabaseConnectionLost,

    // External service errors (1200-1299)
    ExternalServiceError,
    ExternalServiceTimeout,
    ServiceUnavailable,

    // Resource errors (1300-1399)
    RateLimitExceeded,

    // Validation and access errors (1400-1499)
    ValidationFailed,
    AuthenticationFailed,
    AuthorizationFailed,
    NotFound,

    // Business errors (1500-1599)
    BusinessRuleViolation,

    // Configuration errors (1600-1699)
    ConfigurationInvalid,

    // Infrastructure errors (1700-1799)
    CircuitBreakerOpen,
    StorageFailure,

    // Internal errors (1900-1999)
    InternalError,
    SerializationFailed,
}

impl ErrorCode {
    /// Get numeric error code
    pub fn as_number(&self) -> u32 {
        match self {
            ErrorCode::NetworkError => 1001,
            ErrorCode::ConnectionTimeout => 1002,
            ErrorCode::ConnectionRefused => 1003,

            ErrorCode::DatabaseError => 1101,
            ErrorCode::DatabaseConnectionLost => 1102,

            ErrorCode::ExternalServiceError => 1201,
            ErrorCode::ExternalServiceTimeout => 1202,
            ErrorCode::ServiceUnavailable => 1203,

            ErrorCode::RateLimitExceeded => 1301,

            ErrorCode::ValidationFailed => 1401,
            ErrorCode::AuthenticationFailed => 1402,
            ErrorCode::AuthorizationFailed => 1403,
            ErrorCode::NotFound => 1404,

            ErrorCode::BusinessRuleViolation => 1501,

            ErrorCode::ConfigurationInvalid => 1601,

            ErrorCode::CircuitBreakerOpen => 1701,
            ErrorCode::StorageFailure => 1702,

            ErrorCode::InternalError => 1901,
            ErrorCode::SerializationFailed => 1902,
        }
    }

    /// Stable string form, used for persisted `failure_reason` columns
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::DatabaseConnectionLost => "DATABASE_CONNECTION_LOST",
            ErrorCode::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            ErrorCode::ExternalServiceTimeout => "EXTERNAL_SERVICE_TIMEOUT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::AuthorizationFailed => "AUTHORIZATION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BusinessRuleViolation => "BUSINESS_RULE_VIOLATION",
            ErrorCode::ConfigurationInvalid => "CONFIGURATION_INVALID",
            ErrorCode::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            ErrorCode::StorageFailure => "STORAGE_FAILURE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::SerializationFailed => "SERIALIZATION_FAILED",
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::NetworkError | ErrorCode::ConnectionTimeout | ErrorCode::ConnectionRefused => {
                ErrorCategory::Network
            }
            ErrorCode::DatabaseError | ErrorCode::DatabaseConnectionLost => ErrorCategory::Database,
            ErrorCode::ExternalServiceError
            | ErrorCode::ExternalServiceTimeout
            | ErrorCode::ServiceUnavailable => ErrorCategory::ExternalService,
            ErrorCode::RateLimitExceeded => ErrorCategory::RateLimit,
            ErrorCode::ValidationFailed => ErrorCategory::Validation,
            ErrorCode::AuthenticationFailed => ErrorCategory::Authentication,
            ErrorCode::AuthorizationFailed => ErrorCategory::Authorization,
            ErrorCode::NotFound | ErrorCode::BusinessRuleViolation => ErrorCategory::BusinessLogic,
            ErrorCode::ConfigurationInvalid => ErrorCategory::Configuration,
            ErrorCode::CircuitBreakerOpen | ErrorCode::StorageFailure => {
                ErrorCategory::Infrastructure
            }
            ErrorCode::InternalError | ErrorCode::SerializationFailed => ErrorCategory::Internal,
        }
    }

    /// Whether errors with this code are transient by default
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::ConnectionTimeout
                | ErrorCode::ConnectionRefused
                | ErrorCode::DatabaseConnectionLost
                | ErrorCode::ExternalServiceError
                | ErrorCode::ExternalServiceTimeout
                | ErrorCode::ServiceUnavailable
                | ErrorCode::RateLimitExceeded
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error category used by retry allow-lists and strategy matching
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Database,
    ExternalService,
    RateLimit,
    Validation,
    Authentication,
    Authorization,
    BusinessLogic,
    Configuration,
    Infrastructure,
    Internal,
}

impl ErrorCategory {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::ExternalService => "external_service",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::BusinessLogic => "business_logic",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Low severity - information only
    Info,
    /// Medium severity - warning condition
    Warning,
    /// High severity - error condition
    Error,
    /// Critical severity - immediate attention required
    Critical,
}

/// Structured error raised by application code wrapped in the recovery path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationError {
    pub message: String,
    pub code: ErrorCode,
    pub category: Option<ErrorCategory>,
    pub severity: Option<ErrorSeverity>,
    /// Explicit retryability; overrides the per-code default when set
    pub retryable: Option<bool>,
    pub status_code: Option<u16>,
}

impl ApplicationError {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            message: message.into(),
            code,
            category: None,
            severity: None,
            retryable: None,
            status_code: None,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

impl std::fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<ApplicationError> for ResilienceError {
    fn from(err: ApplicationError) -> Self {
        ResilienceError::Application(Box::new(err))
    }
}

/// Structured error context with additional metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Component that generated the error
    pub component: String,
    /// Operation that was being performed
    pub operation: String,
    /// Additional metadata about the error
    pub metadata: HashMap<String, serde_json::Value>,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Request ID for correlation
    pub correlation_id: Option<String>,
}

impl ErrorContext {
    /// Create new error context
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Add metadata to error context
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set correlation ID for request tracking
    pub fn with_correlation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Enhanced error representation for logging and persistence
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub code_number: u32,
    pub category: ErrorCategory,
    pub message: String,
    pub is_retryable: bool,
    pub status_code: Option<u16>,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl ResilienceError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a database error
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a lost-connection database error
    pub fn database_connection_lost<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseConnectionLost(msg.into())
    }

    /// Create an external service error
    pub fn external_service<S: Into<String>>(msg: S) -> Self {
        Self::ExternalService(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(msg: S) -> Self {
        Self::RateLimit(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a business rule error
    pub fn business_rule<S: Into<String>>(msg: S) -> Self {
        Self::BusinessRule(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Map the error to its structured error code
    pub fn code(&self) -> ErrorCode {
        match self {
            ResilienceError::Connection(_) => ErrorCode::ConnectionRefused,
            ResilienceError::Network(_) => ErrorCode::NetworkError,
            ResilienceError::Timeout(_) => ErrorCode::ConnectionTimeout,
            ResilienceError::Database(_) => ErrorCode::DatabaseError,
            ResilienceError::DatabaseConnectionLost(_) => ErrorCode::DatabaseConnectionLost,
            ResilienceError::ExternalService(_) => ErrorCode::ExternalServiceError,
            ResilienceError::RateLimit(_) => ErrorCode::RateLimitExceeded,
            ResilienceError::Validation(_) => ErrorCode::ValidationFailed,
            ResilienceError::Authentication(_) => ErrorCode::AuthenticationFailed,
            ResilienceError::Authorization(_) => ErrorCode::AuthorizationFailed,
            ResilienceError::BusinessRule(_) => ErrorCode::BusinessRuleViolation,
            ResilienceError::NotFound(_) => ErrorCode::NotFound,
            ResilienceError::Config(_) | ResilienceError::InvalidRetryConfig(_) => {
                ErrorCode::ConfigurationInvalid
            }
            ResilienceError::CircuitOpen { .. } => ErrorCode::CircuitBreakerOpen,
            ResilienceError::Storage(_) => ErrorCode::StorageFailure,
            ResilienceError::Application(app) => app.code,
            ResilienceError::Http(err) => {
                if err.is_timeout() {
                    ErrorCode::ExternalServiceTimeout
                } else if err.is_connect() {
                    ErrorCode::ConnectionRefused
                } else {
                    ErrorCode::ExternalServiceError
                }
            }
            ResilienceError::Json(_) => ErrorCode::SerializationFailed,
            ResilienceError::Io(_) | ResilienceError::Generic(_) => ErrorCode::InternalError,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ResilienceError::Application(app) => app.category.unwrap_or_else(|| app.code.category()),
            _ => self.code().category(),
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ResilienceError::Application(app) => app.severity.unwrap_or(ErrorSeverity::Error),
            ResilienceError::Authentication(_) | ResilienceError::Authorization(_) => {
                ErrorSeverity::Critical
            }
            ResilienceError::Config(_) | ResilienceError::InvalidRetryConfig(_) => {
                ErrorSeverity::Critical
            }
            ResilienceError::Connection(_)
            | ResilienceError::Network(_)
            | ResilienceError::Timeout(_)
            | ResilienceError::RateLimit(_)
            | ResilienceError::CircuitOpen { .. } => ErrorSeverity::Warning,
            ResilienceError::Validation(_)
            | ResilienceError::NotFound(_)
            | ResilienceError::BusinessRule(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// Check if error is retryable
    ///
    /// Structured application errors carrying an explicit flag use it; all
    /// other errors fall back to the transient codes. A circuit-open rejection
    /// is never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::Application(app) => {
                app.retryable.unwrap_or_else(|| app.code.is_transient())
            }
            ResilienceError::CircuitOpen { .. } => false,
            ResilienceError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => self.code().is_transient(),
        }
    }

    /// HTTP status code associated with the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ResilienceError::Application(app) => app.status_code,
            ResilienceError::Http(err) => err.status().map(|s| s.as_u16()),
            ResilienceError::CircuitOpen { .. } => Some(503),
            ResilienceError::RateLimit(_) => Some(429),
            ResilienceError::Validation(_) => Some(400),
            ResilienceError::Authentication(_) => Some(401),
            ResilienceError::Authorization(_) => Some(403),
            ResilienceError::NotFound(_) => Some(404),
            ResilienceError::BusinessRule(_) => Some(422),
            ResilienceError::Timeout(_) => Some(504),
            _ => None,
        }
    }

    /// Whether the call was rejected by an open circuit without being attempted
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Create a structured error from this error
    pub fn to_structured_error(&self, context: Option<ErrorContext>) -> StructuredError {
        let code = self.code();
        let context = context.unwrap_or_else(|| ErrorContext::new("unknown", "unknown"));

        StructuredError {
            code,
            code_number: code.as_number(),
            category: self.category(),
            message: self.to_string(),
            is_retryable: self.is_retryable(),
            status_code: self.status_code(),
            severity: self.severity(),
            component: context.component,
            operation: context.operation,
            metadata: context.metadata,
            timestamp: context.timestamp,
            correlation_id: context.correlation_id,
        }
    }
}

/// Error logging utilities
pub struct ErrorReporter;

impl ErrorReporter {
    /// Log a structured error with appropriate severity
    pub fn log_error(error: &ResilienceError, context: Option<ErrorContext>) {
        let structured = error.to_structured_error(context);
        let category = structured.category.as_str();

        match structured.severity {
            ErrorSeverity::Critical | ErrorSeverity::Error => {
                tracing::error!(
                    error_code = structured.code_number,
                    category,
                    retryable = structured.is_retryable,
                    component = %structured.component,
                    operation = %structured.operation,
                    correlation_id = ?structured.correlation_id,
                    "Operation failed: {}",
                    structured.message
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error_code = structured.code_number,
                    category,
                    retryable = structured.is_retryable,
                    component = %structured.component,
                    operation = %structured.operation,
                    correlation_id = ?structured.correlation_id,
                    "Operation failed: {}",
                    structured.message
                );
            }
            ErrorSeverity::Info => {
                tracing::info!(
                    error_code = structured.code_number,
                    category,
                    component = %structured.component,
                    operation = %structured.operation,
                    correlation_id = ?structured.correlation_id,
                    "Operation rejected: {}",
                    structured.message
                );
            }
        }
    }

    /// Metadata map describing the error, stored alongside dead-lettered jobs
    pub fn error_metadata(error: &ResilienceError) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(
            "error_code".to_string(),
            serde_json::Value::String(error.code().as_str().to_string()),
        );
        map.insert(
            "error_category".to_string(),
            serde_json::Value::String(error.category().as_str().to_string()),
        );
        map.insert(
            "error_severity".to_string(),
            serde_json::to_value(error.severity()).unwrap_or(serde_json::Value::Null),
        );
        map.insert(
            "retryable".to_string(),
            serde_json::Value::Bool(error.is_retryable()),
        );
        map.insert(
            "status_code".to_string(),
            error
                .status_code()
                .map(|s| serde_json::Value::Number(s.into()))
                .unwrap_or(serde_json::Value::Null),
        );
        map
    }
}

impl From<config::ConfigError> for ResilienceError {
    fn from(err: config::ConfigError) -> Self {
        ResilienceError::Config(err.to_string())
    }
}

#[cfg(feature = "turso")]
impl From<libsql::Error> for ResilienceError {
    fn from(err: libsql::Error) -> Self {
        ResilienceError::Storage(err.to_string())
    }
}
