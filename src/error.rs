//! Error types for the storage engine.
//!
//! All failures surfaced to callers are `StoreError` values. Raw driver errors are
//! converted on the way out, so callers see either success, a cancellation error,
//! or one enriched error carrying a stable [`ErrorCode`].

use std::fmt;
use thiserror::Error;

/// SQLSTATE for `serialization_failure`.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for `deadlock_detected`.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for `undefined_table`.
pub const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE for `undefined_column`.
pub const SQLSTATE_UNDEFINED_COLUMN: &str = "42703";

/// Stable error codes attached to every error returned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DbOperationFailure,
    NotFound,
    Canceled,
    BadConfig,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DbOperationFailure => "DB_OPERATION_FAILURE",
            Self::NotFound => "NOT_FOUND",
            Self::Canceled => "CANCELED",
            Self::BadConfig => "BAD_CONFIG",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry classification of a failed transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Serialization failure or deadlock; the whole transaction is retried.
    Transient,
    /// Not-found the caller declared as expected; counted as a pass.
    ExpectedAbsence,
    /// Anything else; wrapped and returned without retry.
    Fatal,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "40001" for serialization failure
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Cancelled: {operation} - {message}")]
    Cancelled { operation: String, message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("{code}: transaction '{name}' failed{}: {source}", format_tags(.tags))]
    Transaction {
        code: ErrorCode,
        name: String,
        tags: Vec<(String, String)>,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    pub fn metrics(message: impl Into<String>) -> Self {
        Self::Metrics {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap a failed transaction with its stable code, operation name and caller tags.
    pub fn transaction(
        code: ErrorCode,
        name: impl Into<String>,
        tags: Vec<(String, String)>,
        source: StoreError,
    ) -> Self {
        Self::Transaction {
            code,
            name: name.into(),
            tags,
            source: Box::new(source),
        }
    }

    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection { .. } => ErrorCode::Unavailable,
            Self::Database { .. } | Self::Migration { .. } => ErrorCode::DbOperationFailure,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Config { .. } => ErrorCode::BadConfig,
            Self::Cancelled { .. } => ErrorCode::Canceled,
            Self::Metrics { .. } | Self::Internal { .. } => ErrorCode::Internal,
            Self::Transaction { code, .. } => *code,
        }
    }

    /// SQLSTATE of the underlying database error, looking through transaction wrappers.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            Self::Transaction { source, .. } => source.sql_state(),
            _ => None,
        }
    }

    /// The innermost error, skipping transaction wrappers.
    pub fn root(&self) -> &StoreError {
        match self {
            Self::Transaction { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// True for serialization failures and deadlocks.
    pub fn is_transient_conflict(&self) -> bool {
        matches!(
            self.sql_state(),
            Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED)
        )
    }

    /// True when the root cause is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }
}

/// Narrow an error into its retry class.
///
/// `expect_not_found` is the per-call opt-in that downgrades not-found errors.
pub fn classify(err: &StoreError, expect_not_found: bool) -> ErrorClass {
    if err.is_transient_conflict() {
        ErrorClass::Transient
    } else if expect_not_found && err.is_not_found() {
        ErrorClass::ExpectedAbsence
    } else {
        ErrorClass::Fatal
    }
}

fn format_tags(tags: &[(String, String)]) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(" [{}]", joined.join(", "))
}

/// Convert sqlx errors to StoreError.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => StoreError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                StoreError::database(
                    db_err.message(),
                    code,
                    "Check the SQL statement and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => StoreError::not_found("No rows returned"),
            sqlx::Error::PoolTimedOut => StoreError::connection(
                "Timed out acquiring a pooled connection",
                "Increase max_connections or acquire_timeout",
            ),
            sqlx::Error::PoolClosed => {
                StoreError::connection("Connection pool is closed", "The store was shut down")
            }
            sqlx::Error::Io(io_err) => StoreError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => StoreError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => StoreError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                StoreError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                StoreError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                StoreError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::Migrate(err) => StoreError::migration(err.to_string()),
            sqlx::Error::WorkerCrashed => StoreError::internal("Database worker crashed"),
            _ => StoreError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        match err {
            sqlx::migrate::MigrateError::Execute(inner) => StoreError::from(inner),
            other => StoreError::migration(other.to_string()),
        }
    }
}

impl From<prometheus::Error> for StoreError {
    fn from(err: prometheus::Error) -> Self {
        StoreError::metrics(err.to_string())
    }
}

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
