//! # Storage Errors
//!
//! What can go wrong below the engine, sorted by whether a retry can help.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← categorized: constraint / conflict / other    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  EngineError::Storage ← retried by order assembly if transient         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// SQLite primary result codes that mean "another writer holds the lock".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Failure of a repository call or transaction.
#[derive(Debug, Error)]
pub enum DbError {
    /// Row addressed by id does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation (duplicate SKU, duplicate offer code).
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// CHECK constraint violation.
    ///
    /// ## When This Occurs
    /// - A write would make `quantity` or `reserved_quantity` negative
    /// - A write would make `reserved_quantity` exceed `quantity`
    ///
    /// The planners reject these first; reaching the database means a bug.
    #[error("Check constraint violation: {message}")]
    CheckViolation { message: String },

    /// Could not open or reach the database.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Another transaction holds the rows (SQLite busy/locked), or a
    /// claimed row changed underneath us. Safe to retry.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Transaction did not finish within its deadline and was rolled back.
    #[error("Transaction timed out after {timeout_ms}ms")]
    TransactionTimeout { timeout_ms: u64 },

    /// Stored JSON could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// No pooled connection freed up within the acquire timeout.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        DbError::TransactionConflict(message.into())
    }

    /// True if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::TransactionConflict(_)
                | DbError::TransactionTimeout { .. }
                | DbError::PoolExhausted
        )
    }
}

/// True when a SQLite result code (primary or extended) is BUSY or LOCKED.
fn is_lock_code(code: &str) -> bool {
    code.parse::<i32>()
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

/// Sorts sqlx errors by cause.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → busy/locked → TransactionConflict
///                               constraint  → Unique/ForeignKey/Check
///                               otherwise   → QueryFailed
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                let locked = db_err.code().is_some_and(|code| is_lock_code(&code))
                    || msg.contains("database is locked")
                    || msg.contains("database table is locked");

                if locked {
                    DbError::TransactionConflict(msg.to_string())
                } else if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else if msg.contains("CHECK constraint failed") {
                    DbError::CheckViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;
