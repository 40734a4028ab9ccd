//! # Engine Error Types
//!
//! The error every public engine call returns.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EngineError                                      │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Domain         │  │   Storage       │  │     Engine              │ │
//! │  │  (CoreError)    │  │   (DbError)     │  │                         │ │
//! │  │                 │  │                 │  │  PersistenceFailure     │ │
//! │  │  OutOfStock     │  │  Conflict ◄─┐   │  │  InvalidConfig          │ │
//! │  │  Insufficient.. │  │  Timeout  ◄─┤   │  │  ConfigLoadFailed       │ │
//! │  │  InvalidOffer.. │  │  NotFound   │   │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────┼───┘  └─────────────────────────┘ │
//! │                                     │                                   │
//! │                      transient: retried by OrderAssembly, then         │
//! │                      reported as PersistenceFailure                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use std::fmt;
use tally_core::CoreError;
use tally_db::DbError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Wrapped Layers
    // =========================================================================
    /// A business rule refused the request.
    #[error(transparent)]
    Domain(#[from] CoreError),

    /// Storage failed.
    #[error(transparent)]
    Storage(#[from] DbError),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Transient storage failures outlasted the configured retries.
    #[error("Order could not be persisted after {attempts} attempts: {message}")]
    PersistenceFailure { attempts: u32, message: String },

    /// Invalid engine configuration.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read or parse the config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// A background worker is gone.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// Errors straight from a transaction handle (`commit`, `rollback`).
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(DbError::from(err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

/// Coarse classification for callers mapping errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Not enough stock, or an adjustment the ledger refuses.
    Stock,
    /// Offer code unknown or not applicable.
    Offer,
    /// Product or order does not exist.
    NotFound,
    /// Malformed request or an order in the wrong state.
    InvalidRequest,
    /// Concurrent writers kept colliding.
    Conflict,
    /// Anything the caller cannot fix.
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Stock => "stock",
            ErrorCategory::Offer => "offer",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::System => "system",
        };
        f.write_str(s)
    }
}

impl EngineError {
    /// True for storage failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Storage(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Domain(err) => match err {
                CoreError::OutOfStock { .. }
                | CoreError::InsufficientStock { .. }
                | CoreError::InvalidAdjustment { .. } => ErrorCategory::Stock,
                CoreError::InvalidOfferCode(_) | CoreError::OfferNotEligible { .. } => {
                    ErrorCategory::Offer
                }
                CoreError::ProductNotFound(_) | CoreError::OrderNotFound(_) => {
                    ErrorCategory::NotFound
                }
                CoreError::ProductInactive(_)
                | CoreError::InvalidOrderStatus { .. }
                | CoreError::Validation(_) => ErrorCategory::InvalidRequest,
            },
            EngineError::Storage(DbError::NotFound { .. }) => ErrorCategory::NotFound,
            EngineError::Storage(DbError::UniqueViolation { .. })
            | EngineError::Storage(DbError::CheckViolation { .. }) => {
                ErrorCategory::InvalidRequest
            }
            EngineError::Storage(err) if err.is_transient() => ErrorCategory::Conflict,
            EngineError::PersistenceFailure { .. } => ErrorCategory::Conflict,
            _ => ErrorCategory::System,
        }
    }

    /// True when the request itself was refused (stock, offer, shape), as
    /// opposed to the engine failing to process it.
    pub fn is_actionable(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::System | ErrorCategory::Conflict
        )
    }

    /// True for configuration problems.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidConfig(_) | EngineError::ConfigLoadFailed(_)
        )
    }

    /// The domain error, if this is one.
    pub fn as_domain(&self) -> Option<&CoreError> {
        match self {
            EngineError::Domain(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(EngineError::Storage(DbError::conflict("database is locked")).is_transient());
        assert!(EngineError::Storage(DbError::TransactionTimeout { timeout_ms: 500 }).is_transient());

        assert!(!EngineError::Storage(DbError::not_found("Order", "o-1")).is_transient());
        assert!(!EngineError::Domain(CoreError::ProductNotFound("p-1".into())).is_transient());
        assert!(!EngineError::PersistenceFailure {
            attempts: 3,
            message: "locked".into()
        }
        .is_transient());
    }

    #[test]
    fn test_categories() {
        let stock = EngineError::Domain(CoreError::InsufficientStock {
            product_id: "p-1".into(),
            available: 2,
            requested: 5,
            shortfalls: Vec::new(),
        });
        assert_eq!(stock.category(), ErrorCategory::Stock);
        assert!(stock.is_actionable());

        let offer = EngineError::Domain(CoreError::InvalidOfferCode("NOPE".into()));
        assert_eq!(offer.category(), ErrorCategory::Offer);

        let missing = EngineError::Storage(DbError::not_found("StockLedger", "p-9"));
        assert_eq!(missing.category(), ErrorCategory::NotFound);

        let exhausted = EngineError::PersistenceFailure {
            attempts: 3,
            message: "database is locked".into(),
        };
        assert_eq!(exhausted.category(), ErrorCategory::Conflict);
        assert!(!exhausted.is_actionable());

        let broken = EngineError::Storage(DbError::QueryFailed("disk I/O error".into()));
        assert_eq!(broken.category(), ErrorCategory::System);
        assert!(!broken.is_actionable());
    }

    #[test]
    fn test_domain_display_is_transparent() {
        let err = EngineError::from(CoreError::ProductInactive("p-1".into()));
        assert_eq!(err.to_string(), "Product is inactive: p-1");
        assert!(err.as_domain().is_some());
    }

    #[test]
    fn test_config_errors() {
        let err: EngineError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert!(err.is_config_error());
    }
}
