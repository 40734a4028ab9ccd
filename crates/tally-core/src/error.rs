//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Stock, offer and order rule violations         │
//! │  └── ValidationError  - Malformed input                                │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Storage failures, conflicts, timeouts          │
//! │                                                                         │
//! │  tally-engine errors                                                   │
//! │  └── EngineError      - What callers see (Domain | Storage | ...)      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → EngineError → caller              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::ledger::StockShortfall;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations raised by the pure planning functions.
///
/// None of these are retryable: the same request against the same state
/// fails the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Product (or its stock ledger row) does not exist.
    #[error("Product not found: {0}")]
    ProductNotFound(String),

    /// Product exists but has been deactivated.
    #[error("Product is inactive: {0}")]
    ProductInactive(String),

    /// Product's availability flag is off.
    ///
    /// `shortfalls` lists every line of the batch that could not be
    /// satisfied, not only the first.
    #[error("Product {product_id} is out of stock")]
    OutOfStock {
        product_id: String,
        shortfalls: Vec<StockShortfall>,
    },

    /// Not enough unreserved stock.
    ///
    /// ## User Workflow
    /// ```text
    /// Reserve [A:5, B:40]
    ///      │
    ///      ▼
    /// Check B: available=12
    ///      │
    ///      ▼
    /// InsufficientStock { product_id: B, available: 12, requested: 40 }
    ///      │
    ///      ▼
    /// Shop sees: "Only 12 of B left"; A is not reserved either
    /// ```
    #[error("Insufficient stock for {product_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: String,
        available: i64,
        requested: i64,
        shortfalls: Vec<StockShortfall>,
    },

    /// Stock adjustment would leave the ledger in an invalid state.
    #[error("Invalid adjustment for {product_id}: {reason}")]
    InvalidAdjustment { product_id: String, reason: String },

    /// Supplied offer code does not match an active offer.
    #[error("Invalid offer code: {0}")]
    InvalidOfferCode(String),

    /// Offer exists but does not apply to this order or requester.
    #[error("Offer {code} is not applicable: {reason}")]
    OfferNotEligible { code: String, reason: String },

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Order is not in a state that allows the requested transition.
    ///
    /// ## When This Occurs
    /// - Cancelling an order that was already delivered
    /// - Delivering an order whose reservation was released
    #[error("Order {order_id} is {current_status}, cannot perform operation")]
    InvalidOrderStatus {
        order_id: String,
        current_status: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Every unsatisfiable line of a failed reservation, in request order.
    pub fn shortfalls(&self) -> &[StockShortfall] {
        match self {
            CoreError::OutOfStock { shortfalls, .. }
            | CoreError::InsufficientStock { shortfalls, .. } => shortfalls,
            _ => &[],
        }
    }

    /// True for errors caused by current stock levels.
    pub fn is_stock_error(&self) -> bool {
        matches!(
            self,
            CoreError::OutOfStock { .. }
                | CoreError::InsufficientStock { .. }
                | CoreError::InvalidAdjustment { .. }
        )
    }

    /// True for errors caused by the supplied or automatic offers.
    pub fn is_offer_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidOfferCode(_) | CoreError::OfferNotEligible { .. }
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any ledger row is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID, invalid date).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ShortfallReason;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InsufficientStock {
            product_id: "p-1".to_string(),
            available: 3,
            requested: 5,
            shortfalls: vec![],
        };
        assert_eq!(
            err.to_string(),
            "Insufficient stock for p-1: available 3, requested 5"
        );

        let err = CoreError::OfferNotEligible {
            code: "SAVE10".to_string(),
            reason: "offer has expired".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Offer SAVE10 is not applicable: offer has expired"
        );
    }

    #[test]
    fn test_shortfalls_accessor() {
        let shortfall = StockShortfall {
            product_id: "p-2".to_string(),
            available: 0,
            requested: 4,
            reason: ShortfallReason::OutOfStock,
        };
        let err = CoreError::OutOfStock {
            product_id: "p-2".to_string(),
            shortfalls: vec![shortfall.clone()],
        };
        assert_eq!(err.shortfalls(), &[shortfall]);
        assert!(err.is_stock_error());
        assert!(CoreError::OrderNotFound("x".into()).shortfalls().is_empty());
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "orderer_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert!(!core_err.is_stock_error());
    }
}
