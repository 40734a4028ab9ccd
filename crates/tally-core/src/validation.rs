//! # Validation Module
//!
//! Input validation for catalog entries, offers and order requests.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: This module                                                  │
//! │  ├── Request shape (counts, quantities, required fields)               │
//! │  └── Definition sanity (offer values, thresholds)                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Ledger planning (crate::ledger)                              │
//! │  └── Stock rules against current figures                               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── CHECK (quantity >= 0, reserved_quantity <= quantity)              │
//! │  ├── UNIQUE (sku, offer code)                                          │
//! │  └── Foreign keys                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_sku, validate_quantity};
//!
//! assert!(validate_sku("MAIZE-2KG").is_ok());
//! assert!(validate_quantity(0).is_err());
//! ```

use crate::error::ValidationError;
use crate::money::BPS_SCALE;
use crate::offer::{NewOffer, OfferKind};
use crate::{MAX_ITEM_QUANTITY, MAX_ORDER_LINES, MAX_PRICE_CENTS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a SKU.
///
/// ## Rules
/// - Not empty, at most 50 characters
/// - Letters, digits, hyphens and underscores only
pub fn validate_sku(sku: &str) -> ValidationResult<()> {
    let sku = sku.trim();

    if sku.is_empty() {
        return Err(ValidationError::Required {
            field: "sku".to_string(),
        });
    }

    if sku.len() > 50 {
        return Err(ValidationError::TooLong {
            field: "sku".to_string(),
            max: 50,
        });
    }

    if !sku
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "sku".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates a product or offer name (1..=200 characters).
pub fn validate_name(field: &str, name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.len() > 200 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 200,
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates an order line quantity.
///
/// ## Rules
/// - Must be positive
/// - Must not exceed MAX_ITEM_QUANTITY
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates the number of lines in an order (1..=MAX_ORDER_LINES).
pub fn validate_order_line_count(lines: usize) -> ValidationResult<()> {
    if lines == 0 {
        return Err(ValidationError::Required {
            field: "items".to_string(),
        });
    }

    if lines > MAX_ORDER_LINES {
        return Err(ValidationError::OutOfRange {
            field: "items".to_string(),
            min: 1,
            max: MAX_ORDER_LINES as i64,
        });
    }

    Ok(())
}

/// Validates a price in cents (0..=MAX_PRICE_CENTS).
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if !(0..=MAX_PRICE_CENTS).contains(&cents) {
        return Err(ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: MAX_PRICE_CENTS,
        });
    }

    Ok(())
}

/// Validates low-stock threshold and reorder point (both ≥ 0).
pub fn validate_thresholds(low_stock_threshold: i64, reorder_point: i64) -> ValidationResult<()> {
    for (field, value) in [
        ("low_stock_threshold", low_stock_threshold),
        ("reorder_point", reorder_point),
    ] {
        if value < 0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                min: 0,
                max: i64::MAX,
            });
        }
    }

    Ok(())
}

// =============================================================================
// Offer Validators
// =============================================================================

/// Validates an offer definition before it is stored.
///
/// ## Rules
/// - Percentage value in 1..=10000 bps; fixed value > 0
/// - Caps, minimums and limits non-negative
/// - `valid_from` not after `valid_until`
pub fn validate_new_offer(offer: &NewOffer) -> ValidationResult<()> {
    validate_name("offer name", &offer.name)?;

    if let Some(code) = &offer.code {
        if code.is_empty() {
            return Err(ValidationError::Required {
                field: "code".to_string(),
            });
        }
        if code.len() > 32 {
            return Err(ValidationError::TooLong {
                field: "code".to_string(),
                max: 32,
            });
        }
    }

    match offer.kind {
        OfferKind::Percentage if !(1..=BPS_SCALE).contains(&offer.value) => {
            return Err(ValidationError::OutOfRange {
                field: "value".to_string(),
                min: 1,
                max: BPS_SCALE,
            });
        }
        OfferKind::Fixed if offer.value <= 0 => {
            return Err(ValidationError::MustBePositive {
                field: "value".to_string(),
            });
        }
        _ => {}
    }

    let non_negative = [
        ("max_discount_cents", offer.max_discount_cents.unwrap_or(0)),
        ("min_order_cents", offer.min_order_cents),
        ("min_quantity", offer.min_quantity),
        ("max_total_uses", offer.max_total_uses.unwrap_or(0)),
        ("per_requester_limit", offer.per_requester_limit.unwrap_or(0)),
    ];
    for (field, value) in non_negative {
        if value < 0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                min: 0,
                max: i64::MAX,
            });
        }
    }

    if let (Some(from), Some(until)) = (offer.valid_from, offer.valid_until) {
        if from > until {
            return Err(ValidationError::InvalidFormat {
                field: "valid_until".to_string(),
                reason: "must not be before valid_from".to_string(),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_validate_sku() {
        assert!(validate_sku("MAIZE-2KG").is_ok());
        assert!(validate_sku("oil_1l").is_ok());

        assert!(validate_sku("").is_err());
        assert!(validate_sku("has space").is_err());
        assert!(validate_sku(&"A".repeat(100)).is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("name", "Maize Flour 2kg").is_ok());
        assert!(validate_name("name", "   ").is_err());
        assert!(validate_name("name", &"A".repeat(300)).is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_ITEM_QUANTITY).is_ok());

        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(MAX_ITEM_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_order_line_count() {
        assert!(validate_order_line_count(1).is_ok());
        assert!(validate_order_line_count(0).is_err());
        assert!(validate_order_line_count(MAX_ORDER_LINES + 1).is_err());
    }

    #[test]
    fn test_validate_price_cents() {
        assert!(validate_price_cents(0).is_ok());
        assert!(validate_price_cents(MAX_PRICE_CENTS).is_ok());
        assert!(validate_price_cents(-1).is_err());
        assert!(validate_price_cents(MAX_PRICE_CENTS + 1).is_err());
        assert!(validate_price_cents(i64::MAX).is_err());
    }

    #[test]
    fn test_validate_thresholds() {
        assert!(validate_thresholds(5, 2).is_ok());
        assert!(validate_thresholds(-1, 2).is_err());
    }

    #[test]
    fn test_validate_new_offer() {
        assert!(validate_new_offer(&NewOffer::percentage("Ten", 1000)).is_ok());
        assert!(validate_new_offer(&NewOffer::fixed("Flat", 5000).with_code("flat50")).is_ok());

        assert!(validate_new_offer(&NewOffer::percentage("Too much", 10_001)).is_err());
        assert!(validate_new_offer(&NewOffer::fixed("Nothing", 0)).is_err());
        assert!(validate_new_offer(&NewOffer::fixed("Neg", 10).min_order_cents(-1)).is_err());

        let now = Utc::now();
        let backwards =
            NewOffer::fixed("Backwards", 10).valid_between(Some(now), Some(now - Duration::days(1)));
        assert!(validate_new_offer(&backwards).is_err());
    }
}
