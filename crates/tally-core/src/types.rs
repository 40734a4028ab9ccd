//! # Domain Types
//!
//! Catalog, movement and order types shared by every crate.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Product      │   │      Order      │   │  StockMovement  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  id (UUID)      │   │  id (serial)    │       │
//! │  │  sku (business) │   │  orderer_id     │   │  movement_type  │       │
//! │  │  price_cents    │   │  lines[]        │   │  quantity_delta │       │
//! │  │  is_active      │   │  statuses (x3)  │   │  prev/new       │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  StockLedger lives in [`crate::ledger`], Offer in [`crate::offer`].    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Snapshot Pattern
//! Order lines copy SKU, name and unit price at order time so later catalog
//! edits never rewrite history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::ValidationError;
use crate::money::Money;
use crate::offer::AppliedOffer;
use crate::validation::{validate_name, validate_price_cents, validate_sku};

// =============================================================================
// Product
// =============================================================================

/// A catalog product. Stock figures live in its ledger row, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Product {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Stock Keeping Unit - business identifier.
    pub sku: String,

    /// Display name shown to shops.
    pub name: String,

    /// Category reference (catalog curation is external).
    pub category_id: Option<String>,

    /// Price in cents.
    pub price_cents: i64,

    /// Optional strike-through price in cents.
    pub compare_at_price_cents: Option<i64>,

    /// Inactive products cannot be ordered.
    pub is_active: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Returns the price as Money.
    #[inline]
    pub fn price(&self) -> Money {
        Money::from_cents(self.price_cents)
    }
}

/// Input for adding a product to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub sku: String,
    pub name: String,
    pub category_id: Option<String>,
    pub price_cents: i64,
    pub compare_at_price_cents: Option<i64>,
}

impl NewProduct {
    pub fn new(sku: impl Into<String>, name: impl Into<String>, price_cents: i64) -> Self {
        NewProduct {
            sku: sku.into(),
            name: name.into(),
            category_id: None,
            price_cents,
            compare_at_price_cents: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_sku(&self.sku)?;
        validate_name("name", &self.name)?;
        validate_price_cents(self.price_cents)?;
        if let Some(compare_at) = self.compare_at_price_cents {
            validate_price_cents(compare_at)?;
        }
        Ok(())
    }
}

// =============================================================================
// Stock Movement
// =============================================================================

/// What a movement entry records.
///
/// `Reserved` and `Released` move the reserved figure; the rest move the
/// physical quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Reserved,
    Released,
    Outgoing,
    Restock,
    Adjustment,
    Wastage,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Reserved => "reserved",
            MovementType::Released => "released",
            MovementType::Outgoing => "outgoing",
            MovementType::Restock => "restock",
            MovementType::Adjustment => "adjustment",
            MovementType::Wastage => "wastage",
        }
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit entry of a ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct StockMovement {
    pub id: i64,
    pub product_id: String,
    pub movement_type: MovementType,
    /// Signed change of the figure this movement targets.
    pub quantity_delta: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub previous_reserved: i64,
    pub new_reserved: i64,
    pub reason: Option<String>,
    pub related_order_id: Option<String>,
    pub actor_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Order Statuses
// =============================================================================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Paid in cash when the order arrives.
    CashOnDelivery,
    /// Mobile money; settlement happens outside the engine.
    Mpesa,
    /// Shop credit account.
    Credit,
}

/// Admin approval of a placed order.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// Delivery progress of a placed order.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    InTransit,
    Delivered,
    Cancelled,
}

/// Where the order's stock hold stands.
///
/// ## Transitions
/// ```text
///            ┌──► Committed  (delivered: stock left the warehouse)
/// Reserved ──┼──► Released   (rejected: hold returned)
///            └──► Cancelled  (cancelled: hold returned)
/// ```
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    #[default]
    Reserved,
    Committed,
    Released,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Only a live hold can be settled, and only once.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (
                ReservationStatus::Reserved,
                ReservationStatus::Committed
                    | ReservationStatus::Released
                    | ReservationStatus::Cancelled
            )
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Order
// =============================================================================

/// A line item of an order request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: i64,
}

/// A line of a placed order (frozen product snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct OrderLine {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    /// SKU at order time (frozen).
    pub sku_snapshot: String,
    /// Product name at order time (frozen).
    pub name_snapshot: String,
    pub quantity: i64,
    /// Unit price in cents at order time (frozen).
    pub unit_price_cents: i64,
    /// unit_price × quantity, before discounts.
    pub line_total_cents: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl OrderLine {
    #[inline]
    pub fn line_total(&self) -> Money {
        Money::from_cents(self.line_total_cents)
    }
}

/// A placed order. Exists only if its reservation succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Order {
    pub id: String,
    /// The shop that placed the order.
    pub orderer_id: String,
    pub lines: Vec<OrderLine>,
    pub original_price_cents: i64,
    pub total_discount_cents: i64,
    pub total_price_cents: i64,
    pub applied_offers: Vec<AppliedOffer>,
    pub payment_method: PaymentMethod,
    pub approval_status: ApprovalStatus,
    pub delivery_status: DeliveryStatus,
    pub reservation_status: ReservationStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Order {
    #[inline]
    pub fn total_price(&self) -> Money {
        Money::from_cents(self.total_price_cents)
    }

    /// Total units across all lines.
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_transitions() {
        let reserved = ReservationStatus::Reserved;
        assert!(reserved.can_transition_to(ReservationStatus::Committed));
        assert!(reserved.can_transition_to(ReservationStatus::Released));
        assert!(reserved.can_transition_to(ReservationStatus::Cancelled));
        assert!(!reserved.can_transition_to(ReservationStatus::Reserved));

        // settled holds never move again
        for settled in [
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Cancelled,
        ] {
            assert!(settled.is_terminal());
            assert!(!settled.can_transition_to(ReservationStatus::Released));
            assert!(!settled.can_transition_to(ReservationStatus::Committed));
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&PaymentMethod::CashOnDelivery).unwrap();
        assert_eq!(json, "\"cash_on_delivery\"");

        let json = serde_json::to_string(&DeliveryStatus::InTransit).unwrap();
        assert_eq!(json, "\"in_transit\"");

        assert_eq!(MovementType::Outgoing.to_string(), "outgoing");
    }

    #[test]
    fn test_new_product_validation() {
        assert!(NewProduct::new("MAIZE-2KG", "Maize Flour 2kg", 18_000).validate().is_ok());
        assert!(NewProduct::new("", "Nameless", 100).validate().is_err());
        assert!(NewProduct::new("SUGAR-1KG", "Sugar", -1).validate().is_err());
    }

    #[test]
    fn test_status_defaults() {
        assert_eq!(ApprovalStatus::default(), ApprovalStatus::Pending);
        assert_eq!(DeliveryStatus::default(), DeliveryStatus::Pending);
        assert_eq!(ReservationStatus::default(), ReservationStatus::Reserved);
    }
}
