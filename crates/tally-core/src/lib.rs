//! # tally-core: Pure Business Logic for Tally
//!
//! Stock ledger arithmetic, offer evaluation and order pricing as pure
//! functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                tally-engine (services)                          │   │
//! │  │   place_order, cancel_order, reserve, adjust_stock, ...         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  ledger   │  │   offer   │  │   order   │  │ validation│  │   │
//! │  │   │  plan_*   │  │ evaluate_*│  │ price_*   │  │   rules   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Database Layer)                    │   │
//! │  │       SQLite queries, migrations, ledger transactions           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Products, movements, orders and their statuses
//! - [`ledger`] - Stock ledger rows and reservation planning
//! - [`offer`] - Offer definitions and discount evaluation
//! - [`order`] - Order request checks, pricing, savings breakdown
//! - [`money`] - Integer money
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use std::collections::HashMap;
//! use chrono::Utc;
//! use tally_core::ledger::{plan_reservation, StockItem, StockLedger};
//!
//! let mut ledger = StockLedger::empty("maize", Utc::now());
//! ledger.quantity = 10;
//! ledger.is_in_stock = true;
//!
//! let book = HashMap::from([(ledger.product_id.clone(), ledger)]);
//! let changes = plan_reservation(&book, &[StockItem::new("maize", 4)]).unwrap();
//! assert_eq!(changes[0].new_reserved, 4);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod ledger;
pub mod money;
pub mod offer;
pub mod order;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use ledger::{
    AdjustmentKind, LedgerChange, LedgerSnapshot, ShortfallReason, StockItem, StockLedger,
    StockShortfall,
};
pub use money::Money;
pub use offer::{AppliedOffer, NewOffer, Offer, OfferEvaluation, OfferKind, OfferUsage};
pub use order::{OrderRequest, SavingsBreakdown};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum lines in a single order.
pub const MAX_ORDER_LINES: usize = 100;

/// Maximum quantity of a single order line.
///
/// ## Business Reason
/// Catches typos (10000 instead of 100) before they lock up stock.
pub const MAX_ITEM_QUANTITY: i64 = 9_999;

/// Highest list price in cents.
///
/// Keeps `price × MAX_ITEM_QUANTITY × MAX_ORDER_LINES` well inside `i64`,
/// so order totals need no overflow checks.
pub const MAX_PRICE_CENTS: i64 = 100_000_000_000;
