//! # Stock Ledger
//!
//! Per-product stock figures and the pure planning functions behind every
//! ledger mutation.
//!
//! ## Figures
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  quantity            physical units on hand                             │
//! │  reserved_quantity   units held by placed-but-undelivered orders        │
//! │  available           quantity − reserved_quantity  (never negative)     │
//! │                                                                         │
//! │  Reserve  : reserved += q                      (fails if available < q) │
//! │  Release  : reserved  = max(0, reserved − q)                            │
//! │  Commit   : quantity  = max(0, quantity − q)                            │
//! │             reserved  = max(0, reserved − q)                            │
//! │  Adjust   : quantity ± q                       (fails below reserved)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Plan, then apply
//! The storage layer loads the rows, calls a `plan_*` function here and
//! writes back the resulting [`LedgerChange`]s, one movement per change.
//! Planning validates the whole batch before producing anything, so a
//! failing item means no change is produced for any item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::MovementType;

// =============================================================================
// Ledger Row
// =============================================================================

/// One product's stock ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct StockLedger {
    pub product_id: String,

    /// Physical units on hand.
    pub quantity: i64,

    /// Units held by orders that are not yet delivered.
    pub reserved_quantity: i64,

    /// Whether the product can be reserved at all.
    pub is_in_stock: bool,

    /// Set when `is_in_stock` was forced by an operator; stock adjustments
    /// leave the flag alone while this is on.
    pub availability_override: bool,

    pub low_stock_threshold: i64,

    pub reorder_point: i64,

    /// Bumped by every transaction that touches the row.
    pub version: i64,

    #[ts(as = "String")]
    pub last_updated_at: DateTime<Utc>,
}

impl StockLedger {
    /// A fresh zero-stock row for a newly created product.
    pub fn empty(product_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        StockLedger {
            product_id: product_id.into(),
            quantity: 0,
            reserved_quantity: 0,
            is_in_stock: false,
            availability_override: false,
            low_stock_threshold: 0,
            reorder_point: 0,
            version: 0,
            last_updated_at: now,
        }
    }

    #[inline]
    pub fn available_quantity(&self) -> i64 {
        self.quantity - self.reserved_quantity
    }

    #[inline]
    pub fn is_low_stock(&self) -> bool {
        self.available_quantity() <= self.low_stock_threshold
    }

    #[inline]
    pub fn needs_reorder(&self) -> bool {
        self.available_quantity() <= self.reorder_point
    }

    /// Availability implied by the figures alone.
    #[inline]
    pub fn derived_in_stock(&self) -> bool {
        self.available_quantity() > 0
    }

    /// The flag to store once the figures become `quantity` / `reserved`.
    /// An operator override pins the current value.
    pub fn availability_after(&self, quantity: i64, reserved: i64) -> bool {
        if self.availability_override {
            self.is_in_stock
        } else {
            quantity - reserved > 0
        }
    }

    /// True when an operator has switched the product off.
    #[inline]
    pub fn is_withdrawn(&self) -> bool {
        self.availability_override && !self.is_in_stock
    }

    /// `quantity ≥ reserved_quantity ≥ 0`.
    pub fn is_consistent(&self) -> bool {
        self.reserved_quantity >= 0 && self.quantity >= self.reserved_quantity
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            product_id: self.product_id.clone(),
            quantity: self.quantity,
            reserved_quantity: self.reserved_quantity,
            available_quantity: self.available_quantity(),
            is_in_stock: self.is_in_stock,
            is_low_stock: self.is_low_stock(),
            needs_reorder: self.needs_reorder(),
        }
    }
}

/// Post-operation view of a ledger row, returned by every coordinator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LedgerSnapshot {
    pub product_id: String,
    pub quantity: i64,
    pub reserved_quantity: i64,
    pub available_quantity: i64,
    pub is_in_stock: bool,
    pub is_low_stock: bool,
    pub needs_reorder: bool,
}

// =============================================================================
// Requests & Results
// =============================================================================

/// A product and a unit count, as passed to reserve/release/commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockItem {
    pub product_id: String,
    pub quantity: i64,
}

impl StockItem {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        StockItem {
            product_id: product_id.into(),
            quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallReason {
    /// Availability flag is off.
    OutOfStock,
    /// Flag is on but not enough units are unreserved.
    Insufficient,
}

/// One line of a reservation that could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockShortfall {
    pub product_id: String,
    pub available: i64,
    pub requested: i64,
    pub reason: ShortfallReason,
}

/// Administrative stock corrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    /// Goods received: quantity += |delta|.
    Restock,
    /// Count correction: quantity += delta (signed).
    Adjustment,
    /// Damaged or expired goods: quantity −= |delta|.
    Wastage,
}

impl AdjustmentKind {
    pub fn movement_type(&self) -> MovementType {
        match self {
            AdjustmentKind::Restock => MovementType::Restock,
            AdjustmentKind::Adjustment => MovementType::Adjustment,
            AdjustmentKind::Wastage => MovementType::Wastage,
        }
    }
}

impl fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.movement_type().as_str())
    }
}

/// The write the storage layer performs for one planned mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    pub product_id: String,
    pub movement_type: MovementType,
    pub quantity_delta: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub previous_reserved: i64,
    pub new_reserved: i64,
    pub is_in_stock: bool,
}

// =============================================================================
// Planning
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Figures {
    quantity: i64,
    reserved: i64,
}

impl From<&StockLedger> for Figures {
    fn from(ledger: &StockLedger) -> Self {
        Figures {
            quantity: ledger.quantity,
            reserved: ledger.reserved_quantity,
        }
    }
}

/// Sorted, de-duplicated product ids: the order rows are claimed in.
///
/// Every transaction claiming rows in the same global order means two
/// transactions can never each hold a row the other is waiting for.
pub fn canonical_product_ids(items: &[StockItem]) -> Vec<String> {
    let mut ids: Vec<String> = items.iter().map(|i| i.product_id.clone()).collect();
    ids.sort();
    ids.dedup();
    ids
}

fn validate_items(items: &[StockItem]) -> CoreResult<()> {
    if items.is_empty() {
        return Err(ValidationError::Required {
            field: "items".to_string(),
        }
        .into());
    }

    for item in items {
        if item.product_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "product_id".to_string(),
            }
            .into());
        }
        if item.quantity <= 0 {
            return Err(ValidationError::MustBePositive {
                field: "quantity".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

fn ledger_for<'a>(
    ledgers: &'a HashMap<String, StockLedger>,
    product_id: &str,
) -> CoreResult<&'a StockLedger> {
    ledgers
        .get(product_id)
        .ok_or_else(|| CoreError::ProductNotFound(product_id.to_string()))
}

/// Plans a multi-item reservation.
///
/// Items are checked in request order against a running copy of the
/// figures, so two lines for the same product see each other's hold.
/// Only an operator override yields `OutOfStock`; an empty shelf is an
/// `InsufficientStock` shortfall.
///
/// ## Errors
/// The variant follows the first failing item (`OutOfStock` or
/// `InsufficientStock`); `shortfalls` carries every failing item.
pub fn plan_reservation(
    ledgers: &HashMap<String, StockLedger>,
    items: &[StockItem],
) -> CoreResult<Vec<LedgerChange>> {
    validate_items(items)?;

    let mut running: HashMap<&str, Figures> = HashMap::new();
    let mut changes = Vec::with_capacity(items.len());
    let mut shortfalls = Vec::new();

    for item in items {
        let ledger = ledger_for(ledgers, &item.product_id)?;
        let figures = running
            .entry(item.product_id.as_str())
            .or_insert_with(|| Figures::from(ledger));
        let available = figures.quantity - figures.reserved;

        if ledger.is_withdrawn() {
            shortfalls.push(StockShortfall {
                product_id: item.product_id.clone(),
                available,
                requested: item.quantity,
                reason: ShortfallReason::OutOfStock,
            });
            continue;
        }

        if available < item.quantity {
            shortfalls.push(StockShortfall {
                product_id: item.product_id.clone(),
                available,
                requested: item.quantity,
                reason: ShortfallReason::Insufficient,
            });
            continue;
        }

        let previous = *figures;
        figures.reserved += item.quantity;

        changes.push(LedgerChange {
            product_id: item.product_id.clone(),
            movement_type: MovementType::Reserved,
            quantity_delta: item.quantity,
            previous_quantity: previous.quantity,
            new_quantity: figures.quantity,
            previous_reserved: previous.reserved,
            new_reserved: figures.reserved,
            is_in_stock: ledger.availability_after(figures.quantity, figures.reserved),
        });
    }

    match shortfalls.first().cloned() {
        None => Ok(changes),
        Some(first) => Err(match first.reason {
            ShortfallReason::OutOfStock => CoreError::OutOfStock {
                product_id: first.product_id,
                shortfalls,
            },
            ShortfallReason::Insufficient => CoreError::InsufficientStock {
                product_id: first.product_id,
                available: first.available,
                requested: first.requested,
                shortfalls,
            },
        }),
    }
}

/// Plans returning held units. Never fails on quantity: the reserved figure
/// is clamped at zero.
pub fn plan_release(
    ledgers: &HashMap<String, StockLedger>,
    items: &[StockItem],
) -> CoreResult<Vec<LedgerChange>> {
    validate_items(items)?;

    let mut running: HashMap<&str, Figures> = HashMap::new();
    let mut changes = Vec::with_capacity(items.len());

    for item in items {
        let ledger = ledger_for(ledgers, &item.product_id)?;
        let figures = running
            .entry(item.product_id.as_str())
            .or_insert_with(|| Figures::from(ledger));

        let previous = *figures;
        figures.reserved = (figures.reserved - item.quantity).max(0);

        changes.push(LedgerChange {
            product_id: item.product_id.clone(),
            movement_type: MovementType::Released,
            quantity_delta: figures.reserved - previous.reserved,
            previous_quantity: previous.quantity,
            new_quantity: figures.quantity,
            previous_reserved: previous.reserved,
            new_reserved: figures.reserved,
            is_in_stock: ledger.availability_after(figures.quantity, figures.reserved),
        });
    }

    Ok(changes)
}

/// Plans shipping delivered units: both figures drop, each clamped at zero.
pub fn plan_commit(
    ledgers: &HashMap<String, StockLedger>,
    items: &[StockItem],
) -> CoreResult<Vec<LedgerChange>> {
    validate_items(items)?;

    let mut running: HashMap<&str, Figures> = HashMap::new();
    let mut changes = Vec::with_capacity(items.len());

    for item in items {
        let ledger = ledger_for(ledgers, &item.product_id)?;
        let figures = running
            .entry(item.product_id.as_str())
            .or_insert_with(|| Figures::from(ledger));

        let previous = *figures;
        figures.quantity = (figures.quantity - item.quantity).max(0);
        figures.reserved = (figures.reserved - item.quantity).max(0);

        changes.push(LedgerChange {
            product_id: item.product_id.clone(),
            movement_type: MovementType::Outgoing,
            quantity_delta: figures.quantity - previous.quantity,
            previous_quantity: previous.quantity,
            new_quantity: figures.quantity,
            previous_reserved: previous.reserved,
            new_reserved: figures.reserved,
            is_in_stock: ledger.availability_after(figures.quantity, figures.reserved),
        });
    }

    Ok(changes)
}

/// Plans an administrative quantity change.
///
/// `Restock` adds `|delta|`, `Wastage` removes `|delta|` and `Adjustment`
/// applies `delta` signed. Rejects any result below zero or below the
/// reserved figure. Recomputes the availability flag unless an operator
/// override is in place.
///
/// A zero `delta` is refused for every kind: it would write a movement
/// that changes nothing.
pub fn plan_adjustment(
    ledger: &StockLedger,
    kind: AdjustmentKind,
    delta: i64,
) -> CoreResult<LedgerChange> {
    let invalid = |reason: String| CoreError::InvalidAdjustment {
        product_id: ledger.product_id.clone(),
        reason,
    };

    if delta == 0 {
        return Err(invalid("quantity change must be non-zero".to_string()));
    }

    let magnitude = delta
        .checked_abs()
        .ok_or_else(|| invalid("quantity change is out of range".to_string()))?;

    let new_quantity = match kind {
        AdjustmentKind::Restock => ledger.quantity.checked_add(magnitude),
        AdjustmentKind::Wastage => ledger.quantity.checked_sub(magnitude),
        AdjustmentKind::Adjustment => ledger.quantity.checked_add(delta),
    }
    .ok_or_else(|| invalid("quantity change is out of range".to_string()))?;

    if new_quantity < 0 {
        return Err(invalid(format!(
            "{} of {} would leave {} on hand",
            kind, magnitude, new_quantity
        )));
    }

    if new_quantity < ledger.reserved_quantity {
        return Err(invalid(format!(
            "{} of {} would leave {} on hand with {} reserved",
            kind, magnitude, new_quantity, ledger.reserved_quantity
        )));
    }

    let is_in_stock = ledger.availability_after(new_quantity, ledger.reserved_quantity);

    Ok(LedgerChange {
        product_id: ledger.product_id.clone(),
        movement_type: kind.movement_type(),
        quantity_delta: new_quantity - ledger.quantity,
        previous_quantity: ledger.quantity,
        new_quantity,
        previous_reserved: ledger.reserved_quantity,
        new_reserved: ledger.reserved_quantity,
        is_in_stock,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(id: &str, quantity: i64, reserved: i64) -> StockLedger {
        StockLedger {
            quantity,
            reserved_quantity: reserved,
            is_in_stock: quantity - reserved > 0,
            ..StockLedger::empty(id, Utc::now())
        }
    }

    fn book(rows: Vec<StockLedger>) -> HashMap<String, StockLedger> {
        rows.into_iter().map(|l| (l.product_id.clone(), l)).collect()
    }

    #[test]
    fn test_derived_figures() {
        let mut row = ledger("a", 20, 8);
        row.low_stock_threshold = 12;
        row.reorder_point = 5;

        assert_eq!(row.available_quantity(), 12);
        assert!(row.is_low_stock());
        assert!(!row.needs_reorder());
        assert!(row.is_consistent());

        let snap = row.snapshot();
        assert_eq!(snap.available_quantity, 12);
        assert!(snap.is_low_stock);
    }

    #[test]
    fn test_canonical_ids_sorted_and_deduplicated() {
        let items = vec![
            StockItem::new("c", 1),
            StockItem::new("a", 1),
            StockItem::new("c", 2),
        ];
        assert_eq!(canonical_product_ids(&items), vec!["a", "c"]);
    }

    #[test]
    fn test_reservation_increments_reserved() {
        let rows = book(vec![ledger("a", 100, 0)]);
        let changes = plan_reservation(&rows, &[StockItem::new("a", 10)]).unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].movement_type, MovementType::Reserved);
        assert_eq!(changes[0].quantity_delta, 10);
        assert_eq!(changes[0].previous_reserved, 0);
        assert_eq!(changes[0].new_reserved, 10);
        assert_eq!(changes[0].new_quantity, 100);
    }

    #[test]
    fn test_duplicate_lines_accumulate() {
        let rows = book(vec![ledger("a", 10, 0)]);

        let ok = plan_reservation(&rows, &[StockItem::new("a", 4), StockItem::new("a", 6)]).unwrap();
        assert_eq!(ok[1].previous_reserved, 4);
        assert_eq!(ok[1].new_reserved, 10);

        let err = plan_reservation(&rows, &[StockItem::new("a", 6), StockItem::new("a", 6)])
            .unwrap_err();
        match err {
            CoreError::InsufficientStock {
                available,
                requested,
                ..
            } => {
                assert_eq!(available, 4);
                assert_eq!(requested, 6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_reservation_is_all_or_nothing_and_reports_every_shortfall() {
        let mut out = ledger("c", 50, 0);
        out.is_in_stock = false;
        out.availability_override = true;
        let rows = book(vec![ledger("a", 100, 0), ledger("b", 3, 0), out]);

        let err = plan_reservation(
            &rows,
            &[
                StockItem::new("a", 5),
                StockItem::new("b", 1_000_000),
                StockItem::new("c", 1),
            ],
        )
        .unwrap_err();

        match &err {
            CoreError::InsufficientStock { product_id, .. } => assert_eq!(product_id, "b"),
            other => panic!("unexpected error: {other:?}"),
        }
        let shortfalls = err.shortfalls();
        assert_eq!(shortfalls.len(), 2);
        assert_eq!(shortfalls[1].reason, ShortfallReason::OutOfStock);
    }

    #[test]
    fn test_out_of_stock_flag_blocks_even_with_units() {
        let mut row = ledger("a", 100, 0);
        row.is_in_stock = false;
        row.availability_override = true;
        let err = plan_reservation(&book(vec![row]), &[StockItem::new("a", 1)]).unwrap_err();
        assert!(matches!(err, CoreError::OutOfStock { .. }));
    }

    #[test]
    fn test_unknown_product_and_bad_quantities() {
        let rows = book(vec![ledger("a", 10, 0)]);
        assert_eq!(
            plan_reservation(&rows, &[StockItem::new("zzz", 1)]).unwrap_err(),
            CoreError::ProductNotFound("zzz".to_string())
        );
        assert!(matches!(
            plan_reservation(&rows, &[StockItem::new("a", 0)]).unwrap_err(),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            plan_release(&rows, &[]).unwrap_err(),
            CoreError::Validation(_)
        ));
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let rows = book(vec![ledger("a", 10, 3)]);
        let changes = plan_release(&rows, &[StockItem::new("a", 5)]).unwrap();

        assert_eq!(changes[0].new_reserved, 0);
        assert_eq!(changes[0].quantity_delta, -3);
        assert_eq!(changes[0].new_quantity, 10);
    }

    #[test]
    fn test_commit_reduces_both_figures() {
        let rows = book(vec![ledger("a", 100, 10)]);
        let changes = plan_commit(&rows, &[StockItem::new("a", 10)]).unwrap();

        assert_eq!(changes[0].movement_type, MovementType::Outgoing);
        assert_eq!(changes[0].new_quantity, 90);
        assert_eq!(changes[0].new_reserved, 0);
        assert_eq!(changes[0].quantity_delta, -10);
    }

    #[test]
    fn test_commit_clamps_and_keeps_invariant() {
        let rows = book(vec![ledger("a", 4, 2)]);
        let changes = plan_commit(&rows, &[StockItem::new("a", 9)]).unwrap();
        assert_eq!(changes[0].new_quantity, 0);
        assert_eq!(changes[0].new_reserved, 0);
    }

    #[test]
    fn test_adjustment_kinds() {
        let row = ledger("a", 10, 2);

        let restock = plan_adjustment(&row, AdjustmentKind::Restock, -5).unwrap();
        assert_eq!(restock.new_quantity, 15);
        assert_eq!(restock.movement_type, MovementType::Restock);

        let wastage = plan_adjustment(&row, AdjustmentKind::Wastage, 3).unwrap();
        assert_eq!(wastage.new_quantity, 7);
        assert_eq!(wastage.quantity_delta, -3);

        let correction = plan_adjustment(&row, AdjustmentKind::Adjustment, -4).unwrap();
        assert_eq!(correction.new_quantity, 6);
    }

    #[test]
    fn test_wastage_beyond_stock_is_rejected() {
        let row = ledger("a", 10, 0);
        let err = plan_adjustment(&row, AdjustmentKind::Wastage, 20).unwrap_err();
        assert!(matches!(err, CoreError::InvalidAdjustment { .. }));
    }

    #[test]
    fn test_adjustment_cannot_drop_below_reserved() {
        let row = ledger("a", 10, 8);
        let err = plan_adjustment(&row, AdjustmentKind::Wastage, 5).unwrap_err();
        assert!(matches!(err, CoreError::InvalidAdjustment { .. }));

        for kind in [
            AdjustmentKind::Restock,
            AdjustmentKind::Wastage,
            AdjustmentKind::Adjustment,
        ] {
            assert!(matches!(
                plan_adjustment(&row, kind, 0).unwrap_err(),
                CoreError::InvalidAdjustment { .. }
            ));
        }
    }

    #[test]
    fn test_adjustment_recomputes_availability_unless_overridden() {
        let empty = ledger("a", 0, 0);
        let change = plan_adjustment(&empty, AdjustmentKind::Restock, 5).unwrap();
        assert!(change.is_in_stock);

        let mut forced_off = ledger("a", 0, 0);
        forced_off.availability_override = true;
        forced_off.is_in_stock = false;
        let change = plan_adjustment(&forced_off, AdjustmentKind::Restock, 5).unwrap();
        assert!(!change.is_in_stock);

        let drained = plan_adjustment(&ledger("a", 5, 0), AdjustmentKind::Wastage, 5).unwrap();
        assert!(!drained.is_in_stock);
    }

    #[test]
    fn test_order_path_rederives_availability() {
        // Drained to zero available by a correction, then freed by a release.
        let mut row = ledger("a", 5, 5);
        row.is_in_stock = false;

        let released = plan_release(&book(vec![row.clone()]), &[StockItem::new("a", 5)]).unwrap();
        assert!(released[0].is_in_stock);

        let held = plan_reservation(&book(vec![ledger("a", 3, 0)]), &[StockItem::new("a", 3)])
            .unwrap();
        assert!(!held[0].is_in_stock);

        let shipped = plan_commit(&book(vec![ledger("a", 8, 2)]), &[StockItem::new("a", 2)])
            .unwrap();
        assert!(shipped[0].is_in_stock);

        row.availability_override = true;
        let pinned = plan_release(&book(vec![row]), &[StockItem::new("a", 5)]).unwrap();
        assert!(!pinned[0].is_in_stock);
    }

    #[test]
    fn test_stale_flag_without_override_does_not_block() {
        let mut row = ledger("a", 5, 0);
        row.is_in_stock = false;
        let changes = plan_reservation(&book(vec![row]), &[StockItem::new("a", 1)]).unwrap();
        assert_eq!(changes[0].new_reserved, 1);

        let err = plan_reservation(&book(vec![ledger("a", 0, 0)]), &[StockItem::new("a", 1)])
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientStock { available: 0, .. }));
    }
}
