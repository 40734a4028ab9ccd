//! # Reservation Coordinator
//!
//! The only writer of ledger figures. Every primitive is one atomic
//! transaction over one or more ledger rows.
//!
//! ## Primitives
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  reserve        reserved += q          (all items or none)  RESERVED    │
//! │  release        reserved -= q, ≥ 0                          RELEASED    │
//! │  commit         quantity -= q, ≥ 0                          OUTGOING    │
//! │                 reserved -= q, ≥ 0                                      │
//! │  adjust_stock   restock / adjustment / wastage              RESTOCK ... │
//! │                 never below 0, never below reserved                     │
//! │  set_availability   operator override of is_in_stock        (no entry)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Forms
//! `reserve(...)` opens, commits and times out its own transaction.
//! `reserve_in(conn, ...)` runs inside a caller's transaction so order
//! assembly and lifecycle transitions can write their own rows in the same
//! commit. Both claim rows first (see `LedgerRepository::claim_rows`), so
//! validation always runs against the figures that will be overwritten.
//!
//! The coordinator never retries. Dropping an uncommitted transaction
//! (error, timeout, cancelled caller) rolls every write back.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tally_core::ledger::{
    canonical_product_ids, plan_adjustment, plan_commit, plan_release, plan_reservation,
};
use tally_core::validation::validate_thresholds;
use tally_core::{
    AdjustmentKind, CoreError, LedgerChange, LedgerSnapshot, StockItem, StockLedger, StockMovement,
};
use tally_db::{Database, DbError, LedgerRepository, MovementContext, SqliteConnection};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Serializes all stock mutations through claimed ledger rows.
#[derive(Debug, Clone)]
pub struct ReservationCoordinator {
    db: Database,
    tx_timeout: Duration,
}

impl ReservationCoordinator {
    pub fn new(db: Database, tx_timeout: Duration) -> Self {
        ReservationCoordinator { db, tx_timeout }
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.tx_timeout
    }

    /// Runs one standalone transaction under the configured timeout.
    async fn within<T, F>(&self, operation: &'static str, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        match tokio::time::timeout(self.tx_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.tx_timeout.as_millis() as u64;
                warn!(operation, timeout_ms, "Ledger transaction timed out");
                Err(DbError::TransactionTimeout { timeout_ms }.into())
            }
        }
    }

    // =========================================================================
    // Reserve
    // =========================================================================

    /// Holds stock for an order.
    ///
    /// ## Errors
    /// - `OutOfStock` / `InsufficientStock` for the first failing item, with
    ///   every shortfall attached; nothing is reserved
    /// - `ProductNotFound` if any item has no ledger row
    pub async fn reserve(
        &self,
        items: &[StockItem],
        order_id: &str,
        actor_id: &str,
    ) -> EngineResult<Vec<LedgerSnapshot>> {
        let ctx = MovementContext::new().order(order_id).actor(actor_id);
        self.within("reserve", async {
            let mut tx = self.db.begin().await?;
            let snapshots = Self::reserve_in(&mut tx, items, &ctx).await?;
            tx.commit().await?;
            Ok::<_, EngineError>(snapshots)
        })
        .await
    }

    /// Transaction form of [`reserve`](Self::reserve).
    pub async fn reserve_in(
        conn: &mut SqliteConnection,
        items: &[StockItem],
        ctx: &MovementContext,
    ) -> EngineResult<Vec<LedgerSnapshot>> {
        let (ids, ledgers) = claim_and_load(conn, items).await?;
        let changes = plan_reservation(&ledgers, items)?;
        let snapshots = write(conn, &ids, &changes, ctx).await?;

        debug!(
            order_id = ?ctx.related_order_id,
            items = items.len(),
            "Stock reserved"
        );
        Ok(snapshots)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Returns held units. Clamped at zero; calling it twice appends two
    /// movements.
    pub async fn release(
        &self,
        items: &[StockItem],
        order_id: &str,
        actor_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<Vec<LedgerSnapshot>> {
        let mut ctx = MovementContext::new().order(order_id).actor(actor_id);
        if let Some(reason) = reason {
            ctx = ctx.reason(reason);
        }
        self.within("release", async {
            let mut tx = self.db.begin().await?;
            let snapshots = Self::release_in(&mut tx, items, &ctx).await?;
            tx.commit().await?;
            Ok::<_, EngineError>(snapshots)
        })
        .await
    }

    /// Transaction form of [`release`](Self::release).
    pub async fn release_in(
        conn: &mut SqliteConnection,
        items: &[StockItem],
        ctx: &MovementContext,
    ) -> EngineResult<Vec<LedgerSnapshot>> {
        let (ids, ledgers) = claim_and_load(conn, items).await?;
        let changes = plan_release(&ledgers, items)?;
        let snapshots = write(conn, &ids, &changes, ctx).await?;

        debug!(order_id = ?ctx.related_order_id, items = items.len(), "Stock released");
        Ok(snapshots)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Ships delivered units: physical and reserved figures both drop.
    pub async fn commit(
        &self,
        items: &[StockItem],
        order_id: &str,
        actor_id: &str,
    ) -> EngineResult<Vec<LedgerSnapshot>> {
        let ctx = MovementContext::new().order(order_id).actor(actor_id);
        self.within("commit", async {
            let mut tx = self.db.begin().await?;
            let snapshots = Self::commit_in(&mut tx, items, &ctx).await?;
            tx.commit().await?;
            Ok::<_, EngineError>(snapshots)
        })
        .await
    }

    /// Transaction form of [`commit`](Self::commit).
    pub async fn commit_in(
        conn: &mut SqliteConnection,
        items: &[StockItem],
        ctx: &MovementContext,
    ) -> EngineResult<Vec<LedgerSnapshot>> {
        let (ids, ledgers) = claim_and_load(conn, items).await?;
        let changes = plan_commit(&ledgers, items)?;
        let snapshots = write(conn, &ids, &changes, ctx).await?;

        debug!(order_id = ?ctx.related_order_id, items = items.len(), "Stock committed");
        Ok(snapshots)
    }

    // =========================================================================
    // Administrative
    // =========================================================================

    /// Restock, count correction or wastage of one product.
    ///
    /// ## Errors
    /// `InvalidAdjustment` if the result would be negative or below the
    /// reserved figure, or if `delta` is zero.
    pub async fn adjust_stock(
        &self,
        product_id: &str,
        kind: AdjustmentKind,
        delta: i64,
        reason: Option<&str>,
        actor_id: &str,
    ) -> EngineResult<LedgerSnapshot> {
        let mut ctx = MovementContext::new().actor(actor_id);
        if let Some(reason) = reason {
            ctx = ctx.reason(reason);
        }
        self.within("adjust_stock", async {
            let mut tx = self.db.begin().await?;
            let snapshot = Self::adjust_stock_in(&mut tx, product_id, kind, delta, &ctx).await?;
            tx.commit().await?;
            Ok::<_, EngineError>(snapshot)
        })
        .await
    }

    /// Transaction form of [`adjust_stock`](Self::adjust_stock).
    pub async fn adjust_stock_in(
        conn: &mut SqliteConnection,
        product_id: &str,
        kind: AdjustmentKind,
        delta: i64,
        ctx: &MovementContext,
    ) -> EngineResult<LedgerSnapshot> {
        let ledger = claim_one(conn, product_id).await?;
        let change = plan_adjustment(&ledger, kind, delta)?;
        let ids = [product_id.to_string()];
        let mut snapshots = write(conn, &ids, std::slice::from_ref(&change), ctx).await?;

        info!(
            product_id = %product_id,
            kind = %kind,
            delta,
            quantity = change.new_quantity,
            "Stock adjusted"
        );
        snapshots
            .pop()
            .ok_or_else(|| CoreError::ProductNotFound(product_id.to_string()).into())
    }

    /// Forces the availability flag. Survives later adjustments until
    /// cleared.
    pub async fn set_availability(
        &self,
        product_id: &str,
        is_in_stock: bool,
        actor_id: &str,
    ) -> EngineResult<LedgerSnapshot> {
        self.within("set_availability", async {
            let mut tx = self.db.begin().await?;
            let snapshot = Self::set_availability_in(&mut tx, product_id, is_in_stock).await?;
            tx.commit().await?;
            Ok::<_, EngineError>(snapshot)
        })
        .await
        .inspect(|_| info!(product_id = %product_id, is_in_stock, actor_id, "Availability overridden"))
    }

    /// Transaction form of [`set_availability`](Self::set_availability).
    pub async fn set_availability_in(
        conn: &mut SqliteConnection,
        product_id: &str,
        is_in_stock: bool,
    ) -> EngineResult<LedgerSnapshot> {
        claim_one(conn, product_id).await?;
        LedgerRepository::set_availability_in(conn, product_id, is_in_stock).await?;
        reload_one(conn, product_id).await
    }

    /// Drops the override; the flag follows availability again.
    pub async fn clear_availability_override(
        &self,
        product_id: &str,
        actor_id: &str,
    ) -> EngineResult<LedgerSnapshot> {
        self.within("clear_availability_override", async {
            let mut tx = self.db.begin().await?;
            claim_one(&mut tx, product_id).await?;
            LedgerRepository::clear_override_in(&mut tx, product_id).await?;
            let snapshot = reload_one(&mut tx, product_id).await?;
            tx.commit().await?;
            Ok::<_, EngineError>(snapshot)
        })
        .await
        .inspect(|s| {
            info!(
                product_id = %product_id,
                is_in_stock = s.is_in_stock,
                actor_id,
                "Availability override cleared"
            )
        })
    }

    /// Sets the low-stock and reorder thresholds.
    pub async fn set_thresholds(
        &self,
        product_id: &str,
        low_stock_threshold: i64,
        reorder_point: i64,
    ) -> EngineResult<LedgerSnapshot> {
        validate_thresholds(low_stock_threshold, reorder_point).map_err(CoreError::from)?;

        self.db
            .ledgers()
            .set_thresholds(product_id, low_stock_threshold, reorder_point)
            .await
            .map_err(|e| missing_product(e, product_id))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn snapshot(&self, product_id: &str) -> EngineResult<LedgerSnapshot> {
        self.db
            .ledgers()
            .snapshot(product_id)
            .await
            .map_err(|e| missing_product(e, product_id))
    }

    pub async fn movements_for_product(
        &self,
        product_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<StockMovement>> {
        Ok(self.db.ledgers().movements_for_product(product_id, limit).await?)
    }

    pub async fn movements_for_order(&self, order_id: &str) -> EngineResult<Vec<StockMovement>> {
        Ok(self.db.ledgers().movements_for_order(order_id).await?)
    }

    pub async fn low_stock_report(&self) -> EngineResult<Vec<LedgerSnapshot>> {
        Ok(self.db.ledgers().low_stock_report().await?)
    }
}

// =============================================================================
// Transaction Steps
// =============================================================================

/// Claims every touched row, then loads them.
async fn claim_and_load(
    conn: &mut SqliteConnection,
    items: &[StockItem],
) -> EngineResult<(Vec<String>, HashMap<String, StockLedger>)> {
    let ids = canonical_product_ids(items);
    LedgerRepository::claim_rows(conn, &ids).await?;
    let ledgers = LedgerRepository::load_rows(conn, &ids).await?;
    Ok((ids, ledgers))
}

async fn claim_one(conn: &mut SqliteConnection, product_id: &str) -> EngineResult<StockLedger> {
    let ids = [product_id.to_string()];
    if LedgerRepository::claim_rows(conn, &ids).await? == 0 {
        return Err(CoreError::ProductNotFound(product_id.to_string()).into());
    }
    LedgerRepository::get_in(conn, product_id)
        .await?
        .ok_or_else(|| CoreError::ProductNotFound(product_id.to_string()).into())
}

async fn reload_one(conn: &mut SqliteConnection, product_id: &str) -> EngineResult<LedgerSnapshot> {
    LedgerRepository::get_in(conn, product_id)
        .await?
        .map(|l| l.snapshot())
        .ok_or_else(|| CoreError::ProductNotFound(product_id.to_string()).into())
}

/// Applies planned changes and returns the post-state of each claimed row.
async fn write(
    conn: &mut SqliteConnection,
    ids: &[String],
    changes: &[LedgerChange],
    ctx: &MovementContext,
) -> EngineResult<Vec<LedgerSnapshot>> {
    LedgerRepository::apply_changes(conn, changes, ctx).await?;
    let rows = LedgerRepository::load_rows(conn, ids).await?;

    Ok(ids
        .iter()
        .filter_map(|id| rows.get(id).map(StockLedger::snapshot))
        .collect())
}

fn missing_product(err: DbError, product_id: &str) -> EngineError {
    match err {
        DbError::NotFound { .. } => CoreError::ProductNotFound(product_id.to_string()).into(),
        other => other.into(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{MovementType, NewProduct};
    use tally_db::DbConfig;

    async fn setup() -> (ReservationCoordinator, String) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let product = db
            .products()
            .insert(&NewProduct::new("RICE-5KG", "Rice 5kg", 65_000))
            .await
            .unwrap();
        let coordinator = ReservationCoordinator::new(db, Duration::from_secs(5));
        (coordinator, product.id)
    }

    #[tokio::test]
    async fn test_restock_then_reserve() {
        let (coordinator, id) = setup().await;

        let after = coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 10, Some("delivery"), "admin")
            .await
            .unwrap();
        assert_eq!(after.quantity, 10);
        assert!(after.is_in_stock);

        let snapshots = coordinator
            .reserve(&[StockItem::new(&id, 4)], "order-1", "shop-1")
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].reserved_quantity, 4);
        assert_eq!(snapshots[0].available_quantity, 6);

        let movements = coordinator.movements_for_order("order-1").await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].movement_type, MovementType::Reserved);
        assert_eq!(movements[0].actor_id.as_deref(), Some("shop-1"));
    }

    #[tokio::test]
    async fn test_duplicate_lines_see_each_other() {
        let (coordinator, id) = setup().await;
        coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 5, None, "admin")
            .await
            .unwrap();

        let err = coordinator
            .reserve(
                &[StockItem::new(&id, 3), StockItem::new(&id, 3)],
                "order-1",
                "shop-1",
            )
            .await
            .unwrap_err();

        match err {
            EngineError::Domain(CoreError::InsufficientStock {
                available,
                requested,
                ..
            }) => {
                assert_eq!(available, 2);
                assert_eq!(requested, 3);
            }
            other => panic!("expected InsufficientStock, got {other:?}"),
        }

        // first line's hold was rolled back with the rest
        let snapshot = coordinator.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.reserved_quantity, 0);
    }

    #[tokio::test]
    async fn test_release_and_commit() {
        let (coordinator, id) = setup().await;
        coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 10, None, "admin")
            .await
            .unwrap();
        coordinator
            .reserve(&[StockItem::new(&id, 6)], "order-1", "shop-1")
            .await
            .unwrap();

        let released = coordinator
            .release(&[StockItem::new(&id, 2)], "order-1", "admin", Some("partial"))
            .await
            .unwrap();
        assert_eq!(released[0].reserved_quantity, 4);

        let committed = coordinator
            .commit(&[StockItem::new(&id, 4)], "order-1", "driver-1")
            .await
            .unwrap();
        assert_eq!(committed[0].quantity, 6);
        assert_eq!(committed[0].reserved_quantity, 0);

        let kinds: Vec<MovementType> = coordinator
            .movements_for_order("order-1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.movement_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MovementType::Reserved,
                MovementType::Released,
                MovementType::Outgoing
            ]
        );
    }

    #[tokio::test]
    async fn test_adjustment_below_reserved_rejected() {
        let (coordinator, id) = setup().await;
        coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 10, None, "admin")
            .await
            .unwrap();
        coordinator
            .reserve(&[StockItem::new(&id, 8)], "order-1", "shop-1")
            .await
            .unwrap();

        let err = coordinator
            .adjust_stock(&id, AdjustmentKind::Wastage, 5, Some("expired"), "admin")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Domain(CoreError::InvalidAdjustment { .. })
        ));

        let snapshot = coordinator.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.quantity, 10);
        assert_eq!(snapshot.reserved_quantity, 8);
    }

    #[tokio::test]
    async fn test_availability_override() {
        let (coordinator, id) = setup().await;
        coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 10, None, "admin")
            .await
            .unwrap();

        let off = coordinator.set_availability(&id, false, "admin").await.unwrap();
        assert!(!off.is_in_stock);

        let err = coordinator
            .reserve(&[StockItem::new(&id, 1)], "order-1", "shop-1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::OutOfStock { .. })));

        // override holds through a restock
        let restocked = coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 5, None, "admin")
            .await
            .unwrap();
        assert!(!restocked.is_in_stock);

        let cleared = coordinator
            .clear_availability_override(&id, "admin")
            .await
            .unwrap();
        assert!(cleared.is_in_stock);
        assert_eq!(cleared.quantity, 15);
    }

    #[tokio::test]
    async fn test_release_restores_availability_after_correction() {
        let (coordinator, id) = setup().await;
        coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 10, None, "admin")
            .await
            .unwrap();
        coordinator
            .reserve(&[StockItem::new(&id, 5)], "order-1", "shop-1")
            .await
            .unwrap();

        let corrected = coordinator
            .adjust_stock(&id, AdjustmentKind::Adjustment, -5, Some("count"), "admin")
            .await
            .unwrap();
        assert_eq!(corrected.available_quantity, 0);
        assert!(!corrected.is_in_stock);

        let released = coordinator
            .release(&[StockItem::new(&id, 5)], "order-1", "shop-1", None)
            .await
            .unwrap();
        assert_eq!(released[0].available_quantity, 5);
        assert!(released[0].is_in_stock);

        let held = coordinator
            .reserve(&[StockItem::new(&id, 1)], "order-2", "shop-1")
            .await
            .unwrap();
        assert_eq!(held[0].reserved_quantity, 1);
    }

    #[tokio::test]
    async fn test_unknown_product() {
        let (coordinator, _) = setup().await;

        let err = coordinator
            .reserve(&[StockItem::new("missing", 1)], "order-1", "shop-1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::ProductNotFound(_))));

        let err = coordinator
            .set_availability("missing", true, "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::ProductNotFound(_))));

        let err = coordinator.snapshot("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::ProductNotFound(_))));
    }

    #[tokio::test]
    async fn test_thresholds_and_low_stock_report() {
        let (coordinator, id) = setup().await;
        coordinator
            .adjust_stock(&id, AdjustmentKind::Restock, 4, None, "admin")
            .await
            .unwrap();

        let snapshot = coordinator.set_thresholds(&id, 5, 2).await.unwrap();
        assert!(snapshot.is_low_stock);
        assert!(!snapshot.needs_reorder);

        let report = coordinator.low_stock_report().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].product_id, id);

        let err = coordinator.set_thresholds(&id, -1, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::Validation(_))));
    }
}
