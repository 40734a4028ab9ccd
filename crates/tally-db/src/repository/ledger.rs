//! # Stock Ledger Repository
//!
//! Storage half of the reservation coordinator: claims ledger rows, loads
//! them, and writes planned [`LedgerChange`]s together with their movement
//! entries. The planning itself lives in `tally_core::ledger`.
//!
//! ## Transaction Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BEGIN                                                                  │
//! │   1. claim_rows   UPDATE stock_ledgers SET version = version + 1        │
//! │                   WHERE product_id = ?   (ascending id, once each)      │
//! │                   ── takes the SQLite write lock before any read ──     │
//! │   2. load_rows    SELECT ... WHERE product_id IN (...)                  │
//! │   3. plan_*       pure, in tally-core                                   │
//! │   4. apply_changes                                                      │
//! │        UPDATE stock_ledgers SET quantity, reserved_quantity, ...        │
//! │          WHERE product_id = ? AND quantity = prev AND reserved = prev   │
//! │        INSERT INTO stock_movements (...)                                │
//! │  COMMIT            (drop without commit = rollback)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The figures are written as absolute values guarded by the previous
//! figures, so a row that moved after it was loaded fails with
//! `TransactionConflict` instead of being overwritten.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{LedgerChange, LedgerSnapshot, StockLedger, StockMovement};

const LEDGER_COLUMNS: &str = "product_id, quantity, reserved_quantity, is_in_stock, \
     availability_override, low_stock_threshold, reorder_point, version, last_updated_at";

const MOVEMENT_COLUMNS: &str = "id, product_id, movement_type, quantity_delta, \
     previous_quantity, new_quantity, previous_reserved, new_reserved, reason, \
     related_order_id, actor_id, created_at";

// =============================================================================
// Movement Context
// =============================================================================

/// Who and what a batch of movements is attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementContext {
    pub related_order_id: Option<String>,
    pub actor_id: Option<String>,
    pub reason: Option<String>,
}

impl MovementContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order(mut self, order_id: impl Into<String>) -> Self {
        self.related_order_id = Some(order_id.into());
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for stock ledger rows and the movement log.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    /// Creates a new LedgerRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LedgerRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Transaction primitives
    // -------------------------------------------------------------------------

    /// Creates the zero-valued row for a new product.
    pub async fn insert_empty_in(
        conn: &mut SqliteConnection,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let empty = StockLedger::empty(product_id, now);

        sqlx::query(
            r#"
            INSERT INTO stock_ledgers (
                product_id, quantity, reserved_quantity, is_in_stock,
                availability_override, low_stock_threshold, reorder_point,
                version, last_updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&empty.product_id)
        .bind(empty.quantity)
        .bind(empty.reserved_quantity)
        .bind(empty.is_in_stock)
        .bind(empty.availability_override)
        .bind(empty.low_stock_threshold)
        .bind(empty.reorder_point)
        .bind(empty.version)
        .bind(empty.last_updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Claims rows for the current transaction by bumping their version.
    ///
    /// `product_ids` must already be in canonical order (sorted, unique),
    /// as produced by `tally_core::ledger::canonical_product_ids`. Returns
    /// how many rows exist; ids without a row are left for the planner to
    /// report as `ProductNotFound`.
    pub async fn claim_rows(conn: &mut SqliteConnection, product_ids: &[String]) -> DbResult<u64> {
        let mut claimed = 0;

        for product_id in product_ids {
            let result =
                sqlx::query("UPDATE stock_ledgers SET version = version + 1 WHERE product_id = ?1")
                    .bind(product_id)
                    .execute(&mut *conn)
                    .await?;
            claimed += result.rows_affected();
        }

        debug!(requested = product_ids.len(), claimed, "Claimed ledger rows");
        Ok(claimed)
    }

    /// Loads ledger rows keyed by product id.
    pub async fn load_rows(
        conn: &mut SqliteConnection,
        product_ids: &[String],
    ) -> DbResult<HashMap<String, StockLedger>> {
        if product_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledgers WHERE product_id IN ("
        ));
        let mut separated = qb.separated(", ");
        for id in product_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let rows = qb
            .build_query_as::<StockLedger>()
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.into_iter().map(|r| (r.product_id.clone(), r)).collect())
    }

    /// Writes planned changes and appends one movement per change.
    ///
    /// Changes for the same product must be in the order they were planned;
    /// each one's previous figures are the prior one's new figures.
    pub async fn apply_changes(
        conn: &mut SqliteConnection,
        changes: &[LedgerChange],
        ctx: &MovementContext,
    ) -> DbResult<Vec<StockMovement>> {
        let now = Utc::now();
        let mut movements = Vec::with_capacity(changes.len());

        for change in changes {
            let result = sqlx::query(
                r#"
                UPDATE stock_ledgers SET
                    quantity = ?2,
                    reserved_quantity = ?3,
                    is_in_stock = ?4,
                    last_updated_at = ?5
                WHERE product_id = ?1
                  AND quantity = ?6
                  AND reserved_quantity = ?7
                "#,
            )
            .bind(&change.product_id)
            .bind(change.new_quantity)
            .bind(change.new_reserved)
            .bind(change.is_in_stock)
            .bind(now)
            .bind(change.previous_quantity)
            .bind(change.previous_reserved)
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() == 0 {
                return Err(DbError::conflict(format!(
                    "ledger row {} changed after it was loaded",
                    change.product_id
                )));
            }

            let movement = Self::append_movement(conn, change, ctx, now).await?;
            debug!(
                product_id = %change.product_id,
                movement = %change.movement_type,
                delta = change.quantity_delta,
                "Applied ledger change"
            );
            movements.push(movement);
        }

        Ok(movements)
    }

    async fn append_movement(
        conn: &mut SqliteConnection,
        change: &LedgerChange,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> DbResult<StockMovement> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_movements (
                product_id, movement_type, quantity_delta,
                previous_quantity, new_quantity, previous_reserved, new_reserved,
                reason, related_order_id, actor_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&change.product_id)
        .bind(change.movement_type)
        .bind(change.quantity_delta)
        .bind(change.previous_quantity)
        .bind(change.new_quantity)
        .bind(change.previous_reserved)
        .bind(change.new_reserved)
        .bind(&ctx.reason)
        .bind(&ctx.related_order_id)
        .bind(&ctx.actor_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(StockMovement {
            id: result.last_insert_rowid(),
            product_id: change.product_id.clone(),
            movement_type: change.movement_type,
            quantity_delta: change.quantity_delta,
            previous_quantity: change.previous_quantity,
            new_quantity: change.new_quantity,
            previous_reserved: change.previous_reserved,
            new_reserved: change.new_reserved,
            reason: ctx.reason.clone(),
            related_order_id: ctx.related_order_id.clone(),
            actor_id: ctx.actor_id.clone(),
            created_at: now,
        })
    }

    /// Forces the availability flag and marks it as an operator override.
    ///
    /// No figure changes, so no movement is written. The row must already
    /// be claimed.
    pub async fn set_availability_in(
        conn: &mut SqliteConnection,
        product_id: &str,
        is_in_stock: bool,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stock_ledgers SET
                is_in_stock = ?2,
                availability_override = 1,
                last_updated_at = ?3
            WHERE product_id = ?1
            "#,
        )
        .bind(product_id)
        .bind(is_in_stock)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("StockLedger", product_id));
        }

        Ok(())
    }

    /// Drops the operator override and derives the flag from availability.
    pub async fn clear_override_in(conn: &mut SqliteConnection, product_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stock_ledgers SET
                is_in_stock = (quantity - reserved_quantity) > 0,
                availability_override = 0,
                last_updated_at = ?2
            WHERE product_id = ?1
            "#,
        )
        .bind(product_id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("StockLedger", product_id));
        }

        Ok(())
    }

    /// Reads one row on an explicit connection.
    pub async fn get_in(
        conn: &mut SqliteConnection,
        product_id: &str,
    ) -> DbResult<Option<StockLedger>> {
        let ledger = sqlx::query_as::<_, StockLedger>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledgers WHERE product_id = ?1"
        ))
        .bind(product_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(ledger)
    }

    // -------------------------------------------------------------------------
    // Pool reads and threshold edits
    // -------------------------------------------------------------------------

    /// Gets one product's ledger row.
    pub async fn get(&self, product_id: &str) -> DbResult<Option<StockLedger>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, product_id).await
    }

    /// Full derived view of one row.
    pub async fn snapshot(&self, product_id: &str) -> DbResult<LedgerSnapshot> {
        self.get(product_id)
            .await?
            .map(|l| l.snapshot())
            .ok_or_else(|| DbError::not_found("StockLedger", product_id))
    }

    /// Sets alerting thresholds. These are not stock figures, so no
    /// movement is written. Negative values fail the schema CHECK.
    pub async fn set_thresholds(
        &self,
        product_id: &str,
        low_stock_threshold: i64,
        reorder_point: i64,
    ) -> DbResult<LedgerSnapshot> {
        let result = sqlx::query(
            r#"
            UPDATE stock_ledgers SET
                low_stock_threshold = ?2,
                reorder_point = ?3,
                last_updated_at = ?4
            WHERE product_id = ?1
            "#,
        )
        .bind(product_id)
        .bind(low_stock_threshold)
        .bind(reorder_point)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("StockLedger", product_id));
        }

        self.snapshot(product_id).await
    }

    /// Newest-first movements of one product.
    pub async fn movements_for_product(
        &self,
        product_id: &str,
        limit: u32,
    ) -> DbResult<Vec<StockMovement>> {
        let movements = sqlx::query_as::<_, StockMovement>(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements \
             WHERE product_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))
        .bind(product_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(movements)
    }

    /// Every movement tagged with an order, oldest first.
    pub async fn movements_for_order(&self, order_id: &str) -> DbResult<Vec<StockMovement>> {
        let mut conn = self.pool.acquire().await?;
        Self::movements_for_order_in(&mut conn, order_id).await
    }

    /// Transaction form of [`movements_for_order`](Self::movements_for_order).
    pub async fn movements_for_order_in(
        conn: &mut SqliteConnection,
        order_id: &str,
    ) -> DbResult<Vec<StockMovement>> {
        let movements = sqlx::query_as::<_, StockMovement>(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements \
             WHERE related_order_id = ?1 ORDER BY id"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(movements)
    }

    /// Rows at or below their low-stock threshold, least available first.
    pub async fn low_stock_report(&self) -> DbResult<Vec<LedgerSnapshot>> {
        let rows = sqlx::query_as::<_, StockLedger>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledgers \
             WHERE (quantity - reserved_quantity) <= low_stock_threshold \
             ORDER BY (quantity - reserved_quantity), product_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(StockLedger::snapshot).collect())
    }

    /// Counts rows that break `quantity ≥ reserved_quantity ≥ 0`.
    ///
    /// The schema CHECKs make this zero; the engine uses it as a cheap
    /// health check after bulk operations.
    pub async fn count_inconsistent(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM stock_ledgers \
             WHERE reserved_quantity < 0 OR quantity < reserved_quantity",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tally_core::ledger::{plan_adjustment, plan_reservation, StockItem};
    use tally_core::{AdjustmentKind, MovementType, NewProduct};

    async fn setup() -> (Database, String) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let product = db
            .products()
            .insert(&NewProduct::new("RICE-5KG", "Rice 5kg", 75_000))
            .await
            .unwrap();
        (db, product.id)
    }

    async fn restock(db: &Database, product_id: &str, units: i64) {
        let mut tx = db.begin().await.unwrap();
        let ids = vec![product_id.to_string()];
        LedgerRepository::claim_rows(&mut tx, &ids).await.unwrap();
        let rows = LedgerRepository::load_rows(&mut tx, &ids).await.unwrap();
        let change = plan_adjustment(&rows[product_id], AdjustmentKind::Restock, units).unwrap();
        LedgerRepository::apply_changes(&mut tx, &[change], &MovementContext::new().actor("admin"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_bumps_version() {
        let (db, id) = setup().await;
        let ids = vec![id.clone(), "missing".to_string()];

        let mut tx = db.begin().await.unwrap();
        let claimed = LedgerRepository::claim_rows(&mut tx, &ids).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(claimed, 1);
        assert_eq!(db.ledgers().get(&id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_apply_writes_figures_and_movement() {
        let (db, id) = setup().await;
        restock(&db, &id, 10).await;

        let mut tx = db.begin().await.unwrap();
        let ids = vec![id.clone()];
        LedgerRepository::claim_rows(&mut tx, &ids).await.unwrap();
        let rows = LedgerRepository::load_rows(&mut tx, &ids).await.unwrap();
        let changes = plan_reservation(&rows, &[StockItem::new(id.clone(), 7)]).unwrap();
        let ctx = MovementContext::new().order("order-1").actor("shop-1");
        let movements = LedgerRepository::apply_changes(&mut tx, &changes, &ctx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].movement_type, MovementType::Reserved);

        let snapshot = db.ledgers().snapshot(&id).await.unwrap();
        assert_eq!(snapshot.quantity, 10);
        assert_eq!(snapshot.reserved_quantity, 7);
        assert_eq!(snapshot.available_quantity, 3);

        let for_order = db.ledgers().movements_for_order("order-1").await.unwrap();
        assert_eq!(for_order.len(), 1);
        assert_eq!(for_order[0].quantity_delta, 7);
        assert_eq!(for_order[0].actor_id.as_deref(), Some("shop-1"));

        let history = db.ledgers().movements_for_product(&id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].movement_type, MovementType::Reserved); // newest first
        assert_eq!(history[1].movement_type, MovementType::Restock);
    }

    #[tokio::test]
    async fn test_stale_change_is_a_conflict() {
        let (db, id) = setup().await;
        restock(&db, &id, 10).await;

        let stale = {
            let mut conn = db.pool().acquire().await.unwrap();
            let rows = LedgerRepository::load_rows(&mut conn, &[id.clone()])
                .await
                .unwrap();
            plan_reservation(&rows, &[StockItem::new(id.clone(), 2)]).unwrap()
        };

        restock(&db, &id, 5).await;

        let mut tx = db.begin().await.unwrap();
        let err = LedgerRepository::apply_changes(&mut tx, &stale, &MovementContext::new())
            .await
            .unwrap_err();
        drop(tx);

        assert!(err.is_transient());
        assert_eq!(db.ledgers().get(&id).await.unwrap().unwrap().reserved_quantity, 0);
    }

    #[tokio::test]
    async fn test_availability_override_round_trip() {
        let (db, id) = setup().await;
        restock(&db, &id, 4).await;

        let mut conn = db.pool().acquire().await.unwrap();
        LedgerRepository::set_availability_in(&mut conn, &id, false)
            .await
            .unwrap();
        let row = LedgerRepository::get_in(&mut conn, &id).await.unwrap().unwrap();
        assert!(!row.is_in_stock);
        assert!(row.availability_override);

        LedgerRepository::clear_override_in(&mut conn, &id).await.unwrap();
        let row = LedgerRepository::get_in(&mut conn, &id).await.unwrap().unwrap();
        assert!(row.is_in_stock);
        assert!(!row.availability_override);
        drop(conn);

        // no figures moved, so only the restock is in the log
        assert_eq!(db.ledgers().movements_for_product(&id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_thresholds_and_low_stock_report() {
        let (db, id) = setup().await;
        restock(&db, &id, 3).await;

        let snapshot = db.ledgers().set_thresholds(&id, 5, 2).await.unwrap();
        assert!(snapshot.is_low_stock);
        assert!(!snapshot.needs_reorder);

        let report = db.ledgers().low_stock_report().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].product_id, id);

        let err = db.ledgers().set_thresholds(&id, -1, 0).await.unwrap_err();
        assert!(matches!(err, DbError::CheckViolation { .. }));
        assert_eq!(db.ledgers().count_inconsistent().await.unwrap(), 0);
    }
}
