//! # Order Repository
//!
//! Orders and their frozen lines. Applied offers are stored as a JSON
//! array on the order row.
//!
//! ## Status Updates
//! ```text
//! transition_in(order, from: Reserved, to: Released/Cancelled/Committed)
//!   UPDATE orders SET reservation_status = to, ...
//!   WHERE id = ? AND reservation_status = from
//!        │
//!        ├── 1 row  → transitioned
//!        └── 0 rows → someone else settled it first (caller reports it)
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{
    AppliedOffer, ApprovalStatus, DeliveryStatus, Order, OrderLine, PaymentMethod,
    ReservationStatus,
};

const ORDER_COLUMNS: &str = "id, orderer_id, original_price_cents, total_discount_cents, \
     total_price_cents, applied_offers, payment_method, approval_status, delivery_status, \
     reservation_status, created_at, updated_at";

const LINE_COLUMNS: &str = "id, order_id, product_id, sku_snapshot, name_snapshot, quantity, \
     unit_price_cents, line_total_cents, created_at";

/// The `orders` row before its lines are attached.
#[derive(Debug, FromRow)]
struct OrderRow {
    id: String,
    orderer_id: String,
    original_price_cents: i64,
    total_discount_cents: i64,
    total_price_cents: i64,
    applied_offers: String,
    payment_method: PaymentMethod,
    approval_status: ApprovalStatus,
    delivery_status: DeliveryStatus,
    reservation_status: ReservationStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, lines: Vec<OrderLine>) -> DbResult<Order> {
        let applied_offers: Vec<AppliedOffer> = serde_json::from_str(&self.applied_offers)?;

        Ok(Order {
            id: self.id,
            orderer_id: self.orderer_id,
            lines,
            original_price_cents: self.original_price_cents,
            total_discount_cents: self.total_discount_cents,
            total_price_cents: self.total_price_cents,
            applied_offers,
            payment_method: self.payment_method,
            approval_status: self.approval_status,
            delivery_status: self.delivery_status,
            reservation_status: self.reservation_status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// A settled order's new statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub reservation: ReservationStatus,
    pub approval: Option<ApprovalStatus>,
    pub delivery: Option<DeliveryStatus>,
}

/// Repository for order database operations.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Creates a new OrderRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    /// Inserts an order and all of its lines.
    pub async fn insert_in(conn: &mut SqliteConnection, order: &Order) -> DbResult<()> {
        debug!(
            id = %order.id,
            orderer_id = %order.orderer_id,
            lines = order.lines.len(),
            "Inserting order"
        );

        let applied_offers = serde_json::to_string(&order.applied_offers)?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, orderer_id, original_price_cents, total_discount_cents,
                total_price_cents, applied_offers, payment_method,
                approval_status, delivery_status, reservation_status,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&order.id)
        .bind(&order.orderer_id)
        .bind(order.original_price_cents)
        .bind(order.total_discount_cents)
        .bind(order.total_price_cents)
        .bind(applied_offers)
        .bind(order.payment_method)
        .bind(order.approval_status)
        .bind(order.delivery_status)
        .bind(order.reservation_status)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *conn)
        .await?;

        for line in &order.lines {
            sqlx::query(
                r#"
                INSERT INTO order_lines (
                    id, order_id, product_id, sku_snapshot, name_snapshot,
                    quantity, unit_price_cents, line_total_cents, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&line.id)
            .bind(&line.order_id)
            .bind(&line.product_id)
            .bind(&line.sku_snapshot)
            .bind(&line.name_snapshot)
            .bind(line.quantity)
            .bind(line.unit_price_cents)
            .bind(line.line_total_cents)
            .bind(line.created_at)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    /// Gets an order with its lines.
    pub async fn get(&self, id: &str) -> DbResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, id).await
    }

    /// Transaction form of [`get`](Self::get).
    pub async fn get_in(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => {
                let lines = Self::lines_in(conn, &row.id).await?;
                Ok(Some(row.into_order(lines)?))
            }
            None => Ok(None),
        }
    }

    /// Lines of one order, in insertion order.
    pub async fn lines_in(conn: &mut SqliteConnection, order_id: &str) -> DbResult<Vec<OrderLine>> {
        let lines = sqlx::query_as::<_, OrderLine>(&format!(
            "SELECT {LINE_COLUMNS} FROM order_lines WHERE order_id = ?1 ORDER BY rowid"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(lines)
    }

    /// Moves a live order to a settled reservation status.
    ///
    /// Only succeeds while the stored status still equals `from`; returns
    /// `false` if another caller settled the order first.
    pub async fn transition_in(
        conn: &mut SqliteConnection,
        order_id: &str,
        from: ReservationStatus,
        change: StatusChange,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                reservation_status = ?3,
                approval_status = COALESCE(?4, approval_status),
                delivery_status = COALESCE(?5, delivery_status),
                updated_at = ?6
            WHERE id = ?1 AND reservation_status = ?2
            "#,
        )
        .bind(order_id)
        .bind(from)
        .bind(change.reservation)
        .bind(change.approval)
        .bind(change.delivery)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        debug!(
            order_id = %order_id,
            from = %from,
            to = %change.reservation,
            applied = result.rows_affected() == 1,
            "Order reservation transition"
        );

        Ok(result.rows_affected() == 1)
    }

    /// Sets the approval status of an order whose hold is still live.
    pub async fn set_approval(&self, order_id: &str, status: ApprovalStatus) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET approval_status = ?2, updated_at = ?3
            WHERE id = ?1 AND reservation_status = 'reserved'
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Newest orders of one orderer, with lines.
    pub async fn list_for_orderer(&self, orderer_id: &str, limit: u32) -> DbResult<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;

        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE orderer_id = ?1 \
             ORDER BY created_at DESC LIMIT ?2"
        ))
        .bind(orderer_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let lines = Self::lines_in(&mut conn, &row.id).await?;
            orders.push(row.into_order(lines)?);
        }

        Ok(orders)
    }

    /// Counts orders in a reservation status.
    pub async fn count_by_reservation_status(&self, status: ReservationStatus) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE reservation_status = ?1")
                .bind(status)
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
    use tally_core::{NewProduct, OfferKind};
    use uuid::Uuid;

    async fn order_for(db: &Database) -> Order {
        let product = db
            .products()
            .insert(&NewProduct::new("OIL-1L", "Cooking Oil 1L", 32_000))
            .await
            .unwrap();
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        Order {
            id: id.clone(),
            orderer_id: "shop-42".to_string(),
            lines: vec![OrderLine {
                id: Uuid::new_v4().to_string(),
                order_id: id,
                product_id: product.id,
                sku_snapshot: product.sku,
                name_snapshot: product.name,
                quantity: 3,
                unit_price_cents: 32_000,
                line_total_cents: 96_000,
                created_at: now,
            }],
            original_price_cents: 96_000,
            total_discount_cents: 1_000,
            total_price_cents: 95_000,
            applied_offers: vec![AppliedOffer {
                offer_id: "offer-1".to_string(),
                code: Some("TEN".to_string()),
                name: "Ten off".to_string(),
                kind: OfferKind::Fixed,
                discount_cents: 1_000,
            }],
            payment_method: PaymentMethod::Mpesa,
            approval_status: ApprovalStatus::Pending,
            delivery_status: DeliveryStatus::Pending,
            reservation_status: ReservationStatus::Reserved,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_load_with_lines() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = order_for(&db).await;

        let mut tx = db.begin().await.unwrap();
        OrderRepository::insert_in(&mut tx, &order).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = db.orders().get(&order.id).await.unwrap().unwrap();
        assert_eq!(loaded.lines.len(), 1);
        assert_eq!(loaded.lines[0].quantity, 3);
        assert_eq!(loaded.applied_offers, order.applied_offers);
        assert_eq!(loaded.payment_method, PaymentMethod::Mpesa);

        let listed = db.orders().list_for_orderer("shop-42", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_rolled_back_insert_leaves_nothing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = order_for(&db).await;

        let mut tx = db.begin().await.unwrap();
        OrderRepository::insert_in(&mut tx, &order).await.unwrap();
        drop(tx);

        assert!(db.orders().get(&order.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_only_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = order_for(&db).await;
        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert_in(&mut conn, &order).await.unwrap();

        let cancel = StatusChange {
            reservation: ReservationStatus::Cancelled,
            approval: None,
            delivery: Some(DeliveryStatus::Cancelled),
        };
        let first = OrderRepository::transition_in(
            &mut conn,
            &order.id,
            ReservationStatus::Reserved,
            cancel,
        )
        .await
        .unwrap();
        let second = OrderRepository::transition_in(
            &mut conn,
            &order.id,
            ReservationStatus::Reserved,
            cancel,
        )
        .await
        .unwrap();
        drop(conn);

        assert!(first);
        assert!(!second);

        let loaded = db.orders().get(&order.id).await.unwrap().unwrap();
        assert_eq!(loaded.reservation_status, ReservationStatus::Cancelled);
        assert_eq!(loaded.delivery_status, DeliveryStatus::Cancelled);
        assert_eq!(loaded.approval_status, ApprovalStatus::Pending);

        // settled orders can no longer be approved
        assert!(!db.orders().set_approval(&order.id, ApprovalStatus::Approved).await.unwrap());
        assert_eq!(
            db.orders()
                .count_by_reservation_status(ReservationStatus::Cancelled)
                .await
                .unwrap(),
            1
        );
    }
}
