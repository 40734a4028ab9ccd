//! # Order Assembly
//!
//! Turns an order request into a persisted order whose stock is held.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  place_order(request)                                                   │
//! │                                                                         │
//! │  Validating   shape checks, products exist + active, ledger rows,      │
//! │      │        reservation pre-check             (read only, no tx)     │
//! │      ▼                                                                  │
//! │  Pricing      price lines, evaluate offers      (read only, no tx)     │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  Reserving    BEGIN                                                     │
//! │      │          reserve_in        claims rows first, authoritative     │
//! │      │          re-price + offers on the same transaction              │
//! │      │          insert order + lines                                   │
//! │      │        COMMIT                                                    │
//! │      │        transient failure → backoff, retry (max_conflict_retries)│
//! │      │        exhausted         → PersistenceFailure                   │
//! │      ▼                                                                  │
//! │  Persisted    enqueue offer usage, return order + savings              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle transitions (reject, cancel, deliver) settle the hold of a
//! `reserved` order exactly once: the conditional status update is the
//! first write of their transaction, and the ledger release or commit
//! rides in the same commit.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tally_core::ledger::{canonical_product_ids, plan_reservation};
use tally_core::order::{candidate_for, price_lines, AssemblyStage, PricedLine};
use tally_core::{
    ApprovalStatus, CoreError, DeliveryStatus, MovementType, OfferUsage, Order, OrderLine,
    OrderRequest, ReservationStatus, SavingsBreakdown, StockItem, StockMovement,
};
use tally_db::repository::order::StatusChange;
use tally_db::{
    Database, DbError, LedgerRepository, MovementContext, OrderRepository, ProductRepository,
    SqliteConnection,
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::offers::OfferEvaluator;
use crate::reservation::ReservationCoordinator;
use crate::usage::UsageHandle;

// =============================================================================
// Results
// =============================================================================

/// A placed order and how its price was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedOrder {
    pub order: Order,
    pub savings: SavingsBreakdown,
}

/// Movement totals of one product of an order, against what the order's
/// status implies they should be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineReconciliation {
    pub product_id: String,
    /// Units ordered across every line of this product.
    pub ordered: i64,
    pub reserved: i64,
    pub released: i64,
    pub committed: i64,
    /// Movement entries per type, for spotting repeated calls.
    pub reserved_entries: usize,
    pub released_entries: usize,
    pub outgoing_entries: usize,
    pub mismatches: Vec<String>,
}

impl LineReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub order_id: String,
    pub reservation_status: ReservationStatus,
    pub lines: Vec<LineReconciliation>,
    /// Movements tagged with the order for products it does not contain.
    pub stray_movements: Vec<i64>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.stray_movements.is_empty() && self.lines.iter().all(|l| l.is_consistent())
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// How often order assembly re-runs its transaction after a transient
/// storage failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_conflict_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_conflict_retries: 2,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Everything pricing produces for one attempt.
struct Priced {
    lines: Vec<PricedLine>,
    savings: SavingsBreakdown,
}

// =============================================================================
// Order Assembly
// =============================================================================

#[derive(Clone)]
pub struct OrderAssembly {
    db: Database,
    coordinator: ReservationCoordinator,
    usage: UsageHandle,
    retry: RetryPolicy,
}

impl OrderAssembly {
    pub fn new(
        db: Database,
        coordinator: ReservationCoordinator,
        usage: UsageHandle,
        retry: RetryPolicy,
    ) -> Self {
        OrderAssembly {
            db,
            coordinator,
            usage,
            retry,
        }
    }

    /// Validates, prices, reserves and persists an order.
    ///
    /// ## Errors
    /// - `Validation`, `ProductNotFound`, `ProductInactive`
    /// - `OutOfStock` / `InsufficientStock` with every shortfall
    /// - `InvalidOfferCode` / `OfferNotEligible` for a refused code
    /// - `PersistenceFailure` once transient conflicts outlast the retries
    ///
    /// None of these leave a ledger mutation or an order row behind.
    #[instrument(
        skip(self, request),
        fields(orderer_id = %request.orderer_id, lines = request.items.len())
    )]
    pub async fn place_order(&self, request: OrderRequest) -> EngineResult<PlacedOrder> {
        self.validate(&request)
            .instrument(info_span!("stage", stage = %AssemblyStage::Validating))
            .await?;

        let preview = self
            .preview_pricing(&request)
            .instrument(info_span!("stage", stage = %AssemblyStage::Pricing))
            .await?;
        debug!(
            original = preview.savings.original_price_cents,
            discount = preview.savings.discount_cents,
            "Order priced"
        );

        let order_id = Uuid::new_v4().to_string();
        let placed = self
            .persist_with_retry(&order_id, &request)
            .instrument(info_span!("stage", stage = %AssemblyStage::Reserving, order_id = %order_id))
            .await?;

        let queued = self.enqueue_usage(&placed.order);
        info!(
            stage = %AssemblyStage::Persisted,
            order_id = %placed.order.id,
            total = placed.order.total_price_cents,
            discount = placed.order.total_discount_cents,
            usage_records = queued,
            "Order placed"
        );

        Ok(placed)
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Read-only checks that fail fast before any transaction opens.
    async fn validate(&self, request: &OrderRequest) -> EngineResult<()> {
        request.validate()?;

        let items = request_items(request);
        let ids = canonical_product_ids(&items);

        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        let products = ProductRepository::get_many_in(&mut conn, &ids).await?;
        price_lines(&request.items, &products)?;

        let ledgers = LedgerRepository::load_rows(&mut conn, &ids).await?;
        plan_reservation(&ledgers, &items)?;

        debug!("Order request valid");
        Ok(())
    }

    /// Pricing outside the transaction, so a refused offer code fails the
    /// order before any row is claimed.
    async fn preview_pricing(&self, request: &OrderRequest) -> EngineResult<Priced> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        let ids = canonical_product_ids(&request_items(request));
        price_in(&mut conn, request, &ids, Utc::now()).await
    }

    async fn persist_with_retry(
        &self,
        order_id: &str,
        request: &OrderRequest,
    ) -> EngineResult<PlacedOrder> {
        let mut backoff = self.retry.create_backoff();
        let tx_timeout = self.coordinator.transaction_timeout();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(tx_timeout, self.persist(order_id, request)).await
            {
                Ok(result) => result,
                Err(_) => Err(DbError::TransactionTimeout {
                    timeout_ms: tx_timeout.as_millis() as u64,
                }
                .into()),
            };

            match result {
                Ok(placed) => return Ok(placed),
                Err(e) if e.is_transient() && attempt <= self.retry.max_conflict_retries => {
                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_backoff);
                    warn!(attempt, error = %e, ?delay, "Transient conflict, retrying order");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Giving up on order after transient conflicts");
                    return Err(EngineError::PersistenceFailure {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: a single transaction holding the reservation and the
    /// order rows.
    async fn persist(&self, order_id: &str, request: &OrderRequest) -> EngineResult<PlacedOrder> {
        let now = Utc::now();
        let items = request_items(request);
        let ids = canonical_product_ids(&items);
        let ctx = MovementContext::new()
            .order(order_id)
            .actor(request.orderer_id.as_str());

        let mut tx = self.db.begin().await?;

        ReservationCoordinator::reserve_in(&mut tx, &items, &ctx).await?;

        let priced = price_in(&mut tx, request, &ids, now).await?;
        let order = build_order(order_id, request, &priced, now);
        OrderRepository::insert_in(&mut tx, &order).await?;

        tx.commit().await?;

        Ok(PlacedOrder {
            order,
            savings: priced.savings,
        })
    }

    fn enqueue_usage(&self, order: &Order) -> usize {
        let usages =
            OfferUsage::for_order(&order.id, &order.orderer_id, &order.applied_offers, Utc::now());
        usages
            .into_iter()
            .filter(|usage| self.usage.enqueue(usage.clone()))
            .count()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn get_order(&self, order_id: &str) -> EngineResult<Order> {
        self.db
            .orders()
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::OrderNotFound(order_id.to_string()).into())
    }

    pub async fn list_orders(&self, orderer_id: &str, limit: u32) -> EngineResult<Vec<Order>> {
        Ok(self.db.orders().list_for_orderer(orderer_id, limit).await?)
    }

    /// Marks a live order approved. Stock is untouched.
    pub async fn approve_order(&self, order_id: &str, actor_id: &str) -> EngineResult<Order> {
        if !self
            .db
            .orders()
            .set_approval(order_id, ApprovalStatus::Approved)
            .await?
        {
            let order = self.get_order(order_id).await?;
            return Err(CoreError::InvalidOrderStatus {
                order_id: order.id,
                current_status: order.reservation_status.to_string(),
            }
            .into());
        }

        info!(order_id = %order_id, actor_id = %actor_id, "Order approved");
        self.get_order(order_id).await
    }

    /// Refuses the order and returns its held stock.
    pub async fn reject_order(
        &self,
        order_id: &str,
        actor_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<Order> {
        let change = StatusChange {
            reservation: ReservationStatus::Released,
            approval: Some(ApprovalStatus::Rejected),
            delivery: None,
        };
        self.settle(order_id, actor_id, change, reason.or(Some("order rejected")))
            .await
    }

    /// Cancels the order and returns its held stock.
    pub async fn cancel_order(
        &self,
        order_id: &str,
        actor_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<Order> {
        let change = StatusChange {
            reservation: ReservationStatus::Cancelled,
            approval: None,
            delivery: Some(DeliveryStatus::Cancelled),
        };
        self.settle(order_id, actor_id, change, reason.or(Some("order cancelled")))
            .await
    }

    /// Delivers the order: its units leave stock for good.
    pub async fn deliver_order(&self, order_id: &str, actor_id: &str) -> EngineResult<Order> {
        let change = StatusChange {
            reservation: ReservationStatus::Committed,
            approval: None,
            delivery: Some(DeliveryStatus::Delivered),
        };
        self.settle(order_id, actor_id, change, None).await
    }

    #[instrument(skip(self, change), fields(to = %change.reservation))]
    async fn settle(
        &self,
        order_id: &str,
        actor_id: &str,
        change: StatusChange,
        reason: Option<&str>,
    ) -> EngineResult<Order> {
        let tx_timeout = self.coordinator.transaction_timeout();

        let settled = tokio::time::timeout(tx_timeout, async {
            let mut tx = self.db.begin().await?;

            let moved =
                OrderRepository::transition_in(&mut tx, order_id, ReservationStatus::Reserved, change)
                    .await?;
            if !moved {
                return Err(refused(&mut tx, order_id).await);
            }

            let lines = OrderRepository::lines_in(&mut tx, order_id).await?;
            let items: Vec<StockItem> = lines
                .iter()
                .map(|l| StockItem::new(l.product_id.as_str(), l.quantity))
                .collect();

            let mut ctx = MovementContext::new().order(order_id).actor(actor_id);
            if let Some(reason) = reason {
                ctx = ctx.reason(reason);
            }

            match change.reservation {
                ReservationStatus::Committed => {
                    ReservationCoordinator::commit_in(&mut tx, &items, &ctx).await?;
                }
                _ => {
                    ReservationCoordinator::release_in(&mut tx, &items, &ctx).await?;
                }
            }

            tx.commit().await?;
            Ok::<_, EngineError>(())
        })
        .await;

        match settled {
            Ok(result) => result?,
            Err(_) => {
                return Err(DbError::TransactionTimeout {
                    timeout_ms: tx_timeout.as_millis() as u64,
                }
                .into())
            }
        }

        info!(order_id = %order_id, actor_id = %actor_id, "Order settled");
        self.get_order(order_id).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Compares an order's lines with the movements tagged with it.
    ///
    /// ## Expected Totals per Status
    /// ```text
    /// reserved   reserved = ordered   released = 0         committed = 0
    /// committed  reserved = ordered   released = 0         committed = ordered
    /// released   reserved = ordered   released = ordered   committed = 0
    /// cancelled  (same as released)
    /// ```
    /// Anything else, such as a second commit issued directly through the
    /// coordinator, shows up as a mismatch.
    pub async fn reconcile_order(&self, order_id: &str) -> EngineResult<ReconciliationReport> {
        let order = self.get_order(order_id).await?;
        let movements = self.coordinator.movements_for_order(order_id).await?;

        let report = reconcile(&order, &movements);
        if !report.is_consistent() {
            warn!(order_id = %order_id, "Order movements do not match its lines");
        }
        Ok(report)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn request_items(request: &OrderRequest) -> Vec<StockItem> {
    request
        .items
        .iter()
        .map(|i| StockItem::new(i.product_id.as_str(), i.quantity))
        .collect()
}

/// Prices lines at current product prices and runs the offer evaluator.
async fn price_in(
    conn: &mut SqliteConnection,
    request: &OrderRequest,
    product_ids: &[String],
    now: DateTime<Utc>,
) -> EngineResult<Priced> {
    let products = ProductRepository::get_many_in(conn, product_ids).await?;
    let lines = price_lines(&request.items, &products)?;
    let candidate = candidate_for(&lines);

    let evaluation = OfferEvaluator::evaluate_in(
        conn,
        &candidate,
        &request.orderer_id,
        request.offer_code.as_deref(),
        now,
    )
    .await?
    .into_result()?;

    let savings = SavingsBreakdown::settle(candidate.subtotal, &evaluation);
    Ok(Priced { lines, savings })
}

fn build_order(order_id: &str, request: &OrderRequest, priced: &Priced, now: DateTime<Utc>) -> Order {
    let lines = priced
        .lines
        .iter()
        .map(|l| OrderLine {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            product_id: l.product_id.clone(),
            sku_snapshot: l.sku.clone(),
            name_snapshot: l.name.clone(),
            quantity: l.quantity,
            unit_price_cents: l.unit_price.cents(),
            line_total_cents: l.line_total.cents(),
            created_at: now,
        })
        .collect();

    Order {
        id: order_id.to_string(),
        orderer_id: request.orderer_id.trim().to_string(),
        lines,
        original_price_cents: priced.savings.original_price_cents,
        total_discount_cents: priced.savings.discount_cents,
        total_price_cents: priced.savings.final_price_cents,
        applied_offers: priced.savings.applied_offers.clone(),
        payment_method: request.payment_method,
        approval_status: ApprovalStatus::Pending,
        delivery_status: DeliveryStatus::Pending,
        reservation_status: ReservationStatus::Reserved,
        created_at: now,
        updated_at: now,
    }
}

/// Why a conditional transition touched no row.
async fn refused(conn: &mut SqliteConnection, order_id: &str) -> EngineError {
    match OrderRepository::get_in(conn, order_id).await {
        Ok(Some(order)) => CoreError::InvalidOrderStatus {
            order_id: order.id,
            current_status: order.reservation_status.to_string(),
        }
        .into(),
        Ok(None) => CoreError::OrderNotFound(order_id.to_string()).into(),
        Err(e) => e.into(),
    }
}

fn reconcile(order: &Order, movements: &[StockMovement]) -> ReconciliationReport {
    let mut by_product: Vec<LineReconciliation> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut line_counts: HashMap<&str, usize> = HashMap::new();

    for line in &order.lines {
        *line_counts.entry(line.product_id.as_str()).or_default() += 1;
        match index.get(line.product_id.as_str()) {
            Some(&i) => by_product[i].ordered += line.quantity,
            None => {
                index.insert(line.product_id.as_str(), by_product.len());
                by_product.push(LineReconciliation {
                    product_id: line.product_id.clone(),
                    ordered: line.quantity,
                    reserved: 0,
                    released: 0,
                    committed: 0,
                    reserved_entries: 0,
                    released_entries: 0,
                    outgoing_entries: 0,
                    mismatches: Vec::new(),
                });
            }
        }
    }

    let mut stray_movements = Vec::new();
    for movement in movements {
        let Some(&i) = index.get(movement.product_id.as_str()) else {
            stray_movements.push(movement.id);
            continue;
        };
        let line = &mut by_product[i];
        match movement.movement_type {
            MovementType::Reserved => {
                line.reserved += movement.new_reserved - movement.previous_reserved;
                line.reserved_entries += 1;
            }
            MovementType::Released => {
                line.released += movement.previous_reserved - movement.new_reserved;
                line.released_entries += 1;
            }
            MovementType::Outgoing => {
                line.committed += movement.previous_quantity - movement.new_quantity;
                line.outgoing_entries += 1;
            }
            MovementType::Restock | MovementType::Adjustment | MovementType::Wastage => {
                stray_movements.push(movement.id);
            }
        }
    }

    let status = order.reservation_status;
    for line in &mut by_product {
        let entries = line_counts
            .get(line.product_id.as_str())
            .copied()
            .unwrap_or(0);
        let (want_released, want_committed) = match status {
            ReservationStatus::Reserved => (0, 0),
            ReservationStatus::Committed => (0, line.ordered),
            ReservationStatus::Released | ReservationStatus::Cancelled => (line.ordered, 0),
        };

        let mut mismatches = Vec::new();
        compare(&mut mismatches, "reserved", line.reserved, line.ordered);
        compare(&mut mismatches, "released", line.released, want_released);
        compare(&mut mismatches, "committed", line.committed, want_committed);
        line.mismatches = mismatches;

        let want_release_entries = if want_released > 0 { entries } else { 0 };
        let want_outgoing_entries = if want_committed > 0 { entries } else { 0 };
        if line.released_entries > want_release_entries {
            line.mismatches.push(format!(
                "released entries: expected {want_release_entries}, found {}",
                line.released_entries
            ));
        }
        if line.outgoing_entries > want_outgoing_entries {
            line.mismatches.push(format!(
                "outgoing entries: expected {want_outgoing_entries}, found {}",
                line.outgoing_entries
            ));
        }
    }

    ReconciliationReport {
        order_id: order.id.clone(),
        reservation_status: status,
        lines: by_product,
        stray_movements,
    }
}

fn compare(mismatches: &mut Vec<String>, what: &str, got: i64, want: i64) {
    if got != want {
        mismatches.push(format!("{what}: expected {want}, found {got}"));
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{UsageRecorder, UsageRecorderConfig};
    use tally_core::{AdjustmentKind, NewOffer, NewProduct, OrderItemRequest, PaymentMethod};
    use tally_db::DbConfig;

    struct Fixture {
        db: Database,
        coordinator: ReservationCoordinator,
        usage: UsageHandle,
        assembly: OrderAssembly,
    }

    async fn fixture() -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let coordinator = ReservationCoordinator::new(db.clone(), Duration::from_secs(5));
        let usage = UsageRecorder::new(UsageRecorderConfig::default(), db.offers()).start();
        let assembly = OrderAssembly::new(
            db.clone(),
            coordinator.clone(),
            usage.clone(),
            RetryPolicy::default(),
        );
        Fixture {
            db,
            coordinator,
            usage,
            assembly,
        }
    }

    async fn stocked(f: &Fixture, sku: &str, price_cents: i64, quantity: i64) -> String {
        let product = f
            .db
            .products()
            .insert(&NewProduct::new(sku, sku, price_cents))
            .await
            .unwrap();
        f.coordinator
            .adjust_stock(&product.id, AdjustmentKind::Restock, quantity, None, "admin")
            .await
            .unwrap();
        product.id
    }

    fn request(items: &[(&str, i64)], code: Option<&str>) -> OrderRequest {
        OrderRequest {
            orderer_id: "shop-1".to_string(),
            items: items
                .iter()
                .map(|(id, q)| OrderItemRequest {
                    product_id: id.to_string(),
                    quantity: *q,
                })
                .collect(),
            payment_method: PaymentMethod::CashOnDelivery,
            offer_code: code.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_place_order_reserves_and_prices() {
        let f = fixture().await;
        let a = stocked(&f, "A-1", 1_000, 10).await;
        let b = stocked(&f, "B-1", 2_500, 4).await;

        let placed = f
            .assembly
            .place_order(request(&[(&a, 3), (&b, 2)], None))
            .await
            .unwrap();

        assert_eq!(placed.order.lines.len(), 2);
        assert_eq!(placed.savings.original_price_cents, 8_000);
        assert_eq!(placed.savings.final_price_cents, 8_000);
        assert_eq!(placed.order.reservation_status, ReservationStatus::Reserved);

        assert_eq!(f.coordinator.snapshot(&a).await.unwrap().reserved_quantity, 3);
        assert_eq!(f.coordinator.snapshot(&b).await.unwrap().reserved_quantity, 2);

        let stored = f.assembly.get_order(&placed.order.id).await.unwrap();
        assert_eq!(stored, placed.order);
    }

    #[tokio::test]
    async fn test_coded_offer_recorded_after_commit() {
        let f = fixture().await;
        let a = stocked(&f, "A-1", 10_000, 10).await;
        let offer = f
            .db
            .offers()
            .insert(&NewOffer::percentage("Save 10%", 1_000).with_code("SAVE10"))
            .await
            .unwrap();

        let placed = f
            .assembly
            .place_order(request(&[(&a, 2)], Some("save10")))
            .await
            .unwrap();
        assert_eq!(placed.savings.discount_cents, 2_000);
        assert_eq!(placed.order.total_price_cents, 18_000);

        f.usage.flush().await.unwrap();
        let usages = f.db.offers().usages_for_order(&placed.order.id).await.unwrap();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].offer_id, offer.id);
    }

    #[tokio::test]
    async fn test_refused_code_leaves_nothing() {
        let f = fixture().await;
        let a = stocked(&f, "A-1", 1_000, 10).await;

        let err = f
            .assembly
            .place_order(request(&[(&a, 2)], Some("BOGUS")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::InvalidOfferCode(_))));

        assert_eq!(f.coordinator.snapshot(&a).await.unwrap().reserved_quantity, 0);
        assert!(f.assembly.list_orders("shop-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_product_rejected() {
        let f = fixture().await;
        let a = stocked(&f, "A-1", 1_000, 10).await;
        f.db.products().set_active(&a, false).await.unwrap();

        let err = f
            .assembly
            .place_order(request(&[(&a, 1)], None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::ProductInactive(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_settles_once() {
        let f = fixture().await;
        let a = stocked(&f, "A-1", 1_000, 10).await;

        let placed = f
            .assembly
            .place_order(request(&[(&a, 4)], None))
            .await
            .unwrap();
        let id = placed.order.id.clone();

        let approved = f.assembly.approve_order(&id, "admin").await.unwrap();
        assert_eq!(approved.approval_status, ApprovalStatus::Approved);

        let delivered = f.assembly.deliver_order(&id, "driver-1").await.unwrap();
        assert_eq!(delivered.reservation_status, ReservationStatus::Committed);
        assert_eq!(delivered.delivery_status, DeliveryStatus::Delivered);

        let snapshot = f.coordinator.snapshot(&a).await.unwrap();
        assert_eq!(snapshot.quantity, 6);
        assert_eq!(snapshot.reserved_quantity, 0);

        let err = f.assembly.cancel_order(&id, "admin", None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Domain(CoreError::InvalidOrderStatus { ref current_status, .. })
                if current_status == "committed"
        ));

        let report = f.assembly.reconcile_order(&id).await.unwrap();
        assert!(report.is_consistent(), "{report:?}");
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let f = fixture().await;
        let err = f.assembly.reject_order("missing", "admin", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::OrderNotFound(_))));

        let err = f.assembly.approve_order("missing", "admin").await.unwrap_err();
        assert!(matches!(err, EngineError::Domain(CoreError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_policy_backoff_grows() {
        let policy = RetryPolicy {
            max_conflict_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        };
        let mut backoff = policy.create_backoff();
        backoff.randomization_factor = 0.0;

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(40)));
    }
}
