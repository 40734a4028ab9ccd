//! # Offer Repository
//!
//! Offer definitions and usage records.
//!
//! ## Usage Recording
//! ```text
//! record_usage(usage)                 (post-commit, at-least-once)
//!   BEGIN
//!     INSERT OR IGNORE INTO offer_usages ... UNIQUE(offer_id, order_id)
//!       ├── inserted → UPDATE offers SET usage_count = usage_count + 1
//!       └── ignored  → redelivery, counter untouched
//!   COMMIT
//! ```

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::offer::normalize_code;
use tally_core::{NewOffer, Offer, OfferUsage};

const OFFER_COLUMNS: &str = "id, code, name, description, kind, value, max_discount_cents, \
     stackable, priority, is_active, is_visible, valid_from, valid_until, min_order_cents, \
     min_quantity, max_total_uses, per_requester_limit, usage_count, created_at, updated_at";

/// Repository for offers and their usage.
#[derive(Debug, Clone)]
pub struct OfferRepository {
    pool: SqlitePool,
}

impl OfferRepository {
    /// Creates a new OfferRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OfferRepository { pool }
    }

    /// Stores a new, active offer.
    ///
    /// ## Errors
    /// `UniqueViolation` if the code is already in use.
    pub async fn insert(&self, new: &NewOffer) -> DbResult<Offer> {
        let now = Utc::now();
        let offer = Offer {
            id: Uuid::new_v4().to_string(),
            code: new.code.as_deref().map(normalize_code),
            name: new.name.clone(),
            description: new.description.clone(),
            kind: new.kind,
            value: new.value,
            max_discount_cents: new.max_discount_cents,
            stackable: new.stackable,
            priority: new.priority,
            is_active: true,
            is_visible: new.is_visible,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
            min_order_cents: new.min_order_cents,
            min_quantity: new.min_quantity,
            max_total_uses: new.max_total_uses,
            per_requester_limit: new.per_requester_limit,
            usage_count: 0,
            created_at: now,
            updated_at: now,
        };

        debug!(id = %offer.id, code = ?offer.code, kind = ?offer.kind, "Inserting offer");

        sqlx::query(
            r#"
            INSERT INTO offers (
                id, code, name, description, kind, value, max_discount_cents,
                stackable, priority, is_active, is_visible, valid_from, valid_until,
                min_order_cents, min_quantity, max_total_uses, per_requester_limit,
                usage_count, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
            )
            "#,
        )
        .bind(&offer.id)
        .bind(&offer.code)
        .bind(&offer.name)
        .bind(&offer.description)
        .bind(offer.kind)
        .bind(offer.value)
        .bind(offer.max_discount_cents)
        .bind(offer.stackable)
        .bind(offer.priority)
        .bind(offer.is_active)
        .bind(offer.is_visible)
        .bind(offer.valid_from)
        .bind(offer.valid_until)
        .bind(offer.min_order_cents)
        .bind(offer.min_quantity)
        .bind(offer.max_total_uses)
        .bind(offer.per_requester_limit)
        .bind(offer.usage_count)
        .bind(offer.created_at)
        .bind(offer.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => {
                DbError::duplicate(field, offer.code.clone().unwrap_or_default())
            }
            other => other,
        })?;

        Ok(offer)
    }

    /// Gets an offer by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<Offer>> {
        let offer = sqlx::query_as::<_, Offer>(&format!(
            "SELECT {OFFER_COLUMNS} FROM offers WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(offer)
    }

    /// Looks up an active offer by code; the code is normalized first.
    pub async fn find_active_by_code_in(
        conn: &mut SqliteConnection,
        code: &str,
    ) -> DbResult<Option<Offer>> {
        let offer = sqlx::query_as::<_, Offer>(&format!(
            "SELECT {OFFER_COLUMNS} FROM offers WHERE code = ?1 AND is_active = 1"
        ))
        .bind(normalize_code(code))
        .fetch_optional(&mut *conn)
        .await?;

        Ok(offer)
    }

    /// Pool form of [`find_active_by_code_in`](Self::find_active_by_code_in).
    pub async fn find_active_by_code(&self, code: &str) -> DbResult<Option<Offer>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_active_by_code_in(&mut conn, code).await
    }

    /// Active, visible, codeless offers. Precedence is applied by the
    /// evaluator, not here.
    pub async fn list_automatic_in(conn: &mut SqliteConnection) -> DbResult<Vec<Offer>> {
        let offers = sqlx::query_as::<_, Offer>(&format!(
            "SELECT {OFFER_COLUMNS} FROM offers \
             WHERE code IS NULL AND is_active = 1 AND is_visible = 1"
        ))
        .fetch_all(&mut *conn)
        .await?;

        Ok(offers)
    }

    /// Pool form of [`list_automatic_in`](Self::list_automatic_in).
    pub async fn list_automatic(&self) -> DbResult<Vec<Offer>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_automatic_in(&mut conn).await
    }

    /// Orders a requester has used each offer on, keyed by offer id.
    /// Offers never used by the requester are absent.
    pub async fn requester_uses_in(
        conn: &mut SqliteConnection,
        requester_id: &str,
        offer_ids: &[String],
    ) -> DbResult<HashMap<String, i64>> {
        if offer_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT offer_id, COUNT(DISTINCT order_id) FROM offer_usages WHERE requester_id = ",
        );
        qb.push_bind(requester_id.to_string());
        qb.push(" AND offer_id IN (");
        let mut separated = qb.separated(", ");
        for id in offer_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(") GROUP BY offer_id");

        let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
        Ok(rows.into_iter().collect())
    }

    /// Records one use. Returns `false` if this (offer, order) pair was
    /// already recorded, in which case nothing changes.
    pub async fn record_usage(&self, usage: &OfferUsage) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO offer_usages (
                offer_id, requester_id, order_id, discount_cents, used_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&usage.offer_id)
        .bind(&usage.requester_id)
        .bind(&usage.order_id)
        .bind(usage.discount_cents)
        .bind(usage.used_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            let result = sqlx::query(
                "UPDATE offers SET usage_count = usage_count + 1, updated_at = ?2 WHERE id = ?1",
            )
            .bind(&usage.offer_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(DbError::not_found("Offer", &usage.offer_id));
            }
        }

        tx.commit().await?;

        debug!(
            offer_id = %usage.offer_id,
            order_id = %usage.order_id,
            inserted,
            "Recorded offer usage"
        );
        Ok(inserted)
    }

    /// Usage records of one order.
    pub async fn usages_for_order(&self, order_id: &str) -> DbResult<Vec<OfferUsage>> {
        let usages = sqlx::query_as::<_, OfferUsage>(
            r#"
            SELECT offer_id, requester_id, order_id, discount_cents, used_at
            FROM offer_usages
            WHERE order_id = ?1
            ORDER BY id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(usages)
    }

    /// Turns an offer on or off. Inactive offers are never evaluated.
    pub async fn set_active(&self, id: &str, is_active: bool) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE offers SET is_active = ?2, updated_at = ?3 WHERE id = ?1")
                .bind(id)
                .bind(is_active)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Offer", id));
        }

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn usage(offer_id: &str, order_id: &str) -> OfferUsage {
        OfferUsage {
            offer_id: offer_id.to_string(),
            requester_id: "shop-7".to_string(),
            order_id: order_id.to_string(),
            discount_cents: 500,
            used_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_code_lookup_is_normalized() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let offer = db
            .offers()
            .insert(&NewOffer::percentage("Save 10%", 1_000).with_code("save10"))
            .await
            .unwrap();

        assert_eq!(offer.code.as_deref(), Some("SAVE10"));

        let found = db.offers().find_active_by_code("  Save10 ").await.unwrap();
        assert_eq!(found.map(|o| o.id), Some(offer.id.clone()));

        db.offers().set_active(&offer.id, false).await.unwrap();
        assert!(db.offers().find_active_by_code("SAVE10").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_code_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let new = NewOffer::fixed("Fifty off", 5_000).with_code("FLAT50");

        db.offers().insert(&new).await.unwrap();
        let err = db.offers().insert(&new).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { ref value, .. } if value == "FLAT50"));
    }

    #[tokio::test]
    async fn test_automatic_listing_excludes_coded_and_hidden() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let auto = db.offers().insert(&NewOffer::fixed("Auto", 100)).await.unwrap();
        db.offers()
            .insert(&NewOffer::fixed("Coded", 100).with_code("C"))
            .await
            .unwrap();
        db.offers()
            .insert(&NewOffer::fixed("Hidden", 100).hidden())
            .await
            .unwrap();

        let listed = db.offers().list_automatic().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, auto.id);
    }

    #[tokio::test]
    async fn test_record_usage_is_idempotent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let offer = db.offers().insert(&NewOffer::fixed("Auto", 500)).await.unwrap();

        assert!(db.offers().record_usage(&usage(&offer.id, "order-1")).await.unwrap());
        assert!(!db.offers().record_usage(&usage(&offer.id, "order-1")).await.unwrap());
        assert!(db.offers().record_usage(&usage(&offer.id, "order-2")).await.unwrap());

        let stored = db.offers().get(&offer.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 2);

        let mut conn = db.pool().acquire().await.unwrap();
        let uses = OfferRepository::requester_uses_in(&mut conn, "shop-7", &[offer.id.clone()])
            .await
            .unwrap();
        drop(conn);
        assert_eq!(uses.get(&offer.id), Some(&2));

        assert_eq!(db.offers().usages_for_order("order-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_usage_for_unknown_offer_fails() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db.offers().record_usage(&usage("nope", "order-1")).await.unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. } | DbError::NotFound { .. }));
    }
}
