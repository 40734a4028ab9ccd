//! # Product Repository
//!
//! Catalog rows. A product is always created together with its (empty)
//! stock ledger row so every product has exactly one ledger.
//!
//! ```text
//! insert(NewProduct)
//!   BEGIN
//!     INSERT products       (id, sku, name, price, ...)
//!     INSERT stock_ledgers  (quantity 0, reserved 0, out of stock)
//!   COMMIT
//! ```

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::repository::ledger::LedgerRepository;
use tally_core::{NewProduct, Product};

const PRODUCT_COLUMNS: &str = "id, sku, name, category_id, price_cents, \
     compare_at_price_cents, is_active, created_at, updated_at";

/// Repository for product database operations.
#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    /// Creates a new ProductRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ProductRepository { pool }
    }

    /// Inserts a product and its empty ledger row.
    ///
    /// ## Errors
    /// `UniqueViolation` if the SKU is taken.
    pub async fn insert(&self, new: &NewProduct) -> DbResult<Product> {
        let mut tx = self.pool.begin().await?;
        let product = Self::insert_in(&mut tx, new).await?;
        tx.commit().await?;
        Ok(product)
    }

    /// Transaction form of [`insert`](Self::insert).
    pub async fn insert_in(conn: &mut SqliteConnection, new: &NewProduct) -> DbResult<Product> {
        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4().to_string(),
            sku: new.sku.trim().to_string(),
            name: new.name.trim().to_string(),
            category_id: new.category_id.clone(),
            price_cents: new.price_cents,
            compare_at_price_cents: new.compare_at_price_cents,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        debug!(id = %product.id, sku = %product.sku, "Inserting product");

        sqlx::query(
            r#"
            INSERT INTO products (
                id, sku, name, category_id, price_cents,
                compare_at_price_cents, is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&product.id)
        .bind(&product.sku)
        .bind(&product.name)
        .bind(&product.category_id)
        .bind(product.price_cents)
        .bind(product.compare_at_price_cents)
        .bind(product.is_active)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::duplicate(field, &product.sku),
            other => other,
        })?;

        LedgerRepository::insert_empty_in(conn, &product.id, now).await?;

        Ok(product)
    }

    /// Gets a product by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<Product>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, id).await
    }

    /// Transaction form of [`get`](Self::get).
    pub async fn get_in(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(product)
    }

    /// Gets a product by SKU.
    pub async fn get_by_sku(&self, sku: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = ?1"
        ))
        .bind(sku.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    /// Loads the given products keyed by id. Missing ids are simply absent.
    pub async fn get_many_in(
        conn: &mut SqliteConnection,
        ids: &[String],
    ) -> DbResult<HashMap<String, Product>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id IN ("));
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let products = qb
            .build_query_as::<Product>()
            .fetch_all(&mut *conn)
            .await?;

        Ok(products.into_iter().map(|p| (p.id.clone(), p)).collect())
    }

    /// Lists active products, ordered by name.
    pub async fn list_active(&self, limit: u32) -> DbResult<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE is_active = 1 ORDER BY name LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    /// Activates or deactivates a product. Inactive products cannot be ordered.
    pub async fn set_active(&self, id: &str, is_active: bool) -> DbResult<()> {
        debug!(id = %id, is_active, "Setting product active flag");

        let result = sqlx::query(
            "UPDATE products SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Product", id));
        }

        Ok(())
    }

    /// Counts all products.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
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
    use crate::pool::{Database, DbConfig};
    use crate::DbError;
    use tally_core::NewProduct;

    #[tokio::test]
    async fn test_insert_creates_empty_ledger() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let product = db
            .products()
            .insert(&NewProduct::new("MAIZE-2KG", "Maize Flour 2kg", 18_000))
            .await
            .unwrap();

        let ledger = db.ledgers().get(&product.id).await.unwrap().unwrap();
        assert_eq!(ledger.quantity, 0);
        assert_eq!(ledger.reserved_quantity, 0);
        assert!(!ledger.is_in_stock);

        let by_sku = db.products().get_by_sku("MAIZE-2KG").await.unwrap().unwrap();
        assert_eq!(by_sku.id, product.id);
        assert_eq!(db.products().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_sku_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let new = NewProduct::new("SUGAR-1KG", "Sugar 1kg", 15_000);

        db.products().insert(&new).await.unwrap();
        let err = db.products().insert(&new).await.unwrap_err();

        assert!(matches!(err, DbError::UniqueViolation { ref value, .. } if value == "SUGAR-1KG"));
        // the failed insert left no orphan ledger behind
        assert_eq!(db.products().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_many_and_set_active() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let a = db
            .products()
            .insert(&NewProduct::new("A-1", "Alpha", 100))
            .await
            .unwrap();
        let b = db
            .products()
            .insert(&NewProduct::new("B-1", "Beta", 200))
            .await
            .unwrap();

        db.products().set_active(&b.id, false).await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let ids = vec![a.id.clone(), b.id.clone(), "missing".to_string()];
        let found = super::ProductRepository::get_many_in(&mut conn, &ids)
            .await
            .unwrap();
        drop(conn);

        assert_eq!(found.len(), 2);
        assert!(found[&a.id].is_active);
        assert!(!found[&b.id].is_active);

        let active = db.products().list_active(10).await.unwrap();
        assert_eq!(active.len(), 1);

        let err = db.products().set_active("missing", true).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
