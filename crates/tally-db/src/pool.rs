//! # Pool & Transactions
//!
//! One `SqlitePool` per engine. Every mutation of stock or orders runs in a
//! transaction opened here and passed down as `&mut SqliteConnection`.
//!
//! ## Write Serialization
//! ```text
//!   caller A                      caller B
//!   BEGIN (deferred)              BEGIN (deferred)
//!   UPDATE stock_ledgers ...      UPDATE stock_ledgers ...
//!     └─ takes the write lock       └─ SQLITE_BUSY: waits in the busy
//!   SELECT / plan / UPDATE              handler up to `busy_timeout`
//!   COMMIT ─────────────────────────► lock free, B proceeds
//!                                     (or TransactionConflict on expiry)
//! ```
//!
//! The first statement of a ledger transaction is always a write. A
//! transaction that reads first and upgrades later can fail with
//! BUSY_SNAPSHOT under WAL without ever waiting.
//!
//! An in-memory database exists only inside its single connection, so it
//! gets a pool of one that never idles out. Holding a transaction there
//! blocks every pool method until it ends.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::ledger::LedgerRepository;
use crate::repository::offer::OfferRepository;
use crate::repository::order::OrderRepository;
use crate::repository::product::ProductRepository;

const IN_MEMORY: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Pool settings.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/tally/tally.db")
///     .max_connections(8)
///     .busy_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file, or `:memory:`.
    pub database_path: PathBuf,

    /// Upper bound on concurrent transactions plus readers. Default 5.
    pub max_connections: u32,

    /// Connections opened eagerly. Default 1.
    pub min_connections: u32,

    /// Wait for a free pooled connection before `PoolExhausted`.
    /// Default 30s.
    pub acquire_timeout: Duration,

    /// Idle file connections are closed after this. Default 10 min.
    pub idle_timeout: Duration,

    /// How long a statement waits on another writer's lock before failing
    /// with SQLITE_BUSY.
    /// Default: 5 seconds
    pub busy_timeout: Duration,

    /// Apply embedded migrations in `Database::new`. Default true.
    pub run_migrations: bool,
}

impl DbConfig {
    /// Settings for a file database, created on first connect.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// A private in-memory database, used by tests.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            busy_timeout: Duration::from_secs(1),
            run_migrations: true,
        }
    }

    /// True for the `:memory:` database.
    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the pool and its repositories. Clones share the pool.
///
/// ## Usage
/// ```rust,ignore
/// let db = Database::new(DbConfig::new("./tally.db")).await?;
/// let ledger = db.ledgers().get("product-id").await?;
///
/// let mut tx = db.begin().await?;
/// LedgerRepository::claim_rows(&mut tx, &ids).await?;
/// // ...
/// tx.commit().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and, unless disabled, migrates the schema.
    ///
    /// Every connection runs in WAL mode with NORMAL sync, enforced
    /// foreign keys and the configured busy timeout.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.database_path.display(), "Opening ledger database");

        let url = format!("sqlite://{}?mode=rwc", config.database_path.display());
        let connect_options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout)
            .create_if_missing(true);

        let options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout);
        let options = if config.is_in_memory() {
            options
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            options.idle_timeout(Some(config.idle_timeout))
        };

        let pool = options
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        debug!(
            max_connections = config.max_connections,
            busy_timeout_ms = config.busy_timeout.as_millis() as u64,
            in_memory = config.is_in_memory(),
            "Pool ready"
        );

        let db = Database { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    /// Applies pending embedded migrations. Safe to call repeatedly.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await?;
        debug!("Schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens a transaction. Dropping it without `commit()` rolls back.
    pub async fn begin(&self) -> DbResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub fn products(&self) -> ProductRepository {
        ProductRepository::new(self.pool.clone())
    }

    pub fn ledgers(&self) -> LedgerRepository {
        LedgerRepository::new(self.pool.clone())
    }

    pub fn orders(&self) -> OrderRepository {
        OrderRepository::new(self.pool.clone())
    }

    pub fn offers(&self) -> OfferRepository {
        OfferRepository::new(self.pool.clone())
    }

    /// Waits for checked-out connections, then closes the pool. Later
    /// calls fail with `ConnectionFailed`.
    pub async fn close(&self) {
        info!("Closing ledger database");
        self.pool.close().await;
    }

    /// True if a trivial query round-trips.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
