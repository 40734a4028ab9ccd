//! # tally-db: Database Layer for Tally
//!
//! SQLite persistence for products, stock ledgers, the movement log,
//! orders and offers, using sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Data Flow                                │
//! │                                                                         │
//! │  tally-engine (ReservationCoordinator, OrderAssembly, ...)             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ ProductRepo   │    │ 001_init.sql │  │   │
//! │  │   │ SqlitePool    │◄───│ LedgerRepo    │    │ 002_offers   │  │   │
//! │  │   │ Transactions  │    │ OrderRepo     │    │              │  │   │
//! │  │   │               │    │ OfferRepo     │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite (WAL)                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transaction Handles
//!
//! Reads have a pool form (`db.products().get(id)`) and a `*_in` form taking
//! `&mut SqliteConnection`, so callers can compose several repositories
//! inside one transaction:
//!
//! ```rust,ignore
//! let mut tx = db.begin().await?;
//! LedgerRepository::claim_rows(&mut tx, &ids).await?;
//! let ledgers = LedgerRepository::load_rows(&mut tx, &ids).await?;
//! OrderRepository::insert_in(&mut tx, &order).await?;
//! tx.commit().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::ledger::{LedgerRepository, MovementContext};
pub use repository::offer::OfferRepository;
pub use repository::order::OrderRepository;
pub use repository::product::ProductRepository;

/// Connection type every `*_in` method takes.
pub use sqlx::SqliteConnection;
