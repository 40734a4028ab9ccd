//! # tally-engine: Reservation & Order Settlement
//!
//! The services that mutate stock and orders, built on the pure rules in
//! `tally-core` and the storage in `tally-db`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Engine                                       │
//! │                                                                         │
//! │   place_order ──► OrderAssembly ──┬──► ReservationCoordinator          │
//! │   cancel/deliver                  │      reserve · release · commit     │
//! │                                   │      adjust · availability          │
//! │                                   ├──► OfferEvaluator                   │
//! │                                   │      coded · automatic              │
//! │                                   └──► UsageHandle (after COMMIT)       │
//! │                                          bounded queue ► worker         │
//! │                                                                         │
//! │   ─────────────────────────── tally-db ─────────────────────────────   │
//! │   Database (SqlitePool, WAL)  ·  repositories  ·  migrations           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tally_engine::{init_tracing, Engine, EngineConfig};
//!
//! init_tracing();
//! let engine = Engine::new(EngineConfig::load(None)?).await?;
//!
//! let placed = engine.assembly().place_order(request).await?;
//! engine.assembly().deliver_order(&placed.order.id, "driver-7").await?;
//!
//! engine.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod assembly;
pub mod config;
pub mod error;
pub mod offers;
pub mod reservation;
pub mod usage;

// =============================================================================
// Re-exports
// =============================================================================

pub use assembly::{
    LineReconciliation, OrderAssembly, PlacedOrder, ReconciliationReport, RetryPolicy,
};
pub use config::{DatabaseSettings, EngineConfig, ReservationSettings, UsageSettings};
pub use error::{EngineError, EngineResult, ErrorCategory};
pub use offers::OfferEvaluator;
pub use reservation::ReservationCoordinator;
pub use usage::{UsageHandle, UsageRecorder, UsageRecorderConfig, UsageStats};

use tally_db::Database;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Engine
// =============================================================================

/// Every service wired to one database.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    coordinator: ReservationCoordinator,
    offers: OfferEvaluator,
    assembly: OrderAssembly,
    usage: UsageHandle,
}

impl Engine {
    /// Opens the database (running migrations) and starts the usage worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let db = Database::new(config.to_db_config()).await?;
        let coordinator =
            ReservationCoordinator::new(db.clone(), config.reservation.transaction_timeout());
        let offers = OfferEvaluator::new(db.clone());
        let usage = UsageRecorder::new(config.usage_recorder_config(), db.offers()).start();
        let assembly = OrderAssembly::new(
            db.clone(),
            coordinator.clone(),
            usage.clone(),
            config.reservation.retry_policy(),
        );

        info!(
            db_path = %config.database.path.display(),
            tx_timeout_ms = config.reservation.transaction_timeout_ms,
            max_conflict_retries = config.reservation.max_conflict_retries,
            "Engine ready"
        );

        Ok(Engine {
            db,
            coordinator,
            offers,
            assembly,
            usage,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn coordinator(&self) -> &ReservationCoordinator {
        &self.coordinator
    }

    pub fn offers(&self) -> &OfferEvaluator {
        &self.offers
    }

    pub fn assembly(&self) -> &OrderAssembly {
        &self.assembly
    }

    pub fn usage(&self) -> &UsageHandle {
        &self.usage
    }

    /// Drains the usage queue, stops its worker and closes the pool.
    pub async fn shutdown(&self) {
        if let Err(e) = self.usage.shutdown().await {
            warn!(error = %e, "Usage recorder already stopped");
        }
        self.db.close().await;
        info!("Engine stopped");
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Installs the global tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tally_engine=trace` - Trace the engine only
/// - Default: `info`, debug for tally crates, warn for sqlx
///
/// A second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
