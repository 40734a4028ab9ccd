//! # Offer Usage Recorder
//!
//! Records offer usage after an order has committed. Recording is
//! at-least-once and never blocks or fails the order that produced it.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Usage Recording                                  │
//! │                                                                         │
//! │  OrderAssembly (after COMMIT)                                          │
//! │       │ enqueue(usage)   try_send, never awaits                        │
//! │       ▼                                                                 │
//! │  ┌──────────────────────────┐                                          │
//! │  │ bounded mpsc queue       │── full ──► warn!, record dropped         │
//! │  └────────────┬─────────────┘                                          │
//! │               ▼                                                         │
//! │  worker task: record_usage                                             │
//! │       │ Ok(true)   recorded                                            │
//! │       │ Ok(false)  already recorded (duplicate delivery)               │
//! │       │ Err(transient)  backoff, retry up to max_attempts              │
//! │       └ Err(other) / attempts exhausted ──► error!, record dropped     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `offer_usages` is unique per (offer, order), so a record delivered
//! twice is counted once.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::OfferUsage;
use tally_db::OfferRepository;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct UsageRecorderConfig {
    /// Records waiting to be written before new ones are dropped.
    pub queue_capacity: usize,

    /// Attempts per record, first one included.
    pub max_attempts: u32,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,
}

impl Default for UsageRecorderConfig {
    fn default() -> Self {
        UsageRecorderConfig {
            queue_capacity: 1024,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    recorded: AtomicU64,
    duplicates: AtomicU64,
    dropped_full: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time counters of the recorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageStats {
    /// Newly written usage rows.
    pub recorded: u64,
    /// Deliveries of an already recorded (offer, order) pair.
    pub duplicates: u64,
    /// Records refused because the queue was full or closed.
    pub dropped_full: u64,
    /// Records given up on after errors.
    pub failed: u64,
}

// =============================================================================
// Recorder
// =============================================================================

pub struct UsageRecorder {
    config: UsageRecorderConfig,
    offers: OfferRepository,
    counters: Arc<Counters>,
}

/// Handle for feeding and controlling the recorder.
#[derive(Clone)]
pub struct UsageHandle {
    cmd_tx: mpsc::Sender<UsageCommand>,
    counters: Arc<Counters>,
}

#[derive(Debug)]
enum UsageCommand {
    Record(OfferUsage),
    /// Replies once every earlier record has been handled.
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

impl UsageHandle {
    /// Queues a record without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, usage: OfferUsage) -> bool {
        match self.cmd_tx.try_send(UsageCommand::Record(usage)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(UsageCommand::Record(usage))) => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                warn!(
                    offer_id = %usage.offer_id,
                    order_id = %usage.order_id,
                    "Usage queue full - dropping record"
                );
                false
            }
            Err(_) => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                warn!("Usage recorder stopped - dropping record");
                false
            }
        }
    }

    /// Waits until every record queued before this call has been handled.
    pub async fn flush(&self) -> EngineResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(UsageCommand::Flush(tx))
            .await
            .map_err(|_| EngineError::ChannelError("Usage recorder channel closed".into()))?;
        rx.await
            .map_err(|_| EngineError::ChannelError("Usage recorder stopped".into()))
    }

    /// Handles what is queued, then stops the worker.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(UsageCommand::Shutdown(tx))
            .await
            .map_err(|_| EngineError::ChannelError("Usage recorder channel closed".into()))?;
        rx.await
            .map_err(|_| EngineError::ChannelError("Usage recorder stopped".into()))
    }

    pub fn stats(&self) -> UsageStats {
        UsageStats {
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl UsageRecorder {
    pub fn new(config: UsageRecorderConfig, offers: OfferRepository) -> Self {
        UsageRecorder {
            config,
            offers,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Spawns the worker and returns its handle.
    pub fn start(self) -> UsageHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let counters = self.counters.clone();

        tokio::spawn(async move {
            self.run(cmd_rx).await;
        });

        UsageHandle { cmd_tx, counters }
    }

    async fn run(self, mut cmd_rx: mpsc::Receiver<UsageCommand>) {
        info!(
            capacity = self.config.queue_capacity,
            max_attempts = self.config.max_attempts,
            "Usage recorder started"
        );

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                UsageCommand::Record(usage) => self.record(usage).await,
                UsageCommand::Flush(reply) => {
                    let _ = reply.send(());
                }
                UsageCommand::Shutdown(reply) => {
                    info!("Usage recorder shutting down");
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.config.initial_backoff,
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    async fn record(&self, usage: OfferUsage) {
        let mut backoff = self.create_backoff();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.offers.record_usage(&usage).await {
                Ok(true) => {
                    self.counters.recorded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(false) => {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        offer_id = %usage.offer_id,
                        order_id = %usage.order_id,
                        "Usage already recorded"
                    );
                    return;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                    warn!(
                        offer_id = %usage.offer_id,
                        order_id = %usage.order_id,
                        attempt,
                        error = %e,
                        ?delay,
                        "Usage recording failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        offer_id = %usage.offer_id,
                        order_id = %usage.order_id,
                        attempt,
                        error = %e,
                        "Giving up on usage record"
                    );
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::NewOffer;
    use tally_db::{Database, DbConfig};

    fn usage(offer_id: &str, order_id: &str) -> OfferUsage {
        OfferUsage {
            offer_id: offer_id.to_string(),
            requester_id: "shop-1".to_string(),
            order_id: order_id.to_string(),
            discount_cents: 500,
            used_at: Utc::now(),
        }
    }

    async fn setup(config: UsageRecorderConfig) -> (Database, UsageHandle, String) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let offer = db
            .offers()
            .insert(&NewOffer::fixed("Five off", 500).with_code("FIVE"))
            .await
            .unwrap();
        let handle = UsageRecorder::new(config, db.offers()).start();
        (db, handle, offer.id)
    }

    #[tokio::test]
    async fn test_duplicate_delivery_counted_once() {
        let (db, handle, offer_id) = setup(UsageRecorderConfig::default()).await;

        assert!(handle.enqueue(usage(&offer_id, "order-1")));
        assert!(handle.enqueue(usage(&offer_id, "order-1")));
        handle.flush().await.unwrap();

        let stats = handle.stats();
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.duplicates, 1);

        let offer = db.offers().get(&offer_id).await.unwrap().unwrap();
        assert_eq!(offer.usage_count, 1);
        assert_eq!(db.offers().usages_for_order("order-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_record() {
        let config = UsageRecorderConfig {
            queue_capacity: 1,
            ..Default::default()
        };
        let (_db, handle, offer_id) = setup(config).await;

        // the worker cannot run between these two calls on a current-thread runtime
        assert!(handle.enqueue(usage(&offer_id, "order-1")));
        assert!(!handle.enqueue(usage(&offer_id, "order-2")));

        handle.flush().await.unwrap();
        let stats = handle.stats();
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.dropped_full, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dropped() {
        let (_db, handle, _) = setup(UsageRecorderConfig::default()).await;

        // unknown offer: foreign key violation, not worth retrying
        assert!(handle.enqueue(usage("no-such-offer", "order-1")));
        handle.flush().await.unwrap();

        assert_eq!(handle.stats().failed, 1);
        assert_eq!(handle.stats().recorded, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (_db, handle, offer_id) = setup(UsageRecorderConfig::default()).await;

        assert!(handle.enqueue(usage(&offer_id, "order-1")));
        handle.shutdown().await.unwrap();
        assert_eq!(handle.stats().recorded, 1);

        // give the worker a moment to drop its receiver
        tokio::task::yield_now().await;
        assert!(!handle.enqueue(usage(&offer_id, "order-2")));
        assert!(handle.flush().await.is_err());
    }
}
