//! # Offer Evaluator
//!
//! Loads the offers an order could use and hands them to the pure rules in
//! `tally_core::offer`.
//!
//! ```text
//! code supplied?
//!   ├─ yes ─► find_active_by_code ─► requester uses ─► evaluate_coded
//!   │                                                   (that offer only)
//!   └─ no  ─► list_automatic ──────► requester uses ─► evaluate_automatic
//!                                                       (precedence scan)
//! ```
//!
//! Usage is not recorded here; order assembly enqueues it after commit.

use chrono::{DateTime, Utc};
use tally_core::offer::{evaluate_automatic, evaluate_coded, CandidateOrder};
use tally_core::validation::validate_new_offer;
use tally_core::{CoreError, NewOffer, Offer, OfferEvaluation, OfferUsage};
use tally_db::{Database, DbError, OfferRepository, SqliteConnection};
use tracing::{debug, info};

use crate::error::EngineResult;

#[derive(Debug, Clone)]
pub struct OfferEvaluator {
    db: Database,
}

impl OfferEvaluator {
    pub fn new(db: Database) -> Self {
        OfferEvaluator { db }
    }

    /// Evaluates offers for a candidate order without placing it, e.g. for
    /// a cart preview.
    pub async fn evaluate(
        &self,
        candidate: &CandidateOrder,
        requester_id: &str,
        code: Option<&str>,
    ) -> EngineResult<OfferEvaluation> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        Self::evaluate_in(&mut conn, candidate, requester_id, code, Utc::now()).await
    }

    /// Evaluates on an explicit connection, so order assembly sees the same
    /// offer rows as the rest of its transaction.
    ///
    /// A refused code comes back as `is_valid = false` with a reason; it is
    /// the caller's choice whether that fails the order.
    pub async fn evaluate_in(
        conn: &mut SqliteConnection,
        candidate: &CandidateOrder,
        requester_id: &str,
        code: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<OfferEvaluation> {
        let evaluation = match code {
            Some(code) => {
                let offer = OfferRepository::find_active_by_code_in(conn, code).await?;
                let uses = match &offer {
                    Some(offer) => {
                        let ids = [offer.id.clone()];
                        OfferRepository::requester_uses_in(conn, requester_id, &ids)
                            .await?
                            .get(&offer.id)
                            .copied()
                            .unwrap_or(0)
                    }
                    None => 0,
                };
                evaluate_coded(code, offer.as_ref(), candidate, uses, now)
            }
            None => {
                let offers = OfferRepository::list_automatic_in(conn).await?;
                let ids: Vec<String> = offers.iter().map(|o| o.id.clone()).collect();
                let uses = OfferRepository::requester_uses_in(conn, requester_id, &ids).await?;
                evaluate_automatic(&offers, candidate, &uses, now)
            }
        };

        debug!(
            requester_id = %requester_id,
            code = ?code,
            is_valid = evaluation.is_valid,
            discount = evaluation.discount.cents(),
            applied = evaluation.applied_offers.len(),
            "Offers evaluated"
        );
        Ok(evaluation)
    }

    /// Validates and stores a new offer.
    pub async fn create_offer(&self, new: &NewOffer) -> EngineResult<Offer> {
        validate_new_offer(new).map_err(CoreError::from)?;
        let offer = self.db.offers().insert(new).await?;

        info!(
            offer_id = %offer.id,
            code = ?offer.code,
            kind = ?offer.kind,
            value = offer.value,
            "Offer created"
        );
        Ok(offer)
    }

    pub async fn set_active(&self, offer_id: &str, is_active: bool) -> EngineResult<()> {
        self.db.offers().set_active(offer_id, is_active).await?;
        info!(offer_id = %offer_id, is_active, "Offer active flag changed");
        Ok(())
    }

    pub async fn usages_for_order(&self, order_id: &str) -> EngineResult<Vec<OfferUsage>> {
        Ok(self.db.offers().usages_for_order(order_id).await?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
