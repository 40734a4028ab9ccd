//! # Offers
//!
//! Discount definitions and the pure evaluation rules that decide which
//! offers apply to a candidate order.
//!
//! ## Evaluation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Coded (shop typed a code)          Automatic (no code)                 │
//! │  ─────────────────────────          ───────────────────────────────     │
//! │  normalize → look up active    →    active + visible + codeless offers  │
//! │  check eligibility             →    sort: priority ↓, created_at ↑, id  │
//! │  discount on subtotal          →    apply first eligible                │
//! │                                     stackable? keep applying stackables │
//! │                                     non-stackable eligible? stop        │
//! │                                                                         │
//! │  Each discount is computed on what is left after earlier offers and    │
//! │  clamped so the running total never drops below zero.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use ts_rs::TS;

use crate::error::CoreError;
use crate::money::Money;

// =============================================================================
// Offer Definition
// =============================================================================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    /// `value` is basis points of the running total.
    Percentage,
    /// `value` is a flat amount in cents.
    Fixed,
}

/// A stored discount offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Offer {
    pub id: String,

    /// Normalized (trimmed, upper-case) code; `None` for automatic offers.
    pub code: Option<String>,

    pub name: String,
    pub description: Option<String>,
    pub kind: OfferKind,

    /// Basis points for percentage offers, cents for fixed offers.
    pub value: i64,

    /// Upper bound on a percentage discount, in cents.
    pub max_discount_cents: Option<i64>,

    pub stackable: bool,

    /// Higher priority is considered first among automatic offers.
    pub priority: i64,

    pub is_active: bool,
    pub is_visible: bool,

    #[ts(as = "Option<String>")]
    pub valid_from: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub valid_until: Option<DateTime<Utc>>,

    /// Minimum order subtotal in cents.
    pub min_order_cents: i64,

    /// Minimum total units across the order.
    pub min_quantity: i64,

    pub max_total_uses: Option<i64>,
    pub per_requester_limit: Option<i64>,

    /// Uses recorded so far (best-effort, post-commit).
    pub usage_count: i64,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an offer.
///
/// ## Example
/// ```rust
/// use tally_core::offer::NewOffer;
///
/// let save10 = NewOffer::percentage("Save 10%", 1000)
///     .with_code("save10")
///     .stackable(true);
/// assert_eq!(save10.code.as_deref(), Some("SAVE10"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOffer {
    pub code: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub kind: OfferKind,
    pub value: i64,
    pub max_discount_cents: Option<i64>,
    pub stackable: bool,
    pub priority: i64,
    pub is_visible: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub min_order_cents: i64,
    pub min_quantity: i64,
    pub max_total_uses: Option<i64>,
    pub per_requester_limit: Option<i64>,
}

impl NewOffer {
    fn base(name: impl Into<String>, kind: OfferKind, value: i64) -> Self {
        NewOffer {
            code: None,
            name: name.into(),
            description: None,
            kind,
            value,
            max_discount_cents: None,
            stackable: false,
            priority: 0,
            is_visible: true,
            valid_from: None,
            valid_until: None,
            min_order_cents: 0,
            min_quantity: 0,
            max_total_uses: None,
            per_requester_limit: None,
        }
    }

    /// A percentage offer; `bps` of 1000 is 10%.
    pub fn percentage(name: impl Into<String>, bps: i64) -> Self {
        Self::base(name, OfferKind::Percentage, bps)
    }

    /// A flat-amount offer in cents.
    pub fn fixed(name: impl Into<String>, cents: i64) -> Self {
        Self::base(name, OfferKind::Fixed, cents)
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(normalize_code(code));
        self
    }

    pub fn stackable(mut self, stackable: bool) -> Self {
        self.stackable = stackable;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_discount_cents(mut self, cap: i64) -> Self {
        self.max_discount_cents = Some(cap);
        self
    }

    pub fn min_order_cents(mut self, min: i64) -> Self {
        self.min_order_cents = min;
        self
    }

    pub fn min_quantity(mut self, min: i64) -> Self {
        self.min_quantity = min;
        self
    }

    pub fn max_total_uses(mut self, max: i64) -> Self {
        self.max_total_uses = Some(max);
        self
    }

    pub fn per_requester_limit(mut self, limit: i64) -> Self {
        self.per_requester_limit = Some(limit);
        self
    }

    pub fn valid_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_visible = false;
        self
    }
}

/// Trimmed, upper-case form every code is stored and looked up in.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

// =============================================================================
// Candidate Order & Eligibility
// =============================================================================

/// What the evaluator needs to know about an order being placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateOrder {
    pub subtotal: Money,
    pub total_quantity: i64,
}

/// Why an offer does not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligibility {
    Inactive,
    NotStarted,
    Expired,
    UsageLimitReached,
    RequesterLimitReached,
    BelowMinimumOrder { minimum: Money },
    BelowMinimumQuantity { minimum: i64 },
}

impl fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligibility::Inactive => write!(f, "offer is not active"),
            Ineligibility::NotStarted => write!(f, "offer is not valid yet"),
            Ineligibility::Expired => write!(f, "offer has expired"),
            Ineligibility::UsageLimitReached => write!(f, "offer usage limit reached"),
            Ineligibility::RequesterLimitReached => {
                write!(f, "offer already used the maximum number of times")
            }
            Ineligibility::BelowMinimumOrder { minimum } => {
                write!(f, "order total is below the minimum of {}", minimum)
            }
            Ineligibility::BelowMinimumQuantity { minimum } => {
                write!(f, "order has fewer than {} units", minimum)
            }
        }
    }
}

/// Checks validity window, usage caps and order minimums.
///
/// Minimums are checked against the original subtotal, not the total left
/// after other offers.
pub fn check_eligibility(
    offer: &Offer,
    candidate: &CandidateOrder,
    requester_uses: i64,
    now: DateTime<Utc>,
) -> Result<(), Ineligibility> {
    if !offer.is_active {
        return Err(Ineligibility::Inactive);
    }
    if offer.valid_from.is_some_and(|from| now < from) {
        return Err(Ineligibility::NotStarted);
    }
    if offer.valid_until.is_some_and(|until| now > until) {
        return Err(Ineligibility::Expired);
    }
    if offer.max_total_uses.is_some_and(|max| offer.usage_count >= max) {
        return Err(Ineligibility::UsageLimitReached);
    }
    if offer
        .per_requester_limit
        .is_some_and(|limit| requester_uses >= limit)
    {
        return Err(Ineligibility::RequesterLimitReached);
    }
    if candidate.subtotal.cents() < offer.min_order_cents {
        return Err(Ineligibility::BelowMinimumOrder {
            minimum: Money::from_cents(offer.min_order_cents),
        });
    }
    if candidate.total_quantity < offer.min_quantity {
        return Err(Ineligibility::BelowMinimumQuantity {
            minimum: offer.min_quantity,
        });
    }
    Ok(())
}

/// Discount this offer grants on `remaining`, never more than `remaining`.
pub fn discount_for(offer: &Offer, remaining: Money) -> Money {
    let raw = match offer.kind {
        OfferKind::Percentage => remaining.percentage(offer.value),
        OfferKind::Fixed => Money::from_cents(offer.value),
    };
    let capped = match offer.max_discount_cents {
        Some(cap) => raw.min(Money::from_cents(cap)),
        None => raw,
    };
    if capped.is_negative() {
        Money::zero()
    } else {
        capped.min(remaining)
    }
}

// =============================================================================
// Evaluation Result
// =============================================================================

/// An offer as applied to one order; stored on the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AppliedOffer {
    pub offer_id: String,
    pub code: Option<String>,
    pub name: String,
    pub kind: OfferKind,
    pub discount_cents: i64,
}

/// One recorded use of an offer by a committed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct OfferUsage {
    pub offer_id: String,
    pub requester_id: String,
    pub order_id: String,
    pub discount_cents: i64,
    #[ts(as = "String")]
    pub used_at: DateTime<Utc>,
}

impl OfferUsage {
    /// Usage records for every offer applied to an order.
    pub fn for_order(
        order_id: &str,
        requester_id: &str,
        applied: &[AppliedOffer],
        used_at: DateTime<Utc>,
    ) -> Vec<OfferUsage> {
        applied
            .iter()
            .map(|a| OfferUsage {
                offer_id: a.offer_id.clone(),
                requester_id: requester_id.to_string(),
                order_id: order_id.to_string(),
                discount_cents: a.discount_cents,
                used_at,
            })
            .collect()
    }
}

/// Why a coded evaluation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferRejection {
    UnknownCode(String),
    NotEligible { code: String, reason: Ineligibility },
}

impl From<OfferRejection> for CoreError {
    fn from(rejection: OfferRejection) -> Self {
        match rejection {
            OfferRejection::UnknownCode(code) => CoreError::InvalidOfferCode(code),
            OfferRejection::NotEligible { code, reason } => CoreError::OfferNotEligible {
                code,
                reason: reason.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferEvaluation {
    pub is_valid: bool,
    pub discount: Money,
    pub reason: Option<String>,
    pub applied_offers: Vec<AppliedOffer>,
    #[serde(skip)]
    pub rejection: Option<OfferRejection>,
}

impl OfferEvaluation {
    /// Valid evaluation with nothing applied.
    pub fn none() -> Self {
        OfferEvaluation {
            is_valid: true,
            discount: Money::zero(),
            reason: None,
            applied_offers: Vec::new(),
            rejection: None,
        }
    }

    fn rejected(rejection: OfferRejection) -> Self {
        let reason = match &rejection {
            OfferRejection::UnknownCode(_) => "unknown code".to_string(),
            OfferRejection::NotEligible { reason, .. } => reason.to_string(),
        };
        OfferEvaluation {
            is_valid: false,
            discount: Money::zero(),
            reason: Some(reason),
            applied_offers: Vec::new(),
            rejection: Some(rejection),
        }
    }

    /// Turns a refused evaluation into the matching domain error.
    pub fn into_result(self) -> Result<Self, CoreError> {
        match self.rejection {
            Some(rejection) => Err(rejection.into()),
            None => Ok(self),
        }
    }
}

fn applied(offer: &Offer, discount: Money) -> AppliedOffer {
    AppliedOffer {
        offer_id: offer.id.clone(),
        code: offer.code.clone(),
        name: offer.name.clone(),
        kind: offer.kind,
        discount_cents: discount.cents(),
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Evaluates a single coded offer. `offer` is the lookup result for the
/// normalized code.
pub fn evaluate_coded(
    code: &str,
    offer: Option<&Offer>,
    candidate: &CandidateOrder,
    requester_uses: i64,
    now: DateTime<Utc>,
) -> OfferEvaluation {
    let code = normalize_code(code);

    let offer = match offer {
        Some(offer) if offer.is_active => offer,
        _ => return OfferEvaluation::rejected(OfferRejection::UnknownCode(code)),
    };

    if let Err(reason) = check_eligibility(offer, candidate, requester_uses, now) {
        return OfferEvaluation::rejected(OfferRejection::NotEligible { code, reason });
    }

    let discount = discount_for(offer, candidate.subtotal);
    OfferEvaluation {
        is_valid: true,
        discount,
        reason: None,
        applied_offers: vec![applied(offer, discount)],
        rejection: None,
    }
}

/// Orders offers by priority (high first), then age (old first), then id.
pub fn sort_by_precedence(offers: &mut [&Offer]) {
    offers.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Evaluates automatic offers. `requester_uses` maps offer id to the
/// requester's recorded uses.
pub fn evaluate_automatic(
    offers: &[Offer],
    candidate: &CandidateOrder,
    requester_uses: &HashMap<String, i64>,
    now: DateTime<Utc>,
) -> OfferEvaluation {
    let mut ordered: Vec<&Offer> = offers
        .iter()
        .filter(|o| o.code.is_none() && o.is_active && o.is_visible)
        .collect();
    sort_by_precedence(&mut ordered);

    let mut remaining = candidate.subtotal;
    let mut result = OfferEvaluation::none();

    for offer in ordered {
        if !remaining.is_positive() {
            break;
        }

        let uses = requester_uses.get(&offer.id).copied().unwrap_or(0);
        if check_eligibility(offer, candidate, uses, now).is_err() {
            continue;
        }

        if !offer.stackable && !result.applied_offers.is_empty() {
            break;
        }

        let discount = discount_for(offer, remaining);
        remaining -= discount;
        result.discount += discount;
        result.applied_offers.push(applied(offer, discount));

        if !offer.stackable {
            break;
        }
    }

    result
}

// =============================================================================
// Unit Tests
// =============================================================================
