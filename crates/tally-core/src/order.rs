//! # Order Pricing
//!
//! Pure pieces of order assembly: request shape checks, line pricing and
//! the final savings breakdown.
//!
//! ## Assembly Stages
//! ```text
//! Validating ──► Pricing ──► Reserving ──► Persisted ──┬──► Committed
//!     │             │            │                      ├──► Released
//!     └─────────────┴────────────┴──► (error, nothing   └──► Cancelled
//!                                      written)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::ledger::StockItem;
use crate::money::Money;
use crate::offer::{AppliedOffer, CandidateOrder, OfferEvaluation};
use crate::types::{OrderItemRequest, PaymentMethod, Product};
use crate::validation::{validate_order_line_count, validate_price_cents, validate_quantity};

// =============================================================================
// Request
// =============================================================================

/// What a shop submits to place an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderRequest {
    pub orderer_id: String,
    pub items: Vec<OrderItemRequest>,
    pub payment_method: PaymentMethod,
    pub offer_code: Option<String>,
}

impl OrderRequest {
    /// Shape checks only; product and stock checks need storage.
    pub fn validate(&self) -> CoreResult<()> {
        if self.orderer_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "orderer_id".to_string(),
            }
            .into());
        }

        validate_order_line_count(self.items.len())?;

        for item in &self.items {
            if item.product_id.trim().is_empty() {
                return Err(ValidationError::Required {
                    field: "product_id".to_string(),
                }
                .into());
            }
            validate_quantity(item.quantity)?;
        }

        if let Some(code) = &self.offer_code {
            if code.trim().is_empty() {
                return Err(ValidationError::Required {
                    field: "offer_code".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}

// =============================================================================
// Pricing
// =============================================================================

/// A request line with its price frozen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedLine {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub line_total: Money,
}

/// Prices every line at the product's current price.
///
/// ## Errors
/// `ProductNotFound` / `ProductInactive` for the first offending line.
pub fn price_lines(
    items: &[OrderItemRequest],
    products: &HashMap<String, Product>,
) -> CoreResult<Vec<PricedLine>> {
    items
        .iter()
        .map(|item| {
            let product = products
                .get(&item.product_id)
                .ok_or_else(|| CoreError::ProductNotFound(item.product_id.clone()))?;

            if !product.is_active {
                return Err(CoreError::ProductInactive(product.id.clone()));
            }
            validate_price_cents(product.price_cents)?;

            let unit_price = product.price();
            Ok(PricedLine {
                product_id: product.id.clone(),
                sku: product.sku.clone(),
                name: product.name.clone(),
                quantity: item.quantity,
                unit_price,
                line_total: unit_price.multiply_quantity(item.quantity),
            })
        })
        .collect()
}

/// Σ line totals plus total units, as the offer evaluator sees the order.
pub fn candidate_for(lines: &[PricedLine]) -> CandidateOrder {
    CandidateOrder {
        subtotal: lines.iter().map(|l| l.line_total).sum(),
        total_quantity: lines.iter().map(|l| l.quantity).sum(),
    }
}

/// The reservation request for a set of priced lines.
pub fn stock_items(lines: &[PricedLine]) -> Vec<StockItem> {
    lines
        .iter()
        .map(|l| StockItem::new(l.product_id.clone(), l.quantity))
        .collect()
}

// =============================================================================
// Savings
// =============================================================================

/// Price breakdown returned with every placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SavingsBreakdown {
    pub original_price_cents: i64,
    pub discount_cents: i64,
    pub final_price_cents: i64,
    pub applied_offers: Vec<AppliedOffer>,
}

impl SavingsBreakdown {
    /// `final = max(0, original − discount)`.
    pub fn settle(original: Money, evaluation: &OfferEvaluation) -> Self {
        let discount = evaluation.discount.min(original);
        SavingsBreakdown {
            original_price_cents: original.cents(),
            discount_cents: discount.cents(),
            final_price_cents: original.saturating_sub_to_zero(discount).cents(),
            applied_offers: evaluation.applied_offers.clone(),
        }
    }
}

// =============================================================================
// Assembly Stage
// =============================================================================

/// Stage of the order assembly pipeline, used for logging and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStage {
    Validating,
    Pricing,
    Reserving,
    Persisted,
    Committed,
    Released,
    Cancelled,
}

impl AssemblyStage {
    pub fn can_advance_to(&self, next: AssemblyStage) -> bool {
        use AssemblyStage::*;
        matches!(
            (self, next),
            (Validating, Pricing)
                | (Pricing, Reserving)
                | (Reserving, Persisted)
                | (Persisted, Committed)
                | (Persisted, Released)
                | (Persisted, Cancelled)
        )
    }
}

impl fmt::Display for AssemblyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssemblyStage::Validating => "validating",
            AssemblyStage::Pricing => "pricing",
            AssemblyStage::Reserving => "reserving",
            AssemblyStage::Persisted => "persisted",
            AssemblyStage::Committed => "committed",
            AssemblyStage::Released => "released",
            AssemblyStage::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MAX_ITEM_QUANTITY, MAX_PRICE_CENTS};
    use chrono::Utc;

    fn product(id: &str, price: i64, active: bool) -> Product {
        let now = Utc::now();
        Product {
            id: id.to_string(),
            sku: format!("SKU-{id}"),
            name: format!("Product {id}"),
            category_id: None,
            price_cents: price,
            compare_at_price_cents: None,
            is_active: active,
            created_at: now,
            updated_at: now,
        }
    }

    fn request(items: Vec<(&str, i64)>) -> OrderRequest {
        OrderRequest {
            orderer_id: "shop-1".to_string(),
            items: items
                .into_iter()
                .map(|(id, q)| OrderItemRequest {
                    product_id: id.to_string(),
                    quantity: q,
                })
                .collect(),
            payment_method: PaymentMethod::CashOnDelivery,
            offer_code: None,
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(request(vec![("a", 2)]).validate().is_ok());
        assert!(request(vec![]).validate().is_err());
        assert!(request(vec![("a", 0)]).validate().is_err());

        let mut anonymous = request(vec![("a", 1)]);
        anonymous.orderer_id = " ".to_string();
        assert!(anonymous.validate().is_err());

        let mut blank_code = request(vec![("a", 1)]);
        blank_code.offer_code = Some("  ".to_string());
        assert!(blank_code.validate().is_err());
    }

    #[test]
    fn test_price_lines_and_candidate() {
        let products: HashMap<_, _> = [product("a", 1_000, true), product("b", 250, true)]
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let lines = price_lines(&request(vec![("a", 3), ("b", 4)]).items, &products).unwrap();
        assert_eq!(lines[0].line_total.cents(), 3_000);
        assert_eq!(lines[1].sku, "SKU-b");

        let candidate = candidate_for(&lines);
        assert_eq!(candidate.subtotal.cents(), 4_000);
        assert_eq!(candidate.total_quantity, 7);

        let items = stock_items(&lines);
        assert_eq!(items[1], StockItem::new("b", 4));
    }

    #[test]
    fn test_price_lines_rejects_missing_and_inactive() {
        let products: HashMap<_, _> = [product("off", 100, false)]
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        assert_eq!(
            price_lines(&request(vec![("nope", 1)]).items, &products).unwrap_err(),
            CoreError::ProductNotFound("nope".to_string())
        );
        assert_eq!(
            price_lines(&request(vec![("off", 1)]).items, &products).unwrap_err(),
            CoreError::ProductInactive("off".to_string())
        );
    }

    #[test]
    fn test_price_lines_refuses_price_beyond_cap() {
        let products: HashMap<_, _> = [product("huge", i64::MAX / 2, true)]
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let err = price_lines(&request(vec![("huge", MAX_ITEM_QUANTITY)]).items, &products)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let top: HashMap<_, _> = [product("top", MAX_PRICE_CENTS, true)]
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let lines = price_lines(&request(vec![("top", MAX_ITEM_QUANTITY)]).items, &top).unwrap();
        assert_eq!(
            lines[0].line_total.cents(),
            MAX_PRICE_CENTS * MAX_ITEM_QUANTITY
        );
    }

    #[test]
    fn test_settle_clamps_to_zero() {
        let mut evaluation = OfferEvaluation::none();
        evaluation.discount = Money::from_cents(80_000);

        let savings = SavingsBreakdown::settle(Money::from_cents(50_000), &evaluation);
        assert_eq!(savings.discount_cents, 50_000);
        assert_eq!(savings.final_price_cents, 0);
    }

    #[test]
    fn test_stage_transitions() {
        assert!(AssemblyStage::Validating.can_advance_to(AssemblyStage::Pricing));
        assert!(AssemblyStage::Persisted.can_advance_to(AssemblyStage::Cancelled));
        assert!(!AssemblyStage::Pricing.can_advance_to(AssemblyStage::Persisted));
        assert!(!AssemblyStage::Committed.can_advance_to(AssemblyStage::Released));
    }
}
