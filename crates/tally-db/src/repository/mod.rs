//! # Repository Module
//!
//! ```text
//! Engine service
//!     │  db.ledgers().snapshot("id")          (pool form)
//!     │  LedgerRepository::claim_rows(&mut tx, ..)   (transaction form)
//!     ▼
//! Repository ──► SQL ──► SQLite
//! ```
//!
//! - [`ProductRepository`](product::ProductRepository) - Catalog rows
//! - [`LedgerRepository`](ledger::LedgerRepository) - Stock figures and movement log
//! - [`OrderRepository`](order::OrderRepository) - Orders and their lines
//! - [`OfferRepository`](offer::OfferRepository) - Offers and usage records

pub mod ledger;
pub mod offer;
pub mod order;
pub mod product;
