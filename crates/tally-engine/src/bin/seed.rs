//! # Seed Data Generator
//!
//! Fills a development database with stocked products and a few offers.
//!
//! ## Usage
//! ```bash
//! # 200 products (default)
//! cargo run -p tally-engine --bin seed
//!
//! # Custom amount and database
//! cargo run -p tally-engine --bin seed -- --count 1000 --db ./data/tally.db
//! ```
//!
//! Each product gets a SKU of the form `{CATEGORY}-{NAME}-{INDEX}`, a price
//! between 1.99 and 9.99 plus a size addon, and a restock of 0 to 120
//! units. Every seventh product is left empty so the low-stock report has
//! something to show.

use std::env;
use std::path::PathBuf;
use tally_core::{AdjustmentKind, NewOffer, NewProduct};
use tally_engine::{init_tracing, Engine, EngineConfig};

const CATEGORIES: &[(&str, &[&str])] = &[
    (
        "GRN",
        &[
            "Maize Flour",
            "Wheat Flour",
            "Rice Pishori",
            "Rice Basmati",
            "Green Grams",
            "Beans Rosecoco",
            "Sugar",
            "Salt",
        ],
    ),
    (
        "BEV",
        &[
            "Tea Leaves",
            "Instant Coffee",
            "Drinking Chocolate",
            "Mango Juice",
            "Orange Squash",
            "Bottled Water",
        ],
    ),
    (
        "HOM",
        &[
            "Bar Soap",
            "Washing Powder",
            "Dish Liquid",
            "Toilet Paper",
            "Cooking Oil",
            "Matches",
        ],
    ),
];

const SIZES: &[(&str, i64)] = &[
    ("500g", 0),
    ("1kg", 120),
    ("2kg", 260),
    ("5kg", 700),
    ("Carton", 1_500),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 200;
    let mut db_path = String::from("./tally_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of products to generate (default: 200)");
                println!("  -d, --db <PATH>    Database file path (default: ./tally_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    init_tracing();

    println!("Tally Seed Data Generator");
    println!("=========================");
    println!("Database: {}", db_path);
    println!("Products: {}", count);
    println!();

    let mut config = EngineConfig::default();
    config.database.path = PathBuf::from(&db_path);
    let engine = Engine::new(config).await?;

    let existing = engine.db().products().count().await?;
    if existing > 0 {
        println!("Database already has {} products, skipping.", existing);
        println!("Delete the database file to regenerate.");
        engine.shutdown().await;
        return Ok(());
    }

    let start = std::time::Instant::now();
    let mut generated = 0;

    'outer: for (category, names) in CATEGORIES {
        for name in names.iter() {
            for (size, addon) in SIZES {
                if generated >= count {
                    break 'outer;
                }
                let seed = generated;

                let abbrev: String = name
                    .chars()
                    .filter(|c| c.is_ascii_alphabetic())
                    .take(3)
                    .collect::<String>()
                    .to_uppercase();
                let new = NewProduct::new(
                    format!("{category}-{abbrev}-{seed:04}"),
                    format!("{name} {size}"),
                    199 + ((seed * 17) % 800) as i64 + addon,
                );

                let product = match engine.db().products().insert(&new).await {
                    Ok(product) => product,
                    Err(e) => {
                        eprintln!("Failed to insert {}: {}", new.sku, e);
                        continue;
                    }
                };

                let units = if seed % 7 == 0 { 0 } else { (seed % 121) as i64 };
                if units > 0 {
                    engine
                        .coordinator()
                        .adjust_stock(&product.id, AdjustmentKind::Restock, units, Some("seed"), "seed")
                        .await?;
                }
                engine
                    .coordinator()
                    .set_thresholds(&product.id, 10, 20)
                    .await?;

                generated += 1;
                if generated % 100 == 0 {
                    println!("  Generated {} products...", generated);
                }
            }
        }
    }

    let elapsed = start.elapsed();
    println!();
    println!("Generated {} products in {:?}", generated, elapsed);

    let offers = engine.offers();
    offers
        .create_offer(&NewOffer::percentage("Save 10%", 1_000).with_code("SAVE10"))
        .await?;
    offers
        .create_offer(
            &NewOffer::fixed("Flat 50 off big baskets", 5_000)
                .stackable(true)
                .priority(10)
                .min_order_cents(50_000),
        )
        .await?;
    offers
        .create_offer(
            &NewOffer::percentage("First order 5%", 500)
                .with_code("WELCOME")
                .per_requester_limit(1),
        )
        .await?;
    println!("Created 3 offers");

    let low = engine.coordinator().low_stock_report().await?;
    let inconsistent = engine.db().ledgers().count_inconsistent().await?;
    println!();
    println!("Low stock products:    {}", low.len());
    println!("Inconsistent ledgers:  {}", inconsistent);
    println!();
    println!("Seed complete!");

    engine.shutdown().await;
    Ok(())
}
