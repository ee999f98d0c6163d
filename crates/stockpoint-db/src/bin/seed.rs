//! # Seed Ledger Generator
//!
//! Fills a device database with a realistic shift of stock movements for
//! development and demos.
//!
//! ## Usage
//! ```bash
//! # 500 operations (default)
//! cargo run -p stockpoint-db --bin seed
//!
//! # Custom amount and path
//! cargo run -p stockpoint-db --bin seed -- --count 2000 --db ./data/ledger.db
//! ```
//!
//! ## Generated Movements
//! Every SKU opens with a refill; after that the shift is a mix of
//! scan-outs, scan-ins, refills and the occasional correction or void.
//! Scan-outs that would empty the shelf are refused by the ledger exactly
//! as they would be on a device, and counted as such.

use chrono::{Duration, Utc};
use std::env;

use stockpoint_core::ledger::Ledger;
use stockpoint_core::types::OperationDraft;
use stockpoint_db::{Database, DbConfig, LedgerStore};

/// SKUs stocked by the demo store.
const SKUS: &[&str] = &[
    "COKE-330",
    "COKE-500",
    "PEPSI-330",
    "SPRITE-330",
    "FANTA-330",
    "REDBULL-250",
    "WATER-500",
    "LAYS-CLASSIC",
    "DORITOS-NACHO",
    "KITKAT-4F",
    "SNICKERS-50",
    "PRINGLES-165",
];

const PROMOTERS: &[&str] = &["promoter-amina", "promoter-bilal", "promoter-sara"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 500;
    let mut db_path = String::from("./stockpoint_dev.db");
    let mut store_id = String::from("store-demo");
    let mut device_id = String::from("device-demo");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(500);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--store" => {
                if i + 1 < args.len() {
                    store_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--device" => {
                if i + 1 < args.len() {
                    device_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Stockpoint Seed Ledger Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>     Operations to generate (default: 500)");
                println!("  -d, --db <PATH>     Database file path (default: ./stockpoint_dev.db)");
                println!("      --store <ID>    Store id (default: store-demo)");
                println!("      --device <ID>   Device id (default: device-demo)");
                println!("  -h, --help          Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Stockpoint Seed Ledger Generator");
    println!("===================================");
    println!("Database:   {}", db_path);
    println!("Operations: {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let store = LedgerStore::new(db.clone());
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.operations().version().await?;
    if existing > 0 {
        println!("⚠ Database already has {} operations", existing);
        println!("  Skipping seed to keep the log append-only.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let restored = store.open(&store_id, &device_id).await?;
    let (mut ledger, _) = Ledger::restore(store_id.clone(), device_id.clone(), restored)?;

    println!();
    println!("Generating operations...");

    let start = std::time::Instant::now();
    let shift_start = Utc::now() - Duration::hours(8);
    let mut appended = 0usize;
    let mut refused = 0usize;

    for step in 0..count {
        let timestamp = shift_start + Duration::seconds(step as i64 * 30);
        let draft = movement(&ledger, step);

        let record = match ledger.prepare(draft, timestamp) {
            Ok(record) => record,
            Err(_) => {
                refused += 1;
                continue;
            }
        };
        store.append_local(&record, timestamp).await?;
        ledger.commit(record)?;
        appended += 1;

        if appended % 100 == 0 {
            println!("  Appended {} operations...", appended);
        }
    }

    store
        .replace_projection(&ledger.projection().snapshot(), ledger.log().version())
        .await?;

    let elapsed = start.elapsed();
    println!();
    println!("✓ Appended {} operations in {:?}", appended, elapsed);
    println!("  Refused by stock checks: {}", refused);
    println!(
        "  Rate: {:.0} operations/second",
        appended as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    println!();
    println!("Projection:");
    for entry in ledger.projection().snapshot() {
        println!("  {:<16} {:>5}", entry.sku, entry.quantity);
    }

    let queue = db.sync_queue().counts().await?;
    println!();
    println!("✓ Seed complete! {} operations waiting for sync.", queue.pending);

    Ok(())
}

/// Picks the next movement for `step`.
fn movement(ledger: &Ledger, step: usize) -> OperationDraft {
    let actor = PROMOTERS[step % PROMOTERS.len()];

    // First pass over the catalogue opens every shelf.
    if step < SKUS.len() {
        return OperationDraft::refill(SKUS[step], 24 + (step as i64 % 4) * 6, actor)
            .with_reason("opening stock");
    }

    let sku = SKUS[(step * 7) % SKUS.len()];
    match step % 20 {
        0 => OperationDraft::refill(sku, 12, actor).with_reason("back-room refill"),
        1 => OperationDraft::scan_in(sku, 1 + (step as i64 % 3), actor),
        7 => OperationDraft::adjustment(sku, -1, actor).with_reason("damaged can"),
        13 => match ledger.log().operations().last() {
            Some(last) if !last.is_void() && ledger.log().voided_by(&last.id).is_none() => {
                OperationDraft::void(last.id.clone(), actor).with_reason("scanned twice")
            }
            _ => OperationDraft::scan_out(sku, 1, actor),
        },
        _ => OperationDraft::scan_out(sku, 1 + (step as i64 % 2), actor),
    }
}
