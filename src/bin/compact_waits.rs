//! Wait Compaction - prunes redundant wait samples for one UTC day
//!
//! Meant to be run once a day by a scheduler. Prints the result as JSON to
//! stdout; on failure prints `{"error": "..."}` and exits non-zero.
//!
//! Usage:
//!   cargo run --release --bin compact_waits -- [--date YYYY-MM-DD] [--days-back N]
//!                                              [--batch-size N] [--dry-run]
//!
//! Environment variables:
//!   DAYS_BACK - Days before today to compact (default: 1, yesterday)
//!   COMPACT_DATE - Explicit day, overrides DAYS_BACK
//!   BATCH_SIZE - Ids per DELETE statement (default: 100)
//!   DRY_RUN - Plan only, delete nothing (default: false)
//!   PARKFLOW_DB_PATH - SQLite database path (default: data/parkflow.db)
//!   PARKFLOW_SCHEMA_DIR - Schema directory (default: sql)
//!   PARKFLOW_BUSY_TIMEOUT_MS - Store lock timeout (default: 5000)
//!   RUST_LOG - Logging level (optional, default: info)

use chrono::Utc;
use dotenv::dotenv;
use log::{error, info};
use parkflow::pipeline::{
    compaction::{compact, CompactionResult, DateWindow},
    config::{CompactionConfig, PipelineConfig},
    db::{open_connection, run_schema_migrations},
};
use std::env;

fn run() -> Result<CompactionResult, Box<dyn std::error::Error>> {
    let pipeline = PipelineConfig::from_env()?;
    let config = CompactionConfig::from_env()?.apply_args(env::args().skip(1))?;

    let window = match config.date {
        Some(date) => DateWindow::for_day(date)?,
        None => DateWindow::days_back(Utc::now().date_naive(), config.days_back)?,
    };

    info!("🗜️  Wait Compaction");
    info!("   ├─ Database: {}", pipeline.db_path);
    info!("   ├─ Date: {}", window.label());
    info!("   ├─ Batch size: {}", config.batch_size);
    info!("   └─ Dry run: {}", config.dry_run);

    let mut conn = open_connection(&pipeline.db_path, pipeline.busy_timeout)?;
    run_schema_migrations(&mut conn, &pipeline.schema_dir).map_err(|e| e.to_string())?;

    let result = compact(&mut conn, &window, config.batch_size, config.dry_run)?;
    Ok(result)
}

fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(result) => {
            info!("✅ {}", result);
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    error!("❌ Failed to serialize result: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            error!("❌ Compaction failed: {}", e);
            println!("{}", serde_json::json!({ "error": e.to_string() }));
            std::process::exit(1);
        }
    }
}
