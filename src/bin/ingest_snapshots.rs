//! Snapshot Ingestion - loads collector snapshots into the park store
//!
//! Reads snapshot JSON files, validates each one, and ingests the valid
//! ones concurrently. Every file gets its own outcome; a bad file never
//! stops the others. Prints a JSON report to stdout; if the run cannot
//! start at all it prints `{"error": "..."}` instead. Either way the exit
//! code is non-zero unless every snapshot was ingested.
//!
//! Usage:
//!   cargo run --release --bin ingest_snapshots -- [snapshot.json ...]
//!
//! With no paths, every `*.json` file under `SNAPSHOT_DIR` is ingested.
//!
//! Environment variables:
//!   SNAPSHOT_DIR - Directory scanned when no paths are given (default: snapshots)
//!   PARKFLOW_DB_PATH - SQLite database path (default: data/parkflow.db)
//!   PARKFLOW_SCHEMA_DIR - Schema directory (default: sql)
//!   PARKFLOW_BUSY_TIMEOUT_MS - Store lock timeout (default: 5000)
//!   INGEST_WORKERS - Concurrent snapshots (default: 4)
//!   INGEST_MAX_RETRIES - Retries on busy/locked store (default: 3)
//!   SNAPSHOT_CHANNEL_BUFFER - Channel size (default: 100)
//!   RUST_LOG - Logging level (optional, default: info)

use dotenv::dotenv;
use log::{error, info, warn};
use parkflow::pipeline::{
    config::PipelineConfig,
    db::{open_connection, run_schema_migrations},
    ingestion::{start_snapshot_ingestion, IngestionReport, RetryPolicy, SnapshotJob, SnapshotOutcome},
    ingestor::{IngestError, SnapshotSink, SqliteSnapshotIngestor},
    snapshot::Snapshot,
};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

fn collect_snapshot_paths() -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let args: Vec<PathBuf> = env::args().skip(1).map(PathBuf::from).collect();
    if !args.is_empty() {
        return Ok(args);
    }

    let dir = env::var("SNAPSHOT_DIR").unwrap_or_else(|_| "snapshots".to_string());
    let dir = Path::new(&dir);
    if !dir.is_dir() {
        return Err(format!("Snapshot directory not found: {}", dir.display()).into());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Read and validate one file; failures become rejected outcomes
fn load_snapshot(path: &Path) -> Result<Snapshot, SnapshotOutcome> {
    let source = path.display().to_string();
    let json = fs::read_to_string(path).map_err(|e| {
        SnapshotOutcome::rejected(
            source.clone(),
            IngestError::Io(format!("failed to read {}: {}", source, e)),
        )
    })?;

    Snapshot::from_json(&json).map_err(|e| {
        warn!("⚠️  Rejected {}: {}", source, e);
        SnapshotOutcome::rejected(source.clone(), e.into())
    })
}

async fn run() -> Result<IngestionReport, Box<dyn std::error::Error>> {
    let config = PipelineConfig::from_env()?;
    let paths = collect_snapshot_paths()?;

    info!("🚀 Snapshot Ingestion");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Snapshots: {}", paths.len());
    info!("   ├─ Workers: {}", config.ingest_workers);
    info!("   └─ Channel buffer: {}", config.channel_buffer);

    // Schema is idempotent; apply before any worker opens a connection
    info!("🔧 Initializing database...");
    {
        let mut conn = open_connection(&config.db_path, config.busy_timeout)?;
        run_schema_migrations(&mut conn, &config.schema_dir)
            .map_err(|e| format!("Schema migration failed: {}", e))?;
    }
    info!("✅ Database initialized");

    let sink: Arc<dyn SnapshotSink> =
        Arc::new(SqliteSnapshotIngestor::new(&config.db_path, config.busy_timeout));
    let (tx, rx) = mpsc::channel::<SnapshotJob>(config.channel_buffer);

    let runtime = tokio::spawn(start_snapshot_ingestion(
        rx,
        sink,
        config.ingest_workers,
        RetryPolicy::new(config.ingest_max_retries),
    ));

    let mut outcomes = Vec::new();
    for path in paths {
        match load_snapshot(&path) {
            Ok(snapshot) => {
                let job = SnapshotJob {
                    source: path.display().to_string(),
                    snapshot,
                };
                if tx.send(job).await.is_err() {
                    error!("❌ Ingestion runtime stopped accepting snapshots");
                    break;
                }
            }
            Err(rejected) => outcomes.push(rejected),
        }
    }
    drop(tx);

    outcomes.extend(runtime.await?);
    Ok(IngestionReport::from_outcomes(&outcomes))
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(report) => {
            info!(
                "📊 Ingested {}/{} snapshots ({} samples written, {} failed)",
                report.succeeded, report.total, report.samples_written, report.failed
            );
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    error!("❌ Failed to serialize report: {}", e);
                    std::process::exit(1);
                }
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Snapshot ingestion failed: {}", e);
            println!("{}", serde_json::json!({ "error": e.to_string() }));
            std::process::exit(1);
        }
    }
}
