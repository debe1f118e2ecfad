//! Snapshot ingestor: one snapshot in, one committed transaction out
//!
//! Tables written:
//! - `destination`, `park`, `attraction_type`, `attraction`,
//!   `attraction_status` - resolved by natural key (see `resolver`)
//! - `wait` - INSERT (append-only), one row per attraction entry
//!
//! All-or-nothing per snapshot: the whole snapshot runs inside one
//! `BEGIN IMMEDIATE` transaction and the first failing entry aborts it.
//! Dropping the uncommitted transaction (error, panic, cancelled task)
//! rolls it back, so commit is the single point of durability.

use super::resolver::{display_name, resolve, NewEntity, ResolveError};
use super::snapshot::{LiveEntry, Snapshot, ValidationError};
use crate::pipeline::db::open_connection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum IngestError {
    Validation(ValidationError),
    Resolve(ResolveError),
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    /// Snapshot source could not be read
    Io(String),
    /// The blocking ingestion task panicked or was cancelled
    Join(String),
}

impl IngestError {
    /// Store was busy or locked; the same snapshot may succeed on retry
    pub fn is_transient(&self) -> bool {
        let db_error = match self {
            IngestError::Database(e) => Some(e),
            IngestError::Resolve(e) => e.database_error(),
            _ => None,
        };
        matches!(
            db_error.and_then(|e| e.sqlite_error_code()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, IngestError::Validation(_))
    }
}

impl From<ValidationError> for IngestError {
    fn from(err: ValidationError) -> Self {
        IngestError::Validation(err)
    }
}

impl From<ResolveError> for IngestError {
    fn from(err: ResolveError) -> Self {
        IngestError::Resolve(err)
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Database(err)
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Serialization(err)
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Validation(e) => write!(f, "Validation error: {}", e),
            IngestError::Resolve(e) => write!(f, "Resolution error: {}", e),
            IngestError::Database(e) => write!(f, "Database error: {}", e),
            IngestError::Serialization(e) => write!(f, "Serialization error: {}", e),
            IngestError::Io(e) => write!(f, "I/O error: {}", e),
            IngestError::Join(e) => write!(f, "Ingestion task failed: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

/// Result of one committed snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub destination_id: i64,
    pub park_id: i64,
    pub samples_written: usize,
    /// Entries describing the park itself
    pub skipped_entries: usize,
    pub observed_at: DateTime<Utc>,
}

/// Destination for validated snapshots
///
/// Each call is independent; implementations must not share a transaction
/// between calls.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn ingest(&self, snapshot: Snapshot) -> Result<IngestSummary, IngestError>;

    fn backend_type(&self) -> &'static str;
}

/// Ingest one validated snapshot on `conn`
///
/// Resolve destination -> park -> per entry (type, attraction, status) and
/// append one wait row per attraction entry, all in one transaction.
pub fn ingest_snapshot(conn: &mut Connection, snapshot: &Snapshot) -> Result<IngestSummary, IngestError> {
    let ingested_at = Utc::now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let destination_id = resolve(
        &tx,
        &NewEntity::Destination {
            oid: &snapshot.destination_oid,
            name: &snapshot.destination,
            timezone: snapshot.timezone_or_default(),
            location: &snapshot.destination,
        },
    )?;
    log::debug!("   ├─ Destination '{}' -> id={}", snapshot.destination, destination_id);

    let park_id = resolve(
        &tx,
        &NewEntity::Park {
            oid: &snapshot.park_oid,
            destination_id,
            name: &snapshot.park_name,
            location: &snapshot.destination,
        },
    )?;
    log::debug!("   ├─ Park '{}' -> id={}", snapshot.park_name, park_id);

    let mut writer = SampleWriter {
        park_id,
        observed_at: snapshot.observed_at,
        ingested_at,
        type_ids: HashMap::new(),
        status_ids: HashMap::new(),
    };

    let mut samples_written = 0;
    let mut skipped_entries = 0;

    for entry in &snapshot.entries {
        if entry.is_park() {
            log::debug!("   ├─ Skipping PARK entry: {}", entry.name);
            skipped_entries += 1;
            continue;
        }

        if let Err(e) = writer.write(&tx, entry) {
            log::error!(
                "❌ Failed on {} '{}' ({}), rolling back snapshot for park {}: {}",
                entry.entity_type,
                entry.name,
                entry.id,
                snapshot.park_oid,
                e
            );
            return Err(e);
        }
        samples_written += 1;
    }

    tx.commit()?;

    log::info!(
        "✅ Ingested {} samples for park '{}' @ {} (skipped {})",
        samples_written,
        snapshot.park_name,
        snapshot.observed_at.to_rfc3339(),
        skipped_entries
    );

    Ok(IngestSummary {
        destination_id,
        park_id,
        samples_written,
        skipped_entries,
        observed_at: snapshot.observed_at,
    })
}

/// Per-snapshot state for appending samples; caches type/status ids
struct SampleWriter<'s> {
    park_id: i64,
    observed_at: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
    type_ids: HashMap<&'s str, i64>,
    status_ids: HashMap<&'s str, i64>,
}

impl<'s> SampleWriter<'s> {
    fn write(&mut self, conn: &Connection, entry: &'s LiveEntry) -> Result<(), IngestError> {
        let attraction_type_id = match self.type_ids.get(entry.entity_type.as_str()) {
            Some(id) => *id,
            None => {
                let id = resolve(
                    conn,
                    &NewEntity::AttractionType {
                        key: &entry.entity_type,
                        type_name: display_name(&entry.entity_type),
                    },
                )?;
                self.type_ids.insert(&entry.entity_type, id);
                id
            }
        };

        let attraction_id = resolve(
            conn,
            &NewEntity::Attraction {
                oid: &entry.id,
                park_id: self.park_id,
                attraction_type_id,
                name: &entry.name,
                lat: entry.latitude,
                long: entry.longitude,
            },
        )?;

        let status_key = entry.status_key();
        let status_id = match self.status_ids.get(status_key) {
            Some(id) => *id,
            None => {
                let id = resolve(
                    conn,
                    &NewEntity::AttractionStatus {
                        key: status_key,
                        status: display_name(status_key),
                    },
                )?;
                self.status_ids.insert(status_key, id);
                id
            }
        };

        let forecast = entry.forecast.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&entry.raw)?;
        let last_updated = entry.last_updated.unwrap_or(self.ingested_at);

        conn.execute(
            "INSERT INTO wait (
                attraction_id, attraction_status_id, timestamp, last_updated,
                stand_by, forecast, metadata, created_on
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attraction_id,
                status_id,
                self.observed_at.timestamp(),
                last_updated.timestamp(),
                entry.standby,
                forecast,
                metadata,
                self.ingested_at.timestamp(),
            ],
        )?;

        Ok(())
    }
}

/// SQLite-backed sink: one connection and one transaction per snapshot
#[derive(Debug, Clone)]
pub struct SqliteSnapshotIngestor {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteSnapshotIngestor {
    /// Create an ingestor for an existing, migrated database
    pub fn new(db_path: impl AsRef<Path>, busy_timeout: Duration) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    /// Validate raw collector JSON, then ingest it
    ///
    /// Validation failures return before any connection is opened.
    pub fn ingest_json(&self, json: &str) -> Result<IngestSummary, IngestError> {
        let snapshot = Snapshot::from_json(json)?;
        self.ingest_blocking(&snapshot)
    }

    pub fn ingest_blocking(&self, snapshot: &Snapshot) -> Result<IngestSummary, IngestError> {
        let mut conn = open_connection(&self.db_path, self.busy_timeout)?;
        ingest_snapshot(&mut conn, snapshot)
    }
}

#[async_trait]
impl SnapshotSink for SqliteSnapshotIngestor {
    async fn ingest(&self, snapshot: Snapshot) -> Result<IngestSummary, IngestError> {
        let ingestor = self.clone();
        tokio::task::spawn_blocking(move || ingestor.ingest_blocking(&snapshot))
            .await
            .map_err(|e| IngestError::Join(e.to_string()))?
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
