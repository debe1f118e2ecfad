//! Wait-sample compaction
//!
//! Samples are collected every few minutes whether or not anything changed.
//! For each attraction, a run is a maximal stretch of time-ordered samples
//! sharing the same (status, standby) pair. Compaction keeps the first
//! sample of every run and deletes the rest, so every state transition
//! survives and no two adjacent remaining samples share a pair.
//!
//! Flow:
//! 1. Load all `wait` rows observed inside the window
//! 2. Partition by attraction, order by (timestamp, id)
//! 3. Mark run starts "keep", everything else "delete"
//! 4. Delete marked ids in fixed-size batches inside ONE transaction
//!
//! An empty window returns before any transaction is opened; a dry run
//! stops after step 3.

use super::snapshot::StandbyWait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;

/// Ids logged as a sample of each side of the plan
const LOG_SAMPLE_SIZE: usize = 15;

/// SQLITE_MAX_VARIABLE_NUMBER of the bundled SQLite; one bind per id
pub const MAX_DELETE_BATCH: usize = 32_766;

#[derive(Debug)]
pub enum CompactionError {
    InvalidBatchSize,
    InvalidWindow(String),
    Database(rusqlite::Error),
}

impl From<rusqlite::Error> for CompactionError {
    fn from(err: rusqlite::Error) -> Self {
        CompactionError::Database(err)
    }
}

impl std::fmt::Display for CompactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionError::InvalidBatchSize => write!(f, "Batch size must be at least 1"),
            CompactionError::InvalidWindow(msg) => write!(f, "Invalid compaction window: {}", msg),
            CompactionError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for CompactionError {}

/// Half-open UTC interval `[start, end)` of observation times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CompactionError> {
        if start >= end {
            return Err(CompactionError::InvalidWindow(format!(
                "start {} is not before end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// The whole UTC calendar day `date`
    pub fn for_day(date: NaiveDate) -> Result<Self, CompactionError> {
        let next = date.checked_add_days(Days::new(1)).ok_or_else(|| {
            CompactionError::InvalidWindow(format!("{} has no following day", date))
        })?;
        Ok(Self {
            start: Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)),
            end: Utc.from_utc_datetime(&next.and_time(NaiveTime::MIN)),
        })
    }

    /// The UTC day `days_back` days before `today` (1 = yesterday)
    pub fn days_back(today: NaiveDate, days_back: u32) -> Result<Self, CompactionError> {
        let date = today
            .checked_sub_days(Days::new(u64::from(days_back)))
            .ok_or_else(|| {
                CompactionError::InvalidWindow(format!(
                    "{} days before {} is out of range",
                    days_back, today
                ))
            })?;
        Self::for_day(date)
    }

    /// `YYYY-MM-DD` of the window start
    pub fn label(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }
}

/// Minimal projection of a `wait` row needed for planning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRow {
    pub id: i64,
    pub attraction_id: i64,
    pub status_id: i64,
    pub stand_by: StandbyWait,
    pub timestamp: i64,
}

impl WaitRow {
    fn state(&self) -> (i64, StandbyWait) {
        (self.status_id, self.stand_by)
    }
}

/// Which rows survive and which go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Ids kept, ascending
    pub keep: Vec<i64>,
    /// Ids to delete, ascending
    pub delete: Vec<i64>,
}

impl CompactionPlan {
    pub fn total(&self) -> usize {
        self.keep.len() + self.delete.len()
    }
}

/// Mark the first sample of each (status, standby) run per attraction
///
/// Input order does not matter: rows are partitioned by attraction and
/// sorted by (timestamp, id) before the walk.
pub fn plan_compaction(rows: &[WaitRow]) -> CompactionPlan {
    let mut by_attraction: BTreeMap<i64, Vec<&WaitRow>> = BTreeMap::new();
    for row in rows {
        by_attraction.entry(row.attraction_id).or_default().push(row);
    }

    let mut plan = CompactionPlan::default();

    for samples in by_attraction.values_mut() {
        samples.sort_by_key(|row| (row.timestamp, row.id));

        let mut current: Option<(i64, StandbyWait)> = None;
        for row in samples.iter() {
            if current == Some(row.state()) {
                plan.delete.push(row.id);
            } else {
                current = Some(row.state());
                plan.keep.push(row.id);
            }
        }
    }

    plan.keep.sort_unstable();
    plan.delete.sort_unstable();
    plan
}

/// Structured result returned to the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionResult {
    pub date: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_records: usize,
    pub records_kept: usize,
    pub records_deleted: usize,
    /// kept / total; None for an empty window
    pub compression_ratio: Option<f64>,
    pub dry_run: bool,
}

impl CompactionResult {
    fn empty(window: &DateWindow, dry_run: bool) -> Self {
        Self {
            date: window.label(),
            window_start: window.start,
            window_end: window.end,
            total_records: 0,
            records_kept: 0,
            records_deleted: 0,
            compression_ratio: None,
            dry_run,
        }
    }
}

impl std::fmt::Display for CompactionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ratio = match self.compression_ratio {
            Some(r) => format!("{:.2}%", r * 100.0),
            None => "n/a".to_string(),
        };
        write!(
            f,
            "{}: {} records, kept {}, deleted {}, compression {}{}",
            self.date,
            self.total_records,
            self.records_kept,
            self.records_deleted,
            ratio,
            if self.dry_run { " (dry run)" } else { "" }
        )
    }
}

/// Load every wait row observed inside `window`
pub fn load_window_rows(conn: &Connection, window: &DateWindow) -> rusqlite::Result<Vec<WaitRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, attraction_id, attraction_status_id, stand_by, timestamp
         FROM wait
         WHERE timestamp >= ?1 AND timestamp < ?2
         ORDER BY timestamp ASC, id ASC",
    )?;

    let rows = stmt.query_map(params![window.start.timestamp(), window.end.timestamp()], |row| {
        Ok(WaitRow {
            id: row.get(0)?,
            attraction_id: row.get(1)?,
            status_id: row.get(2)?,
            stand_by: row.get(3)?,
            timestamp: row.get(4)?,
        })
    })?;

    rows.collect()
}

/// Delete `ids` in batches of `batch_size` inside a single transaction
///
/// Any failing batch rolls back every earlier batch. Returns rows actually
/// removed; ids already gone are skipped by the store. Batches larger than
/// `MAX_DELETE_BATCH` are split at that size.
pub fn delete_in_batches(
    conn: &mut Connection,
    ids: &[i64],
    batch_size: usize,
) -> Result<usize, CompactionError> {
    if batch_size == 0 {
        return Err(CompactionError::InvalidBatchSize);
    }
    let batch_size = if batch_size > MAX_DELETE_BATCH {
        log::warn!(
            "⚠️  Batch size {} exceeds SQLite bind limit, using {}",
            batch_size,
            MAX_DELETE_BATCH
        );
        MAX_DELETE_BATCH
    } else {
        batch_size
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let batch_count = ids.len().div_ceil(batch_size);
    let mut total_deleted = 0;

    for (index, batch) in ids.chunks(batch_size).enumerate() {
        let placeholders = vec!["?"; batch.len()].join(",");
        let sql = format!("DELETE FROM wait WHERE id IN ({})", placeholders);

        let deleted = match tx.execute(&sql, params_from_iter(batch.iter())) {
            Ok(n) => n,
            Err(e) => {
                log::error!(
                    "❌ Batch {} of {} failed, rolling back compaction: {}",
                    index + 1,
                    batch_count,
                    e
                );
                return Err(e.into());
            }
        };
        total_deleted += deleted;

        log::debug!(
            "   ├─ Deleted batch {} of {}, rows affected: {}",
            index + 1,
            batch_count,
            deleted
        );
    }

    tx.commit()?;
    Ok(total_deleted)
}

/// Run one compaction pass over `window`
pub fn compact(
    conn: &mut Connection,
    window: &DateWindow,
    batch_size: usize,
    dry_run: bool,
) -> Result<CompactionResult, CompactionError> {
    if batch_size == 0 {
        return Err(CompactionError::InvalidBatchSize);
    }

    log::info!(
        "🗜️  Compacting wait samples for {} (batch size: {}, dry run: {})",
        window.label(),
        batch_size,
        dry_run
    );

    let rows = load_window_rows(conn, window)?;
    log::info!("   ├─ Retrieved {} records", rows.len());

    if rows.is_empty() {
        log::info!("   └─ No data to process for {}", window.label());
        return Ok(CompactionResult::empty(window, dry_run));
    }

    let plan = plan_compaction(&rows);
    log::info!(
        "   ├─ Identified {} records to delete out of {} (keeping {})",
        plan.delete.len(),
        plan.total(),
        plan.keep.len()
    );
    log::debug!("   ├─ IDs to keep (sample): {:?}", sample(&plan.keep));
    log::debug!("   ├─ IDs to delete (sample): {:?}", sample(&plan.delete));

    let records_deleted = if dry_run {
        log::info!("   └─ Dry run - would have deleted {} records", plan.delete.len());
        plan.delete.len()
    } else if plan.delete.is_empty() {
        log::info!("   └─ Nothing to delete");
        0
    } else {
        let deleted = delete_in_batches(conn, &plan.delete, batch_size)?;
        if deleted != plan.delete.len() {
            log::warn!(
                "⚠️  Planned {} deletions but removed {} (rows deleted concurrently?)",
                plan.delete.len(),
                deleted
            );
        }
        log::info!("   └─ ✅ Deleted {} redundant records", deleted);
        deleted
    };

    let total = plan.total();
    Ok(CompactionResult {
        date: window.label(),
        window_start: window.start,
        window_end: window.end,
        total_records: total,
        records_kept: plan.keep.len(),
        records_deleted,
        compression_ratio: Some(plan.keep.len() as f64 / total as f64),
        dry_run,
    })
}

fn sample(ids: &[i64]) -> &[i64] {
    &ids[..ids.len().min(LOG_SAMPLE_SIZE)]
}
