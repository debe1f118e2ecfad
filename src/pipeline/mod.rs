//! # Park Wait-Time Pipeline
//!
//! Turns raw theme-park snapshots into a normalized relational store and
//! keeps that store compact.
//!
//! ## Architecture
//!
//! ```text
//! snapshot JSON ─► Snapshot::from_json ─► SnapshotSink ─► ingest_snapshot (1 tx)
//!                   (validation)            ▲                 │
//!                                            │                 ├─► resolve (dimensions)
//!                        start_snapshot_ingestion              └─► wait rows
//!                        (bounded workers + retry)
//!
//! wait rows ─► compact (per day) ─► plan_compaction ─► batched DELETE (1 tx)
//! ```
//!
//! **Key Principle:** a snapshot is all-or-nothing. Either every dimension
//! row and every wait sample it implies is committed, or none are.
//!
//! ## Schema Reference
//!
//! Tables live in `/sql/`:
//! - `destination`, `park`, `attraction`, `attraction_type`, `attraction_status`
//!   → resolved through `resolver::NewEntity`
//! - `wait` → written by `ingestor`, pruned by `compaction`
//!
//! ## Module Organization
//!
//! - `snapshot` - Snapshot parsing and validation
//! - `resolver` - Get-or-create for dimension entities
//! - `ingestor` - One snapshot, one transaction
//! - `ingestion` - Async multi-snapshot runtime
//! - `compaction` - Run-length compaction of wait samples
//! - `retry` - Exponential backoff for transient store errors
//! - `db` - Connections and schema migrations
//! - `config` - Environment configuration

pub mod compaction;
pub mod config;
pub mod db;
pub mod ingestion;
pub mod ingestor;
pub mod resolver;
pub mod retry;
pub mod snapshot;

// Re-export commonly used types
pub use compaction::{compact, plan_compaction, CompactionError, CompactionPlan, CompactionResult, DateWindow, WaitRow};
pub use config::{CompactionConfig, ConfigError, PipelineConfig};
pub use db::{bundled_schema_dir, open_connection, run_schema_migrations};
pub use ingestion::{
    ingest_with_retry, start_snapshot_ingestion, IngestionReport, RetryPolicy, SnapshotJob,
    SnapshotOutcome,
};
pub use ingestor::{ingest_snapshot, IngestError, IngestSummary, SnapshotSink, SqliteSnapshotIngestor};
pub use resolver::{resolve, EntityKind, NewEntity, ResolveError};
pub use snapshot::{LiveEntry, Snapshot, StandbyWait, ValidationError};
