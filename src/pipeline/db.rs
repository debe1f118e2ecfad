//! Store access: connection setup and schema migrations
//!
//! The relational schema lives in `sql/*.sql`. Each file must be idempotent
//! (`IF NOT EXISTS`) so every binary can run the loader on startup.

use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Open a tuned connection to the park store
///
/// Creates the parent directory if needed. Each ingestion call and each
/// compaction run owns exactly one connection opened through here.
pub fn open_connection(
    db_path: impl AsRef<Path>,
    busy_timeout: Duration,
) -> rusqlite::Result<Connection> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::warn!(
                    "⚠️  Could not create database directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
    }

    let conn = Connection::open(db_path)?;
    apply_optimized_pragmas(&conn, busy_timeout)?;
    Ok(conn)
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir`, sorted by file name
/// (00_, 01_, ...), and executes each one as a batch.
///
/// Returns: Ok(()) if all migrations succeed, Err(...) on first failure
pub fn run_schema_migrations(
    conn: &mut Connection,
    schema_dir: impl AsRef<Path>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let schema_path = schema_dir.as_ref();

    if !schema_path.exists() {
        return Err(format!("Schema directory not found: {}", schema_path.display()).into());
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_path.display());

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;

        log::debug!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// Path to the schema files shipped with the crate
///
/// Used by tests so they do not depend on the working directory.
pub fn bundled_schema_dir() -> &'static str {
    concat!(env!("CARGO_MANIFEST_DIR"), "/sql")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::sqlite_pragma::DEFAULT_BUSY_TIMEOUT;
    use tempfile::TempDir;

    /// Fresh on-disk database with the full schema applied
    pub fn create_test_db() -> (TempDir, std::path::PathBuf, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("parkflow.db");
        let mut conn = open_connection(&db_path, DEFAULT_BUSY_TIMEOUT).unwrap();
        run_schema_migrations(&mut conn, bundled_schema_dir()).unwrap();
        (dir, db_path, conn)
    }

    pub fn count_rows(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
    }
}
