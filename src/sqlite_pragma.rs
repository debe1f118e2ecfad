//! Shared SQLite connection tuning
//!
//! Every connection that touches the park store goes through
//! `apply_optimized_pragmas` so ingestion workers and the compaction job
//! agree on journaling, foreign-key enforcement and lock waiting.

use rusqlite::Connection;
use std::time::Duration;

/// Default time a connection waits on a locked database before failing
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Apply WAL journaling, foreign keys and a bounded busy timeout
///
/// - `journal_mode = WAL` lets readers proceed while a writer holds the lock
/// - `synchronous = NORMAL` is durable at commit under WAL
/// - `foreign_keys = ON` is per-connection in SQLite and must be set every time
/// - `busy_timeout` bounds how long a statement waits on another writer;
///   after it elapses the statement fails and the open transaction rolls back
pub fn apply_optimized_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("⚠️  journal_mode stayed '{}' (WAL unavailable)", mode);
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path().join("pragma.db")).unwrap();

        apply_optimized_pragmas(&conn, DEFAULT_BUSY_TIMEOUT).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let foreign_keys: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);

        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5_000);
    }
}
