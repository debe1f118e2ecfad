//! End-to-end tests: collector JSON -> ingestion -> compaction
//!
//! Everything goes through the public API against a throwaway on-disk
//! database, the same way the two binaries drive it.

#[cfg(test)]
mod pipeline_integration_tests {
    use chrono::NaiveDate;
    use parkflow::pipeline::{
        compact, open_connection, run_schema_migrations, bundled_schema_dir, start_snapshot_ingestion,
        DateWindow, IngestionReport, RetryPolicy, Snapshot, SnapshotJob, SnapshotOutcome,
        SnapshotSink, SqliteSnapshotIngestor, StandbyWait,
    };
    use parkflow::sqlite_pragma::DEFAULT_BUSY_TIMEOUT;
    use rusqlite::Connection;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn setup() -> (TempDir, PathBuf, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("parkflow.db");
        let mut conn = open_connection(&db_path, DEFAULT_BUSY_TIMEOUT).unwrap();
        run_schema_migrations(&mut conn, bundled_schema_dir()).unwrap();
        (dir, db_path, conn)
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    fn snapshot_json(timestamp: &str, entries: Vec<Value>) -> String {
        json!({
            "timestamp": timestamp,
            "destination": "Test Resort",
            "park": "Test Park",
            "data": {
                "id": "P1",
                "liveData": entries,
            }
        })
        .to_string()
    }

    fn ride(id: &str, status: &str, wait: Value) -> Value {
        json!({
            "id": id,
            "name": format!("Ride {}", id),
            "entityType": "ATTRACTION",
            "status": status,
            "queue": { "STANDBY": { "waitTime": wait } },
        })
    }

    fn day() -> DateWindow {
        DateWindow::for_day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).unwrap()
    }

    /// Five samples for A1: (OPERATING,10) x2, (OPERATING,15) x2, (DOWN,none)
    fn ingest_run_sequence(ingestor: &SqliteSnapshotIngestor) {
        let sequence = [
            ("2024-01-01T10:00:00Z", "OPERATING", json!(10)),
            ("2024-01-01T10:05:00Z", "OPERATING", json!(10)),
            ("2024-01-01T10:10:00Z", "OPERATING", json!(15)),
            ("2024-01-01T10:15:00Z", "OPERATING", json!(15)),
            ("2024-01-01T10:20:00Z", "DOWN", Value::Null),
        ];
        for (timestamp, status, wait) in sequence {
            ingestor
                .ingest_json(&snapshot_json(timestamp, vec![ride("A1", status, wait)]))
                .unwrap();
        }
    }

    fn remaining_states(conn: &Connection) -> Vec<(String, StandbyWait)> {
        let mut stmt = conn
            .prepare(
                "SELECT s.key, w.stand_by FROM wait w
                 JOIN attraction_status s ON s.id = w.attraction_status_id
                 ORDER BY w.attraction_id, w.timestamp, w.id",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_single_snapshot_creates_dimensions_and_sample() {
        let (_dir, db_path, conn) = setup();
        let ingestor = SqliteSnapshotIngestor::new(&db_path, DEFAULT_BUSY_TIMEOUT);

        let summary = ingestor
            .ingest_json(&snapshot_json(
                "2024-01-01T10:00:00Z",
                vec![ride("A1", "OPERATING", json!(15))],
            ))
            .unwrap();

        assert_eq!(summary.samples_written, 1);
        assert_eq!(count(&conn, "destination"), 1);
        assert_eq!(count(&conn, "park"), 1);
        assert_eq!(count(&conn, "attraction"), 1);
        assert_eq!(count(&conn, "attraction_status"), 1);
        assert_eq!(count(&conn, "wait"), 1);

        let (status, stand_by): (String, StandbyWait) = conn
            .query_row(
                "SELECT s.key, w.stand_by FROM wait w
                 JOIN attraction_status s ON s.id = w.attraction_status_id",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "OPERATING");
        assert_eq!(stand_by, StandbyWait::Minutes(15));
    }

    #[test]
    fn test_compaction_keeps_run_starts() {
        let (_dir, db_path, mut conn) = setup();
        let ingestor = SqliteSnapshotIngestor::new(&db_path, DEFAULT_BUSY_TIMEOUT);
        ingest_run_sequence(&ingestor);

        let result = compact(&mut conn, &day(), 100, false).unwrap();

        assert_eq!(result.date, "2024-01-01");
        assert_eq!(result.total_records, 5);
        assert_eq!(result.records_kept, 3);
        assert_eq!(result.records_deleted, 2);
        assert_eq!(result.compression_ratio, Some(0.6));
        assert_eq!(
            remaining_states(&conn),
            vec![
                ("OPERATING".to_string(), StandbyWait::Minutes(10)),
                ("OPERATING".to_string(), StandbyWait::Minutes(15)),
                ("DOWN".to_string(), StandbyWait::NotReported),
            ]
        );

        // Second pass finds nothing left to remove
        let again = compact(&mut conn, &day(), 100, false).unwrap();
        assert_eq!(again.total_records, 3);
        assert_eq!(again.records_deleted, 0);
        assert_eq!(count(&conn, "wait"), 3);
    }

    #[test]
    fn test_empty_window() {
        let (_dir, _db_path, mut conn) = setup();

        let result = compact(&mut conn, &day(), 100, false).unwrap();

        assert_eq!(result.total_records, 0);
        assert_eq!(result.records_kept, 0);
        assert_eq!(result.records_deleted, 0);
        assert_eq!(result.compression_ratio, None);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json["compression_ratio"].is_null());
    }

    #[test]
    fn test_dry_run_reports_without_deleting() {
        let (_dir, db_path, mut conn) = setup();
        let ingestor = SqliteSnapshotIngestor::new(&db_path, DEFAULT_BUSY_TIMEOUT);
        ingest_run_sequence(&ingestor);

        let result = compact(&mut conn, &day(), 100, true).unwrap();

        assert!(result.dry_run);
        assert_eq!(result.records_kept, 3);
        assert_eq!(result.records_deleted, 2);
        assert_eq!(count(&conn, "wait"), 5);
    }

    #[test]
    fn test_compaction_leaves_other_days_alone() {
        let (_dir, db_path, mut conn) = setup();
        let ingestor = SqliteSnapshotIngestor::new(&db_path, DEFAULT_BUSY_TIMEOUT);
        ingest_run_sequence(&ingestor);
        for timestamp in ["2024-01-02T10:00:00Z", "2024-01-02T10:05:00Z"] {
            ingestor
                .ingest_json(&snapshot_json(timestamp, vec![ride("A1", "DOWN", Value::Null)]))
                .unwrap();
        }

        let result = compact(&mut conn, &day(), 1, false).unwrap();

        assert_eq!(result.total_records, 5);
        assert_eq!(count(&conn, "wait"), 5);
    }

    #[test]
    fn test_run_keep_invariant_and_conservation() {
        let (_dir, db_path, mut conn) = setup();
        let ingestor = SqliteSnapshotIngestor::new(&db_path, DEFAULT_BUSY_TIMEOUT);

        let waits = [5, 5, 10, 10, 10, 5, 5, 20, 20, 5];
        for (i, wait) in waits.iter().enumerate() {
            let timestamp = format!("2024-01-01T{:02}:00:00Z", 8 + i);
            let status_b = if i % 4 == 0 { "CLOSED" } else { "OPERATING" };
            ingestor
                .ingest_json(&snapshot_json(
                    &timestamp,
                    vec![
                        ride("A1", "OPERATING", json!(wait)),
                        ride("A2", status_b, json!(wait)),
                    ],
                ))
                .unwrap();
        }
        let before = count(&conn, "wait");

        let result = compact(&mut conn, &day(), 3, false).unwrap();

        assert_eq!(result.total_records as i64, before);
        assert_eq!(result.records_kept + result.records_deleted, result.total_records);
        assert_eq!(count(&conn, "wait"), result.records_kept as i64);

        let mut stmt = conn
            .prepare(
                "SELECT attraction_id, attraction_status_id, stand_by FROM wait
                 ORDER BY attraction_id, timestamp, id",
            )
            .unwrap();
        let rows: Vec<(i64, i64, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for pair in rows.windows(2) {
            if pair[0].0 == pair[1].0 {
                assert_ne!((pair[0].1, pair[0].2), (pair[1].1, pair[1].2));
            }
        }
    }

    #[test]
    fn test_invalid_snapshot_writes_nothing() {
        let (_dir, db_path, conn) = setup();
        let ingestor = SqliteSnapshotIngestor::new(&db_path, DEFAULT_BUSY_TIMEOUT);

        let err = ingestor
            .ingest_json(&snapshot_json(
                "2024-01-01T10:00:00Z",
                vec![ride("A1", "OPERATING", json!(10)), ride("A2", "OPERATING", json!(-3))],
            ))
            .unwrap_err();

        assert!(err.is_validation());
        assert_eq!(count(&conn, "destination"), 0);
        assert_eq!(count(&conn, "wait"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runtime_reports_per_snapshot_outcomes() {
        let (_dir, db_path, conn) = setup();
        let sink: Arc<dyn SnapshotSink> =
            Arc::new(SqliteSnapshotIngestor::new(&db_path, DEFAULT_BUSY_TIMEOUT));
        let (tx, rx) = mpsc::channel(4);

        let runtime = tokio::spawn(start_snapshot_ingestion(rx, sink, 3, RetryPolicy::new(3)));

        for minute in 0..6 {
            let json = snapshot_json(
                &format!("2024-01-01T10:{:02}:00Z", minute * 5),
                vec![ride("A1", "OPERATING", json!(10)), ride("A2", "OPERATING", json!(25))],
            );
            let job = SnapshotJob {
                source: format!("snapshot-{}.json", minute),
                snapshot: Snapshot::from_json(&json).unwrap(),
            };
            tx.send(job).await.unwrap();
        }
        drop(tx);

        let mut outcomes = runtime.await.unwrap();
        let invalid = Snapshot::from_json("{\"destination\": \"Test Resort\"}").unwrap_err();
        outcomes.push(SnapshotOutcome::rejected("broken.json", invalid.into()));

        let report = IngestionReport::from_outcomes(&outcomes);
        assert_eq!(report.total, 7);
        assert_eq!(report.succeeded, 6);
        assert_eq!(report.failed, 1);
        assert_eq!(report.samples_written, 12);
        assert_eq!(report.failures[0].source, "broken.json");
        assert!(!report.is_success());

        assert_eq!(count(&conn, "wait"), 12);
        assert_eq!(count(&conn, "attraction"), 2);
        assert_eq!(count(&conn, "destination"), 1);
    }
}
