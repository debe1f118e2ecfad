//! Natural-key entity resolution for dimension tables
//!
//! `resolve` returns the surrogate id for a natural key, inserting the row
//! on first sight. Existing rows are never modified.
//!
//! Race safety comes from the store: every natural-key column is UNIQUE and
//! the insert is `ON CONFLICT DO NOTHING`. A resolver that loses the race
//! sees zero affected rows and re-reads the winner's id.

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Destination,
    Park,
    AttractionType,
    Attraction,
    AttractionStatus,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Destination => "destination",
            EntityKind::Park => "park",
            EntityKind::AttractionType => "attraction_type",
            EntityKind::Attraction => "attraction",
            EntityKind::AttractionStatus => "attraction_status",
        }
    }

    /// Column holding the natural key
    pub fn key_column(&self) -> &'static str {
        match self {
            EntityKind::AttractionType | EntityKind::AttractionStatus => "key",
            _ => "oid",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Attributes used only when the natural key has not been seen before
#[derive(Debug, Clone, PartialEq)]
pub enum NewEntity<'a> {
    Destination {
        oid: &'a str,
        name: &'a str,
        timezone: &'a str,
        location: &'a str,
    },
    Park {
        oid: &'a str,
        destination_id: i64,
        name: &'a str,
        location: &'a str,
    },
    AttractionType {
        key: &'a str,
        type_name: String,
    },
    Attraction {
        oid: &'a str,
        park_id: i64,
        attraction_type_id: i64,
        name: &'a str,
        lat: f64,
        long: f64,
    },
    AttractionStatus {
        key: &'a str,
        status: String,
    },
}

impl<'a> NewEntity<'a> {
    pub fn kind(&self) -> EntityKind {
        match self {
            NewEntity::Destination { .. } => EntityKind::Destination,
            NewEntity::Park { .. } => EntityKind::Park,
            NewEntity::AttractionType { .. } => EntityKind::AttractionType,
            NewEntity::Attraction { .. } => EntityKind::Attraction,
            NewEntity::AttractionStatus { .. } => EntityKind::AttractionStatus,
        }
    }

    pub fn natural_key(&self) -> &'a str {
        match self {
            NewEntity::Destination { oid, .. }
            | NewEntity::Park { oid, .. }
            | NewEntity::Attraction { oid, .. } => *oid,
            NewEntity::AttractionType { key, .. } | NewEntity::AttractionStatus { key, .. } => *key,
        }
    }

    /// Insert unless the natural key already exists; returns rows affected
    fn insert_if_absent(&self, conn: &Connection) -> rusqlite::Result<usize> {
        match self {
            NewEntity::Destination {
                oid,
                name,
                timezone,
                location,
            } => conn.execute(
                "INSERT INTO destination (oid, name, timezone, location)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(oid) DO NOTHING",
                params![oid, name, timezone, location],
            ),
            NewEntity::Park {
                oid,
                destination_id,
                name,
                location,
            } => conn.execute(
                "INSERT INTO park (destination_id, oid, name, location)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(oid) DO NOTHING",
                params![destination_id, oid, name, location],
            ),
            NewEntity::AttractionType { key, type_name } => conn.execute(
                "INSERT INTO attraction_type (key, type_name)
                 VALUES (?1, ?2)
                 ON CONFLICT(key) DO NOTHING",
                params![key, type_name],
            ),
            NewEntity::Attraction {
                oid,
                park_id,
                attraction_type_id,
                name,
                lat,
                long,
            } => conn.execute(
                "INSERT INTO attraction (park_id, attraction_type_id, oid, name, lat, long)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(oid) DO NOTHING",
                params![park_id, attraction_type_id, oid, name, lat, long],
            ),
            NewEntity::AttractionStatus { key, status } => conn.execute(
                "INSERT INTO attraction_status (key, status)
                 VALUES (?1, ?2)
                 ON CONFLICT(key) DO NOTHING",
                params![key, status],
            ),
        }
    }
}

#[derive(Debug)]
pub enum ResolveError {
    Database {
        kind: EntityKind,
        key: String,
        source: rusqlite::Error,
    },
    /// Insert reported a conflict but the winning row could not be read back
    Vanished { kind: EntityKind, key: String },
}

impl ResolveError {
    pub fn database_error(&self) -> Option<&rusqlite::Error> {
        match self {
            ResolveError::Database { source, .. } => Some(source),
            ResolveError::Vanished { .. } => None,
        }
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Database { kind, key, source } => {
                write!(f, "Failed to resolve {} '{}': {}", kind, key, source)
            }
            ResolveError::Vanished { kind, key } => {
                write!(f, "{} '{}' conflicted on insert but could not be re-read", kind, key)
            }
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::Database { source, .. } => Some(source),
            ResolveError::Vanished { .. } => None,
        }
    }
}

/// Look up the surrogate id for a natural key
pub fn lookup(conn: &Connection, kind: EntityKind, key: &str) -> rusqlite::Result<Option<i64>> {
    let sql = format!(
        "SELECT id FROM {} WHERE {} = ?1",
        kind.table(),
        kind.key_column()
    );
    conn.query_row(&sql, [key], |row| row.get(0)).optional()
}

/// Return the id for `entity`'s natural key, creating the row if absent
///
/// Works on a plain connection or inside a transaction (`&Transaction`
/// derefs to `&Connection`).
pub fn resolve(conn: &Connection, entity: &NewEntity<'_>) -> Result<i64, ResolveError> {
    let kind = entity.kind();
    let key = entity.natural_key();
    let db_err = |source: rusqlite::Error| ResolveError::Database {
        kind,
        key: key.to_string(),
        source,
    };

    if let Some(id) = lookup(conn, kind, key).map_err(db_err)? {
        return Ok(id);
    }

    let inserted = entity.insert_if_absent(conn).map_err(db_err)?;
    if inserted == 1 {
        let id = conn.last_insert_rowid();
        log::debug!("   ├─ Created {} '{}' (id={})", kind, key, id);
        return Ok(id);
    }

    // Another writer committed the same key between lookup and insert
    log::debug!("   ├─ {} '{}' created concurrently, re-reading", kind, key);
    lookup(conn, kind, key)
        .map_err(db_err)?
        .ok_or_else(|| ResolveError::Vanished {
            kind,
            key: key.to_string(),
        })
}

/// `ATTRACTION` -> `Attraction`, `OPERATING` -> `Operating`
pub fn display_name(code: &str) -> String {
    let mut chars = code.chars();
    match chars.next() {
        Some(first) => {
            let mut name = String::with_capacity(code.len());
            name.push(first);
            name.push_str(&chars.as_str().to_lowercase());
            name
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_support::{count_rows, create_test_db};
    use crate::pipeline::db::open_connection;
    use crate::sqlite_pragma::DEFAULT_BUSY_TIMEOUT;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn destination<'a>(oid: &'a str, name: &'a str) -> NewEntity<'a> {
        NewEntity::Destination {
            oid,
            name,
            timezone: "America/New_York",
            location: name,
        }
    }

    #[test]
    fn test_resolve_creates_then_reuses() {
        let (_dir, _path, conn) = create_test_db();

        let first = resolve(&conn, &destination("D1", "Test Resort")).unwrap();
        let second = resolve(&conn, &destination("D1", "Test Resort")).unwrap();

        assert_eq!(first, second);
        assert_eq!(count_rows(&conn, "destination"), 1);
    }

    #[test]
    fn test_existing_attributes_not_overwritten() {
        let (_dir, _path, conn) = create_test_db();

        let id = resolve(&conn, &destination("D1", "Original Name")).unwrap();
        let again = resolve(&conn, &destination("D1", "Renamed Resort")).unwrap();
        assert_eq!(id, again);

        let name: String = conn
            .query_row("SELECT name FROM destination WHERE id = ?1", [id], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Original Name");
    }

    #[test]
    fn test_key_columns_per_kind() {
        let (_dir, _path, conn) = create_test_db();

        let type_id = resolve(
            &conn,
            &NewEntity::AttractionType {
                key: "ATTRACTION",
                type_name: display_name("ATTRACTION"),
            },
        )
        .unwrap();
        let status_id = resolve(
            &conn,
            &NewEntity::AttractionStatus {
                key: "OPERATING",
                status: display_name("OPERATING"),
            },
        )
        .unwrap();

        assert_eq!(lookup(&conn, EntityKind::AttractionType, "ATTRACTION").unwrap(), Some(type_id));
        assert_eq!(lookup(&conn, EntityKind::AttractionStatus, "OPERATING").unwrap(), Some(status_id));
        assert_eq!(lookup(&conn, EntityKind::AttractionStatus, "DOWN").unwrap(), None);

        let type_name: String = conn
            .query_row("SELECT type_name FROM attraction_type WHERE id = ?1", [type_id], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(type_name, "Attraction");
    }

    #[test]
    fn test_park_requires_existing_destination() {
        let (_dir, _path, conn) = create_test_db();

        let result = resolve(
            &conn,
            &NewEntity::Park {
                oid: "P1",
                destination_id: 999,
                name: "Orphan Park",
                location: "Nowhere",
            },
        );

        let err = result.unwrap_err();
        assert!(err.database_error().is_some());
        assert!(err.to_string().contains("park 'P1'"));
        assert_eq!(count_rows(&conn, "park"), 0);
    }

    #[test]
    fn test_concurrent_resolution_single_row() {
        let (_dir, db_path, _conn) = create_test_db();
        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let barrier = barrier.clone();
                let db_path = db_path.clone();
                thread::spawn(move || {
                    let conn = open_connection(&db_path, DEFAULT_BUSY_TIMEOUT).unwrap();
                    barrier.wait();
                    resolve(
                        &conn,
                        &NewEntity::AttractionStatus {
                            key: "OPERATING",
                            status: "Operating".to_string(),
                        },
                    )
                    .unwrap()
                })
            })
            .collect();

        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        let conn = open_connection(&db_path, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert_eq!(count_rows(&conn, "attraction_status"), 1);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("ATTRACTION"), "Attraction");
        assert_eq!(display_name("OPERATING"), "Operating");
        assert_eq!(display_name("SHOW"), "Show");
        assert_eq!(display_name(""), "");
    }
}
