//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: dedup store and failure queue
    r#"
    -- ============================================
    -- Dedup store: one row per capture key, first write wins
    -- ============================================

    CREATE TABLE IF NOT EXISTS captures (
        capture_key      TEXT PRIMARY KEY,   -- platform|type|id
        captured_at      INTEGER NOT NULL,   -- epoch millis
        title            TEXT NOT NULL,
        url              TEXT NOT NULL
    );

    -- ============================================
    -- Failure queue: sealed batches awaiting acknowledgement
    -- ============================================

    CREATE TABLE IF NOT EXISTS failed_batches (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        id               TEXT NOT NULL UNIQUE,
        body             TEXT NOT NULL,      -- exact wire bytes, never re-encoded
        row_count        INTEGER NOT NULL,
        state            TEXT NOT NULL CHECK (state IN ('in_flight', 'failed')),
        attempts         INTEGER NOT NULL DEFAULT 0,
        enqueued_at      INTEGER NOT NULL,   -- epoch millis
        last_attempt_at  INTEGER,
        last_error       TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_captures_captured_at ON captures(captured_at DESC);
    "#,
    // Version 2: drain scans by state in enqueue order
    r#"
    CREATE INDEX IF NOT EXISTS idx_failed_batches_state ON failed_batches(state, seq);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["captures", "failed_batches"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_failed_batch_state_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO failed_batches (id, body, row_count, state, enqueued_at)
             VALUES ('x', '{}', 0, 'delivered', 0)",
            [],
        );
        assert!(result.is_err(), "unknown state should be rejected");
    }
}
