//! Database repository layer
//!
//! Every mutation is a single SQL statement so concurrent writers (a fresh
//! delivery and a recovery drain, or two processes sharing the file) never
//! lose updates through a read-then-write gap.

use crate::error::Result;
use crate::types::*;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Queue depth and last-failure summary for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of distinct capture keys recorded
    pub captured_count: i64,
    /// Batches waiting for the next recovery trigger
    pub failed_batches: i64,
    /// Batches written ahead of an unacknowledged attempt
    pub in_flight_batches: i64,
    /// Rows across all persisted batches
    pub queued_rows: i64,
    /// Oldest enqueue time among persisted batches
    pub oldest_enqueued_at_ms: Option<i64>,
    /// Most recent recorded delivery error
    pub last_error: Option<String>,
}

/// Raw `failed_batches` row before the body is decoded
struct FailedRow {
    id: String,
    body: String,
    state: String,
    attempts: i64,
    enqueued_at: i64,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
}

impl FailedRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            body: row.get(1)?,
            state: row.get(2)?,
            attempts: row.get(3)?,
            enqueued_at: row.get(4)?,
            last_attempt_at: row.get(5)?,
            last_error: row.get(6)?,
        })
    }

    fn into_failed_batch(self) -> Result<FailedBatch> {
        let state = self
            .state
            .parse::<QueueState>()
            .map_err(crate::error::Error::Config)?;
        Ok(FailedBatch {
            sealed: SealedBatch::from_body(self.id, self.body)?,
            state,
            attempts: self.attempts.max(0) as u32,
            enqueued_at_ms: self.enqueued_at,
            last_attempt_at_ms: self.last_attempt_at,
            last_error: self.last_error,
        })
    }
}

const FAILED_COLUMNS: &str =
    "id, body, state, attempts, enqueued_at, last_attempt_at, last_error";

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets a `flush` command and a running `watch` share the file
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Raw connection, for tests that need to inject storage faults
    #[cfg(test)]
    pub(crate) fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Capture (dedup) operations
    // ============================================

    /// Check whether a capture key has been recorded
    pub fn is_captured(&self, capture_key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM captures WHERE capture_key = ?1",
                params![capture_key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a capture key. First write wins.
    ///
    /// Returns true if this call inserted the record, false if the key was
    /// already present (the stored record is left untouched).
    pub fn record_captured(&self, capture_key: &str, record: &CaptureRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO captures (capture_key, captured_at, title, url)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![capture_key, record.captured_at_ms, record.title, record.url],
        )?;
        Ok(inserted == 1)
    }

    /// Get the record stored for a capture key
    pub fn get_capture(&self, capture_key: &str) -> Result<Option<CaptureRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT captured_at, title, url FROM captures WHERE capture_key = ?1",
                params![capture_key],
                |row| {
                    Ok(CaptureRecord {
                        captured_at_ms: row.get(0)?,
                        title: row.get(1)?,
                        url: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Most recently captured keys, newest first
    pub fn recent_captures(&self, limit: usize) -> Result<Vec<(String, CaptureRecord)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT capture_key, captured_at, title, url
            FROM captures
            ORDER BY captured_at DESC, capture_key
            LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    CaptureRecord {
                        captured_at_ms: row.get(1)?,
                        title: row.get(2)?,
                        url: row.get(3)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Count recorded capture keys
    pub fn count_captures(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM captures", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Forget specific capture keys so they can be captured again.
    /// Returns the number removed.
    pub fn forget_captures(&self, capture_keys: &[String]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("DELETE FROM captures WHERE capture_key = ?1")?;
        let mut removed = 0;
        for key in capture_keys {
            removed += stmt.execute(params![key])?;
        }
        Ok(removed)
    }

    /// Forget all capture keys. Returns the number removed.
    pub fn clear_captures(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM captures", [])?)
    }

    // ============================================
    // Failure queue operations
    // ============================================

    /// Persist a sealed batch in the given state with zero attempts
    pub fn insert_batch(&self, sealed: &SealedBatch, state: QueueState, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO failed_batches (id, body, row_count, state, attempts, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            params![
                sealed.id,
                sealed.body,
                sealed.row_count() as i64,
                state.as_str(),
                now_ms
            ],
        )?;
        Ok(())
    }

    /// Mark a batch as failed after a delivery cycle.
    ///
    /// `attempts` counts delivery cycles that reached the network, so it is
    /// only incremented when `attempted` is true. Inserts the batch if it was
    /// never written ahead, so the exact batch that failed is always persisted.
    pub fn upsert_failed(
        &self,
        sealed: &SealedBatch,
        error: &str,
        attempted: bool,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO failed_batches
                (id, body, row_count, state, attempts, enqueued_at, last_attempt_at, last_error)
            VALUES (?1, ?2, ?3, 'failed', ?6, ?4, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                state = 'failed',
                attempts = attempts + excluded.attempts,
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error
            "#,
            params![
                sealed.id,
                sealed.body,
                sealed.row_count() as i64,
                now_ms,
                error,
                attempted as i64
            ],
        )?;
        Ok(())
    }

    /// Claim a failed batch for a replay attempt.
    ///
    /// Returns false if another drain already claimed it or it was removed.
    pub fn claim_failed(&self, id: &str, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE failed_batches
            SET state = 'in_flight', last_attempt_at = ?2
            WHERE id = ?1 AND state = 'failed'
            "#,
            params![id, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Remove an acknowledged batch. Returns true if it existed.
    pub fn remove_batch(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM failed_batches WHERE id = ?1", params![id])?;
        Ok(removed == 1)
    }

    /// Return batches left `in_flight` by a previous process to `failed`.
    pub fn reclaim_in_flight(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE failed_batches SET state = 'failed' WHERE state = 'in_flight'",
            [],
        )?;
        Ok(changed)
    }

    /// Get a persisted batch by id
    pub fn get_failed_batch(&self, id: &str) -> Result<Option<FailedBatch>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM failed_batches WHERE id = ?1", FAILED_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], FailedRow::from_row)
            .optional()?;
        drop(conn);
        row.map(FailedRow::into_failed_batch).transpose()
    }

    /// List persisted batches in enqueue order, optionally filtered by state
    pub fn list_failed_batches(&self, state: Option<QueueState>) -> Result<Vec<FailedBatch>> {
        let conn = self.conn.lock().unwrap();
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {} FROM failed_batches WHERE state = ?1 ORDER BY seq",
                    FAILED_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![state.as_str()], FailedRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let sql = format!("SELECT {} FROM failed_batches ORDER BY seq", FAILED_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], FailedRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        drop(conn);

        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_failed_batch() {
                Ok(batch) => batches.push(batch),
                // A corrupt body cannot be replayed; leave it for inspection
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable failed batch"),
            }
        }
        Ok(batches)
    }

    /// Count persisted batches in a given state
    pub fn count_failed_batches(&self, state: QueueState) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM failed_batches WHERE state = ?1",
            params![state.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Delete every persisted batch. Returns the number removed.
    pub fn clear_failed_batches(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM failed_batches", [])?)
    }

    /// Queue depth and last failure for the diagnostic surface
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap();

        let captured_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM captures", [], |r| r.get(0))?;

        let (failed_batches, in_flight_batches, queued_rows, oldest): (
            i64,
            i64,
            i64,
            Option<i64>,
        ) = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'in_flight' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(row_count), 0),
                MIN(enqueued_at)
            FROM failed_batches
            "#,
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;

        let last_error: Option<String> = conn
            .query_row(
                r#"
                SELECT last_error FROM failed_batches
                WHERE last_error IS NOT NULL
                ORDER BY last_attempt_at DESC
                LIMIT 1
                "#,
                [],
                |r| r.get(0),
            )
            .optional()?;

        Ok(QueueStats {
            captured_count,
            failed_batches,
            in_flight_batches,
            queued_rows,
            oldest_enqueued_at_ms: oldest,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn create_test_sealed(id: &str) -> SealedBatch {
        let batch = Batch {
            rows: vec![CaptureEvent::new(
                "ChatGPT",
                "Chat",
                id,
                "Title",
                format!("https://chatgpt.com/c/{}", id),
            )],
            signature: "c2lnbmF0dXJl".to_string(),
        };
        SealedBatch::new(batch).unwrap()
    }

    fn create_test_record(title: &str) -> CaptureRecord {
        CaptureRecord {
            captured_at_ms: 1_700_000_000_000,
            title: title.to_string(),
            url: "https://chatgpt.com/c/abc".to_string(),
        }
    }

    #[test]
    fn test_record_captured_first_write_wins() {
        let db = create_test_db();
        let key = "ChatGPT|Chat|abc";

        assert!(!db.is_captured(key).unwrap());

        let first = create_test_record("first");
        assert!(db.record_captured(key, &first).unwrap());
        assert!(db.is_captured(key).unwrap());

        let second = create_test_record("second");
        assert!(!db.record_captured(key, &second).unwrap());

        assert_eq!(db.get_capture(key).unwrap(), Some(first));
        assert_eq!(db.count_captures().unwrap(), 1);
    }

    #[test]
    fn test_recent_captures_and_clear() {
        let db = create_test_db();
        let mut older = create_test_record("older");
        older.captured_at_ms = 1;
        let mut newer = create_test_record("newer");
        newer.captured_at_ms = 2;
        db.record_captured("a|Chat|1", &older).unwrap();
        db.record_captured("a|Chat|2", &newer).unwrap();

        let recent = db.recent_captures(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].0, "a|Chat|2");

        assert_eq!(
            db.forget_captures(&["a|Chat|1".to_string(), "a|Chat|9".to_string()])
                .unwrap(),
            1
        );
        assert!(!db.is_captured("a|Chat|1").unwrap());
        assert!(db.is_captured("a|Chat|2").unwrap());

        assert_eq!(db.clear_captures().unwrap(), 1);
        assert!(!db.is_captured("a|Chat|2").unwrap());
    }

    #[test]
    fn test_insert_and_list_preserves_body() {
        let db = create_test_db();
        let sealed = create_test_sealed("one");
        db.insert_batch(&sealed, QueueState::InFlight, 10).unwrap();

        let all = db.list_failed_batches(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sealed, sealed);
        assert_eq!(all[0].state, QueueState::InFlight);
        assert_eq!(all[0].attempts, 0);
        assert_eq!(all[0].enqueued_at_ms, 10);

        assert!(db
            .list_failed_batches(Some(QueueState::Failed))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_upsert_failed_increments_attempts() {
        let db = create_test_db();
        let sealed = create_test_sealed("one");

        // Never written ahead: inserted with one attempt
        db.upsert_failed(&sealed, "http 500", true, 20).unwrap();
        let batch = db.get_failed_batch(&sealed.id).unwrap().unwrap();
        assert_eq!(batch.state, QueueState::Failed);
        assert_eq!(batch.attempts, 1);
        assert_eq!(batch.enqueued_at_ms, 20);

        db.upsert_failed(&sealed, "timeout", true, 30).unwrap();
        let batch = db.get_failed_batch(&sealed.id).unwrap().unwrap();
        assert_eq!(batch.attempts, 2);
        assert_eq!(batch.enqueued_at_ms, 20);
        assert_eq!(batch.last_attempt_at_ms, Some(30));
        assert_eq!(batch.last_error.as_deref(), Some("timeout"));
        assert_eq!(batch.sealed.body, sealed.body);
    }

    #[test]
    fn test_upsert_failed_without_network_keeps_attempts() {
        let db = create_test_db();
        let sealed = create_test_sealed("one");
        db.insert_batch(&sealed, QueueState::InFlight, 10).unwrap();

        db.upsert_failed(&sealed, "offline", false, 20).unwrap();
        let batch = db.get_failed_batch(&sealed.id).unwrap().unwrap();
        assert_eq!(batch.state, QueueState::Failed);
        assert_eq!(batch.attempts, 0);
        assert_eq!(batch.last_error.as_deref(), Some("offline"));

        db.upsert_failed(&sealed, "http 503", true, 30).unwrap();
        db.upsert_failed(&sealed, "offline", false, 40).unwrap();
        let batch = db.get_failed_batch(&sealed.id).unwrap().unwrap();
        assert_eq!(batch.attempts, 1);
        assert_eq!(batch.last_attempt_at_ms, Some(40));
    }

    #[test]
    fn test_claim_failed_is_exclusive() {
        let db = create_test_db();
        let sealed = create_test_sealed("one");
        db.upsert_failed(&sealed, "offline", false, 1).unwrap();

        assert!(db.claim_failed(&sealed.id, 2).unwrap());
        assert!(!db.claim_failed(&sealed.id, 3).unwrap());

        let batch = db.get_failed_batch(&sealed.id).unwrap().unwrap();
        assert_eq!(batch.state, QueueState::InFlight);

        assert!(db.remove_batch(&sealed.id).unwrap());
        assert!(!db.remove_batch(&sealed.id).unwrap());
        assert!(!db.claim_failed(&sealed.id, 4).unwrap());
    }

    #[test]
    fn test_reclaim_in_flight() {
        let db = create_test_db();
        db.insert_batch(&create_test_sealed("a"), QueueState::InFlight, 1)
            .unwrap();
        db.insert_batch(&create_test_sealed("b"), QueueState::InFlight, 2)
            .unwrap();
        db.upsert_failed(&create_test_sealed("c"), "offline", false, 3)
            .unwrap();

        assert_eq!(db.reclaim_in_flight().unwrap(), 2);
        assert_eq!(db.count_failed_batches(QueueState::Failed).unwrap(), 3);
        assert_eq!(db.count_failed_batches(QueueState::InFlight).unwrap(), 0);

        // Enqueue order is preserved
        let ids: Vec<String> = db
            .list_failed_batches(Some(QueueState::Failed))
            .unwrap()
            .into_iter()
            .map(|b| b.batch().rows[0].id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_queue_stats() {
        let db = create_test_db();
        assert_eq!(db.queue_stats().unwrap(), QueueStats::default());

        db.record_captured("k|Chat|1", &create_test_record("t"))
            .unwrap();
        db.insert_batch(&create_test_sealed("a"), QueueState::InFlight, 5)
            .unwrap();
        db.upsert_failed(&create_test_sealed("b"), "http 502", true, 7)
            .unwrap();

        let stats = db.queue_stats().unwrap();
        assert_eq!(stats.captured_count, 1);
        assert_eq!(stats.in_flight_batches, 1);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.queued_rows, 2);
        assert_eq!(stats.oldest_enqueued_at_ms, Some(5));
        assert_eq!(stats.last_error.as_deref(), Some("http 502"));

        assert_eq!(db.clear_failed_batches().unwrap(), 2);
        assert_eq!(db.queue_stats().unwrap().queued_rows, 0);
    }
}
