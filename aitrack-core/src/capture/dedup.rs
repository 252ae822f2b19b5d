//! Dedup store: decides whether a capture event is novel.

use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::error::Result;
use crate::types::{CaptureEvent, CaptureRecord};

/// Outcome of offering an event to the dedup store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First time this capture key was seen; the record was written
    Novel,
    /// Already recorded; the event must be dropped
    Duplicate,
}

/// Durable capture-key store with first-write-wins semantics.
///
/// The database is the only source of truth. `last_key` only short-circuits
/// the common case of the same page being reported repeatedly in a row.
pub struct DedupStore {
    db: Arc<Database>,
    last_key: Mutex<Option<String>>,
}

impl DedupStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            last_key: Mutex::new(None),
        }
    }

    pub fn is_captured(&self, capture_key: &str) -> Result<bool> {
        self.db.is_captured(capture_key)
    }

    /// Record a key. A second call for the same key leaves the stored record unchanged.
    pub fn record_captured(&self, capture_key: &str, record: &CaptureRecord) -> Result<bool> {
        self.db.record_captured(capture_key, record)
    }

    pub fn get(&self, capture_key: &str) -> Result<Option<CaptureRecord>> {
        self.db.get_capture(capture_key)
    }

    /// Check and record in one atomic step.
    ///
    /// Two racing callers offering the same key get exactly one `Novel`.
    pub fn admit(&self, event: &CaptureEvent, now_ms: i64) -> Result<Admission> {
        let key = event.capture_key();

        if self.last_key.lock().unwrap().as_deref() == Some(key.as_str()) {
            tracing::trace!(capture_key = %key, "Same key as previous event");
            return Ok(Admission::Duplicate);
        }

        let inserted = self.db.record_captured(&key, &event.record(now_ms))?;
        *self.last_key.lock().unwrap() = Some(key);

        Ok(if inserted {
            Admission::Novel
        } else {
            Admission::Duplicate
        })
    }

    /// Forget events that were admitted but never sealed, so a later
    /// capture of the same page is accepted again.
    pub fn release(&self, events: &[CaptureEvent]) -> Result<usize> {
        let keys: Vec<String> = events.iter().map(CaptureEvent::capture_key).collect();
        let removed = self.db.forget_captures(&keys)?;
        let mut last_key = self.last_key.lock().unwrap();
        if last_key.as_ref().is_some_and(|k| keys.contains(k)) {
            *last_key = None;
        }
        Ok(removed)
    }

    /// Forget the consecutive-key shortcut (after the store is cleared)
    pub fn reset_last_key(&self) {
        *self.last_key.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_store() -> DedupStore {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        DedupStore::new(Arc::new(db))
    }

    fn event(id: &str, title: &str) -> CaptureEvent {
        CaptureEvent::new(
            "ChatGPT",
            "Chat",
            id,
            title,
            format!("https://chatgpt.com/c/{}", id),
        )
    }

    #[test]
    fn test_record_is_idempotent() {
        let store = create_store();
        let m1 = CaptureRecord {
            captured_at_ms: 1,
            title: "one".to_string(),
            url: "u1".to_string(),
        };
        let m2 = CaptureRecord {
            captured_at_ms: 2,
            title: "two".to_string(),
            url: "u2".to_string(),
        };

        assert!(store.record_captured("k", &m1).unwrap());
        assert!(store.is_captured("k").unwrap());
        assert!(!store.record_captured("k", &m2).unwrap());
        assert_eq!(store.get("k").unwrap(), Some(m1));
    }

    #[test]
    fn test_only_first_event_per_key_is_novel() {
        let store = create_store();
        let first = event("abc", "Hello");

        assert_eq!(store.admit(&first, 10).unwrap(), Admission::Novel);
        assert_eq!(
            store.admit(&event("abc", "Renamed"), 20).unwrap(),
            Admission::Duplicate
        );
        assert_eq!(store.admit(&event("def", "Other"), 30).unwrap(), Admission::Novel);
        // Not consecutive any more, so the store itself rejects it
        assert_eq!(
            store.admit(&event("abc", "Again"), 40).unwrap(),
            Admission::Duplicate
        );

        let record = store.get(&first.capture_key()).unwrap().unwrap();
        assert_eq!(record.title, "Hello");
        assert_eq!(record.captured_at_ms, 10);
    }

    #[test]
    fn test_shortcut_does_not_hide_store_reset() {
        let db = Arc::new({
            let db = Database::open_in_memory().unwrap();
            db.migrate().unwrap();
            db
        });
        let store = DedupStore::new(db.clone());
        let e = event("abc", "Hello");

        assert_eq!(store.admit(&e, 1).unwrap(), Admission::Novel);
        db.clear_captures().unwrap();
        store.reset_last_key();
        assert_eq!(store.admit(&e, 2).unwrap(), Admission::Novel);
    }

    #[test]
    fn test_released_events_are_novel_again() {
        let store = create_store();
        let a = event("abc", "Hello");
        let b = event("def", "Other");

        assert_eq!(store.admit(&a, 1).unwrap(), Admission::Novel);
        assert_eq!(store.admit(&b, 2).unwrap(), Admission::Novel);
        assert_eq!(store.release(&[b.clone()]).unwrap(), 1);

        assert!(store.is_captured(&a.capture_key()).unwrap());
        assert_eq!(store.admit(&b, 3).unwrap(), Admission::Novel);
    }
}
