//! Core domain types for aitrack
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Capture event** | A classified unit of user activity worth reporting (a chat, a project page) |
//! | **Capture key** | `platform|type|id`, the deduplication unit |
//! | **Batch** | Capture events signed and sent together in one POST |
//! | **Sealed batch** | A batch whose signature and wire body have been fixed |
//! | **Failed batch** | A sealed batch persisted until the endpoint acknowledges it |
//!
//! Once a batch is sealed its body is never re-encoded or re-signed: every
//! retry, replay, or post-restart recovery sends the exact same bytes.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of characters kept from a page title
pub const MAX_TITLE_CHARS: usize = 200;

/// Milliseconds since the Unix epoch
pub fn now_epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to a UTC timestamp
pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

// ============================================
// Capture events
// ============================================

/// A single observed resource, as produced by a classifier.
///
/// Field order is part of the wire format: the signature is computed over the
/// serialized rows, so it must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Source surface (e.g. "ChatGPT", "Claude")
    pub platform: String,
    /// Resource category (e.g. "Chat", "Project")
    #[serde(rename = "type")]
    pub kind: String,
    /// Human label, at most [`MAX_TITLE_CHARS`] characters
    pub title: String,
    pub url: String,
    /// Stable identifier within platform + type
    pub id: String,
    #[serde(default)]
    pub notes: String,
}

impl CaptureEvent {
    /// Create an event, trimming and truncating the title
    pub fn new(
        platform: impl Into<String>,
        kind: impl Into<String>,
        id: impl Into<String>,
        title: &str,
        url: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            kind: kind.into(),
            title: truncate_title(title),
            url: url.into(),
            id: id.into(),
            notes: String::new(),
        }
    }

    /// Attach free-form notes
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Apply the title limit to an event built without [`CaptureEvent::new`],
    /// e.g. one deserialized from host JSON
    pub fn normalized(mut self) -> Self {
        self.title = truncate_title(&self.title);
        self
    }

    /// The deduplication key: `platform|type|id`
    pub fn capture_key(&self) -> String {
        capture_key(&self.platform, &self.kind, &self.id)
    }

    /// Platform, type, and id must all be non-empty
    pub fn is_valid(&self) -> bool {
        !self.platform.trim().is_empty() && !self.kind.trim().is_empty() && !self.id.is_empty()
    }

    /// Metadata stored in the dedup store when this event is first seen
    pub fn record(&self, captured_at_ms: i64) -> CaptureRecord {
        CaptureRecord {
            captured_at_ms,
            title: self.title.clone(),
            url: self.url.clone(),
        }
    }
}

/// Build a capture key from its parts
pub fn capture_key(platform: &str, kind: &str, id: &str) -> String {
    format!("{}|{}|{}", platform, kind, id)
}

/// Trim whitespace and keep at most [`MAX_TITLE_CHARS`] characters
pub fn truncate_title(title: &str) -> String {
    title.trim().chars().take(MAX_TITLE_CHARS).collect()
}

/// Dedup store value, written once per capture key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub captured_at_ms: i64,
    pub title: String,
    pub url: String,
}

impl CaptureRecord {
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.captured_at_ms)
    }
}

// ============================================
// Batches
// ============================================

/// Rows plus their signature. Serializes to the wire body `{"rows":[...],"sig":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub rows: Vec<CaptureEvent>,
    #[serde(rename = "sig")]
    pub signature: String,
}

impl Batch {
    /// Canonical JSON body
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A signed batch with its wire body fixed, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBatch {
    /// Local identifier (UUID v4), never sent to the endpoint
    pub id: String,
    pub batch: Batch,
    /// Exact bytes POSTed on every attempt
    pub body: String,
}

impl SealedBatch {
    /// Seal a signed batch, encoding its body once
    pub fn new(batch: Batch) -> crate::Result<Self> {
        let body = batch.encode()?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch,
            body,
        })
    }

    /// Rebuild from a persisted body without re-encoding it
    pub fn from_body(id: String, body: String) -> crate::Result<Self> {
        let batch: Batch = serde_json::from_str(&body)?;
        Ok(Self { id, batch, body })
    }

    pub fn row_count(&self) -> usize {
        self.batch.rows.len()
    }
}

/// Lifecycle state of a persisted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Written ahead of the first delivery attempt; not yet acknowledged
    InFlight,
    /// Delivery gave up (retries exhausted or offline); waiting for recovery
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::InFlight => "in_flight",
            QueueState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(QueueState::InFlight),
            "failed" => Ok(QueueState::Failed),
            _ => Err(format!("unknown queue state: {}", s)),
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sealed batch persisted in the failure queue.
#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub sealed: SealedBatch,
    pub state: QueueState,
    /// Completed delivery cycles that ended in failure
    pub attempts: u32,
    pub enqueued_at_ms: i64,
    pub last_attempt_at_ms: Option<i64>,
    pub last_error: Option<String>,
}

impl FailedBatch {
    pub fn id(&self) -> &str {
        &self.sealed.id
    }

    pub fn batch(&self) -> &Batch {
        &self.sealed.batch
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.enqueued_at_ms)
    }
}
