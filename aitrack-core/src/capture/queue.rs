//! Durable failure queue
//!
//! Every sealed batch is written here as `in_flight` before its first attempt
//! and removed on acknowledgement. A batch that exhausts its retries (or
//! cannot be attempted at all) moves to `failed` and waits for the next
//! recovery drain. The stored body is the exact bytes that were signed.

use std::sync::{Arc, Mutex};

use super::client::DeliveryClient;
use crate::config::SettingsSource;
use crate::db::Database;
use crate::error::Result;
use crate::types::{now_epoch_millis, QueueState, SealedBatch};

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Batches actually sent to the endpoint
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Batches claimed by a concurrent drain
    pub skipped: usize,
}

/// A failure that storage rejected, held until it can be written
struct PendingFailure {
    sealed: SealedBatch,
    error: String,
    attempted: bool,
}

pub struct FailureQueue {
    db: Arc<Database>,
    client: Arc<DeliveryClient>,
    settings: Arc<dyn SettingsSource>,
    /// Batches whose persistence failed; retried before every drain
    unpersisted: Mutex<Vec<PendingFailure>>,
    /// Delivered batches whose removal failed; retried before every drain
    unacknowledged: Mutex<Vec<String>>,
}

impl FailureQueue {
    pub fn new(
        db: Arc<Database>,
        client: Arc<DeliveryClient>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            db,
            client,
            settings,
            unpersisted: Mutex::new(Vec::new()),
            unacknowledged: Mutex::new(Vec::new()),
        }
    }

    /// Record a batch as in flight before it is first sent
    pub fn write_ahead(&self, sealed: &SealedBatch) -> Result<()> {
        self.db
            .insert_batch(sealed, QueueState::InFlight, now_epoch_millis())
    }

    /// Persist the exact batch that failed.
    ///
    /// `attempted` is false when the cycle never reached the network, in which
    /// case the stored attempt count is left alone. If storage is unavailable
    /// the batch is kept in memory and persisted on the next drain; the error
    /// is still returned so it gets logged.
    pub fn enqueue(&self, sealed: &SealedBatch, error: &str, attempted: bool) -> Result<()> {
        match self
            .db
            .upsert_failed(sealed, error, attempted, now_epoch_millis())
        {
            Ok(()) => {
                tracing::info!(
                    batch_id = %sealed.id,
                    rows = sealed.row_count(),
                    error,
                    "Batch queued for retry"
                );
                Ok(())
            }
            Err(e) => {
                self.unpersisted.lock().unwrap().push(PendingFailure {
                    sealed: sealed.clone(),
                    error: error.to_string(),
                    attempted,
                });
                Err(e)
            }
        }
    }

    /// Remove a delivered batch.
    ///
    /// On a storage error the id is remembered and removal is retried before
    /// the next drain, so the batch is not replayed while this process runs.
    pub fn acknowledge(&self, batch_id: &str) -> Result<()> {
        if let Err(e) = self.db.remove_batch(batch_id) {
            self.unacknowledged
                .lock()
                .unwrap()
                .push(batch_id.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Move batches abandoned mid-delivery back to `failed`
    pub fn reclaim_in_flight(&self) -> Result<usize> {
        self.db.reclaim_in_flight()
    }

    /// Batches held in memory because storage rejected them
    pub fn unpersisted_count(&self) -> usize {
        self.unpersisted.lock().unwrap().len() + self.unacknowledged.lock().unwrap().len()
    }

    /// Retry writes storage rejected earlier. Returns how many succeeded.
    pub fn persist_pending(&self) -> Result<usize> {
        let pending = std::mem::take(&mut *self.unpersisted.lock().unwrap());
        let delivered = std::mem::take(&mut *self.unacknowledged.lock().unwrap());
        let mut written = 0;
        let mut first_err = None;

        let mut remaining = Vec::new();
        for failure in pending {
            match self.db.upsert_failed(
                &failure.sealed,
                &failure.error,
                failure.attempted,
                now_epoch_millis(),
            ) {
                Ok(()) => written += 1,
                Err(e) => {
                    remaining.push(failure);
                    first_err.get_or_insert(e);
                }
            }
        }
        self.unpersisted.lock().unwrap().extend(remaining);

        let mut still_delivered = Vec::new();
        for id in delivered {
            match self.db.remove_batch(&id) {
                Ok(_) => written += 1,
                Err(e) => {
                    still_delivered.push(id);
                    first_err.get_or_insert(e);
                }
            }
        }
        self.unacknowledged.lock().unwrap().extend(still_delivered);

        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Try every `failed` batch once, oldest first.
    ///
    /// Each batch is claimed before it is sent, so overlapping drains never
    /// send the same batch twice. Failures go back to `failed`, with their
    /// attempt count bumped only if a request was made. Once a batch is
    /// claimed a storage error never ends the pass; the outcome is held in
    /// memory and written before the next drain.
    pub async fn drain_and_retry(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        if !self.client.is_online() {
            tracing::debug!("Offline, skipping drain");
            return Ok(report);
        }

        if let Err(e) = self.persist_pending() {
            tracing::warn!(error = %e, "Could not persist in-memory batches");
        }

        let Some(endpoint) = self.settings.current()?.endpoint else {
            tracing::warn!("No endpoint configured, leaving failed batches queued");
            return Ok(report);
        };

        let batches = self.db.list_failed_batches(Some(QueueState::Failed))?;
        if batches.is_empty() {
            return Ok(report);
        }
        tracing::debug!(count = batches.len(), "Draining failure queue");

        for failed in batches {
            let sealed = failed.sealed;
            match self.db.claim_failed(&sealed.id, now_epoch_millis()) {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(batch_id = %sealed.id, error = %e, "Could not claim batch");
                    report.skipped += 1;
                    continue;
                }
            }

            match self.client.deliver_once(&endpoint, &sealed).await {
                Ok(_) => {
                    report.attempted += 1;
                    report.delivered += 1;
                    if let Err(e) = self.acknowledge(&sealed.id) {
                        tracing::warn!(
                            batch_id = %sealed.id,
                            error = %e,
                            "Delivered batch could not be removed"
                        );
                    }
                }
                Err(e) => {
                    let attempted = e.attempts() > 0;
                    if attempted {
                        report.attempted += 1;
                        report.failed += 1;
                    }
                    if let Err(store_err) = self.enqueue(&sealed, &e.to_string(), attempted) {
                        tracing::warn!(
                            batch_id = %sealed.id,
                            error = %store_err,
                            "Failed batch held in memory"
                        );
                    }
                    if !self.client.is_online() {
                        tracing::debug!("Went offline during drain");
                        break;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::client::testing::ScriptedTransport;
    use crate::capture::client::RetryPolicy;
    use crate::capture::recovery::Connectivity;
    use crate::capture::signer;
    use crate::config::{Settings, StaticSettings};
    use crate::types::CaptureEvent;

    struct Fixture {
        db: Arc<Database>,
        transport: Arc<ScriptedTransport>,
        connectivity: Connectivity,
        queue: FailureQueue,
    }

    fn fixture(transport: Arc<ScriptedTransport>, settings: StaticSettings) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let db = Arc::new(db);
        let connectivity = Connectivity::new(true);
        let client = Arc::new(DeliveryClient::new(
            transport.clone(),
            connectivity.clone(),
            RetryPolicy::default(),
        ));
        let queue = FailureQueue::new(db.clone(), client, Arc::new(settings));
        Fixture {
            db,
            transport,
            connectivity,
            queue,
        }
    }

    fn sealed(id: &str) -> SealedBatch {
        signer::seal(
            vec![CaptureEvent::new(
                "Claude",
                "Chat",
                id,
                "t",
                format!("https://claude.ai/chat/{}", id),
            )],
            "k",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_drain_delivers_and_removes() {
        let f = fixture(ScriptedTransport::always(200), StaticSettings::new("https://hook", "k"));
        let batch = sealed("a");
        f.queue.enqueue(&batch, "server error (500)", true).unwrap();

        let report = f.queue.drain_and_retry().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(f.db.count_failed_batches(QueueState::Failed).unwrap(), 0);
        assert_eq!(f.transport.bodies(), vec![batch.body.clone()]);
        assert_eq!(f.transport.endpoints(), vec!["https://hook".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_drain_increments_attempts() {
        let f = fixture(ScriptedTransport::always(500), StaticSettings::new("https://hook", "k"));
        let batch = sealed("a");
        f.queue.enqueue(&batch, "first", true).unwrap();

        let report = f.queue.drain_and_retry().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.transport.call_count(), 1);

        let stored = f.db.get_failed_batch(&batch.id).unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Failed);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.sealed.body, batch.body);
    }

    #[tokio::test]
    async fn test_drain_offline_is_noop() {
        let f = fixture(ScriptedTransport::always(200), StaticSettings::new("https://hook", "k"));
        f.queue.enqueue(&sealed("a"), "e", true).unwrap();
        f.connectivity.set_online(false);

        let report = f.queue.drain_and_retry().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(f.transport.call_count(), 0);
        assert_eq!(f.db.count_failed_batches(QueueState::Failed).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_without_endpoint_keeps_batches() {
        let f = fixture(
            ScriptedTransport::always(200),
            StaticSettings(Settings {
                endpoint: None,
                secret: Some("k".to_string()),
            }),
        );
        f.queue.enqueue(&sealed("a"), "e", true).unwrap();

        f.queue.drain_and_retry().await.unwrap();
        assert_eq!(f.transport.call_count(), 0);
        assert_eq!(f.db.count_failed_batches(QueueState::Failed).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_skips_in_flight_and_drains_in_order() {
        let f = fixture(ScriptedTransport::always(200), StaticSettings::new("https://hook", "k"));
        let a = sealed("a");
        let b = sealed("b");
        let c = sealed("c");
        f.queue.enqueue(&a, "e", true).unwrap();
        f.queue.write_ahead(&b).unwrap();
        f.queue.enqueue(&c, "e", true).unwrap();

        f.queue.drain_and_retry().await.unwrap();
        assert_eq!(f.transport.bodies(), vec![a.body, c.body]);
        assert_eq!(f.db.count_failed_batches(QueueState::InFlight).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_then_drain() {
        let f = fixture(ScriptedTransport::always(200), StaticSettings::new("https://hook", "k"));
        f.queue.write_ahead(&sealed("a")).unwrap();

        assert_eq!(f.queue.reclaim_in_flight().unwrap(), 1);
        let report = f.queue.drain_and_retry().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(f.db.queue_stats().unwrap().failed_batches, 0);
    }

    #[tokio::test]
    async fn test_drain_survives_failed_requeue() {
        let f = fixture(ScriptedTransport::always(500), StaticSettings::new("https://hook", "k"));
        let a = sealed("a");
        let b = sealed("b");
        f.queue.enqueue(&a, "e", true).unwrap();
        f.queue.enqueue(&b, "e", true).unwrap();
        f.db.connection()
            .execute_batch(
                "CREATE TRIGGER reject_requeue BEFORE UPDATE OF attempts ON failed_batches
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        // Both batches are tried even though neither outcome can be stored
        let report = f.queue.drain_and_retry().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(f.transport.bodies(), vec![a.body.clone(), b.body.clone()]);
        assert_eq!(f.queue.unpersisted_count(), 2);

        f.db.connection()
            .execute_batch("DROP TRIGGER reject_requeue;")
            .unwrap();
        assert_eq!(f.queue.persist_pending().unwrap(), 2);
        assert_eq!(f.queue.unpersisted_count(), 0);
        assert_eq!(f.db.count_failed_batches(QueueState::InFlight).unwrap(), 0);

        let stored = f.db.get_failed_batch(&a.id).unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Failed);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn test_unremovable_delivery_is_not_replayed() {
        let f = fixture(ScriptedTransport::always(200), StaticSettings::new("https://hook", "k"));
        let batch = sealed("a");
        f.queue.enqueue(&batch, "e", true).unwrap();
        f.db.connection()
            .execute_batch(
                "CREATE TRIGGER reject_delete BEFORE DELETE ON failed_batches
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let report = f.queue.drain_and_retry().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(f.queue.unpersisted_count(), 1);
        assert_eq!(f.db.count_failed_batches(QueueState::InFlight).unwrap(), 1);

        f.db.connection()
            .execute_batch("DROP TRIGGER reject_delete;")
            .unwrap();
        let report = f.queue.drain_and_retry().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(f.transport.call_count(), 1);
        assert_eq!(f.db.queue_stats().unwrap().queued_rows, 0);
        assert_eq!(f.queue.unpersisted_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_requeue_keeps_attempt_count() {
        let f = fixture(ScriptedTransport::always(200), StaticSettings::new("https://hook", "k"));
        let batch = sealed("a");
        f.queue.write_ahead(&batch).unwrap();
        f.queue.enqueue(&batch, "offline after 0 attempt(s)", false).unwrap();

        let stored = f.db.get_failed_batch(&batch.id).unwrap().unwrap();
        assert_eq!(stored.state, QueueState::Failed);
        assert_eq!(stored.attempts, 0);
    }
}
