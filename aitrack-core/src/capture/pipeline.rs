//! Capture pipeline: dedup → debounce → sign → deliver → queue
//!
//! [`CapturePipeline`] is the single entry point for a host. Events are
//! admitted synchronously through the dedup store, then handed to a worker
//! task that owns the accumulator. When the debounce window closes the
//! worker seals the batch, writes it ahead to the failure queue and spawns
//! its delivery cycle. Delivery failures never reach the caller; they are
//! logged, counted and persisted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};

use super::accumulator::BatchAccumulator;
use super::client::{DeliveryClient, RetryPolicy, Transport};
use super::dedup::{Admission, DedupStore};
use super::queue::{DrainReport, FailureQueue};
use super::recovery::{self, Connectivity, RecoveryReason};
use super::signer;
use crate::config::{DeliveryConfig, SettingsSource};
use crate::db::{Database, QueueStats};
use crate::error::{Error, Result};
use crate::types::{now_epoch_millis, CaptureEvent, SealedBatch};

/// Grace period for deliveries still running when the command channel closes
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// Tunables for a pipeline instance
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Quiet period after the last event before a batch is flushed
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1200),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            debounce: config.debounce(),
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// What happened to a submitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Nothing to capture (not a recognized page)
    Ignored,
    /// Already captured before
    Duplicate,
    /// Accepted into the current batch
    Queued,
}

/// Final result of one flushed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { batch_id: String, rows: usize },
    /// Delivery failed; the batch is in the failure queue
    Queued { batch_id: String, error: String },
    /// The batch could not be signed and was discarded
    Dropped { rows: usize, reason: String },
    /// Settings could not be read; the rows wait for the next flush
    Deferred { rows: usize, reason: String },
}

/// Running counters for this process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    pub batches_sent: u64,
    pub events_sent: u64,
    pub batches_failed: u64,
    pub batches_dropped: u64,
    pub batches_deferred: u64,
    pub duplicates: u64,
    pub ignored: u64,
}

/// Snapshot for status displays
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub queue: QueueStats,
    pub stats: PublishStats,
    pub online: bool,
    /// Failed batches held in memory because storage rejected them
    pub unpersisted: usize,
}

enum Command {
    Push(CaptureEvent),
    Flush(oneshot::Sender<Option<DeliveryOutcome>>),
    Shutdown {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

pub struct CapturePipeline {
    db: Arc<Database>,
    dedup: Arc<DedupStore>,
    queue: Arc<FailureQueue>,
    connectivity: Connectivity,
    commands: mpsc::UnboundedSender<Command>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    stats: Arc<Mutex<PublishStats>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    watcher: JoinHandle<()>,
    startup: Mutex<Option<JoinHandle<Option<DrainReport>>>>,
}

impl CapturePipeline {
    /// Start the pipeline.
    ///
    /// Batches abandoned in flight by a previous run are reclaimed before
    /// anything new is written, then a startup drain runs in the background.
    pub async fn start(
        db: Arc<Database>,
        settings: Arc<dyn SettingsSource>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        options: PipelineOptions,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(
            transport,
            connectivity.clone(),
            options.retry,
        ));
        let queue = Arc::new(FailureQueue::new(db.clone(), client.clone(), settings.clone()));

        recovery::reclaim_abandoned(&queue)?;

        let startup = {
            let queue = queue.clone();
            tokio::spawn(async move { recovery::trigger(&queue, RecoveryReason::Startup).await })
        };
        let watcher = recovery::spawn_online_watcher(queue.clone(), &connectivity);

        let (commands, rx) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let stats = Arc::new(Mutex::new(PublishStats::default()));
        let dedup = Arc::new(DedupStore::new(db.clone()));

        let worker = Worker {
            accumulator: BatchAccumulator::new(options.debounce),
            settings,
            dedup: dedup.clone(),
            deliveries: JoinSet::new(),
            ctx: DeliveryContext {
                client,
                queue: queue.clone(),
                stats: stats.clone(),
                outcomes: outcomes.clone(),
            },
        };
        let worker = tokio::spawn(worker.run(rx));

        tracing::info!(
            debounce_ms = options.debounce.as_millis() as u64,
            max_retries = options.retry.max_retries,
            "Capture pipeline started"
        );

        Ok(Self {
            dedup,
            db,
            queue,
            connectivity,
            commands,
            outcomes,
            stats,
            worker: Mutex::new(Some(worker)),
            watcher,
            startup: Mutex::new(Some(startup)),
        })
    }

    /// Offer a classifier result to the pipeline.
    ///
    /// `None` means the page was not recognized. Novel events are recorded
    /// in the dedup store before this returns.
    pub fn submit(&self, event: Option<CaptureEvent>) -> Result<Submission> {
        let Some(event) = event
            .filter(CaptureEvent::is_valid)
            .map(CaptureEvent::normalized)
        else {
            self.stats.lock().unwrap().ignored += 1;
            return Ok(Submission::Ignored);
        };

        match self.dedup.admit(&event, now_epoch_millis())? {
            Admission::Duplicate => {
                self.stats.lock().unwrap().duplicates += 1;
                tracing::trace!(capture_key = %event.capture_key(), "Duplicate capture");
                Ok(Submission::Duplicate)
            }
            Admission::Novel => {
                tracing::debug!(
                    platform = %event.platform,
                    kind = %event.kind,
                    id = %event.id,
                    "Captured"
                );
                self.commands
                    .send(Command::Push(event))
                    .map_err(|_| Error::Closed)?;
                Ok(Submission::Queued)
            }
        }
    }

    /// Flush the current batch now instead of waiting for the debounce.
    ///
    /// Resolves once that batch's delivery cycle has finished, or at once
    /// if the batch was deferred. Returns `None` if nothing was pending.
    pub async fn flush(&self) -> Result<Option<DeliveryOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Subscribe to per-batch outcomes
    pub fn outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.outcomes.subscribe()
    }

    /// Report host connectivity. Coming online triggers a drain.
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Drain the failure queue now
    pub async fn drain_and_retry(&self) -> Result<DrainReport> {
        self.queue.drain_and_retry().await
    }

    /// Wait for the startup drain to finish. Later calls return `None`.
    pub async fn wait_for_recovery(&self) -> Option<DrainReport> {
        let handle = self.startup.lock().unwrap().take()?;
        handle.await.ok().flatten()
    }

    pub fn stats(&self) -> PublishStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn diagnostics(&self) -> Result<Diagnostics> {
        Ok(Diagnostics {
            queue: self.db.queue_stats()?,
            stats: self.stats(),
            online: self.connectivity.is_online(),
            unpersisted: self.queue.unpersisted_count(),
        })
    }

    /// Forget every captured key
    pub fn clear_captures(&self) -> Result<usize> {
        let removed = self.db.clear_captures()?;
        self.dedup.reset_last_key();
        Ok(removed)
    }

    /// Flush, then wait up to `grace` for in-progress deliveries.
    ///
    /// Deliveries still running after the grace period are aborted; their
    /// batches stay `in_flight` and are reclaimed on the next start. Rows
    /// that could not be sealed are released from the dedup store.
    pub async fn shutdown(&self, grace: Duration) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown { grace, done }).is_ok() {
            let _ = finished.await;
        }

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if let Some(startup) = self.startup.lock().unwrap().take() {
            startup.abort();
        }
        self.watcher.abort();

        tracing::info!("Capture pipeline stopped");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Everything a delivery task needs
#[derive(Clone)]
struct DeliveryContext {
    client: Arc<DeliveryClient>,
    queue: Arc<FailureQueue>,
    stats: Arc<Mutex<PublishStats>>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
}

impl DeliveryContext {
    fn publish(&self, outcome: DeliveryOutcome) -> DeliveryOutcome {
        // No subscribers is fine
        let _ = self.outcomes.send(outcome.clone());
        outcome
    }

    async fn deliver(self, sealed: SealedBatch, endpoint: Option<String>) -> DeliveryOutcome {
        let rows = sealed.row_count();

        let result = match endpoint {
            Some(endpoint) => self
                .client
                .deliver(&endpoint, &sealed)
                .await
                .map_err(|e| (e.attempts() > 0, e.to_string())),
            None => Err((false, "no endpoint configured".to_string())),
        };

        let outcome = match result {
            Ok(_) => {
                if let Err(e) = self.queue.acknowledge(&sealed.id) {
                    tracing::warn!(batch_id = %sealed.id, error = %e, "Could not clear delivered batch");
                }
                let mut stats = self.stats.lock().unwrap();
                stats.batches_sent += 1;
                stats.events_sent += rows as u64;
                tracing::info!(batch_id = %sealed.id, rows, "Batch delivered");
                DeliveryOutcome::Delivered {
                    batch_id: sealed.id,
                    rows,
                }
            }
            Err((attempted, error)) => {
                tracing::warn!(batch_id = %sealed.id, rows, error = %error, "Batch delivery failed");
                if let Err(e) = self.queue.enqueue(&sealed, &error, attempted) {
                    tracing::error!(
                        batch_id = %sealed.id,
                        error = %e,
                        "Could not persist failed batch, keeping it in memory"
                    );
                }
                self.stats.lock().unwrap().batches_failed += 1;
                DeliveryOutcome::Queued {
                    batch_id: sealed.id,
                    error,
                }
            }
        };

        self.publish(outcome)
    }
}

struct Worker {
    accumulator: BatchAccumulator,
    settings: Arc<dyn SettingsSource>,
    dedup: Arc<DedupStore>,
    deliveries: JoinSet<()>,
    ctx: DeliveryContext,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.accumulator.deadline();

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Push(event)) => {
                        self.accumulator.push(event, Instant::now());
                        tracing::trace!(pending = self.accumulator.len(), "Event buffered");
                    }
                    Some(Command::Flush(reply)) => self.flush(Some(reply)),
                    Some(Command::Shutdown { grace, done }) => {
                        self.flush(None);
                        self.release_unsent();
                        self.finish_deliveries(grace).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.flush(None);
                        self.release_unsent();
                        self.finish_deliveries(DEFAULT_SHUTDOWN_GRACE).await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.accumulator.is_due(Instant::now()) {
                        self.flush(None);
                    }
                }
                Some(joined) = self.deliveries.join_next(), if !self.deliveries.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Delivery task failed");
                    }
                }
            }
        }
    }

    /// Seal the pending batch and hand it to a delivery task
    fn flush(&mut self, reply: Option<oneshot::Sender<Option<DeliveryOutcome>>>) {
        let Some(rows) = self.accumulator.begin_flush() else {
            if let Some(reply) = reply {
                let _ = reply.send(None);
            }
            return;
        };
        self.dispatch(rows, reply);
        self.accumulator.finish_flush();
    }

    fn dispatch(
        &mut self,
        rows: Vec<CaptureEvent>,
        reply: Option<oneshot::Sender<Option<DeliveryOutcome>>>,
    ) {
        let row_count = rows.len();

        // Unreadable settings keep the rows for another debounce window
        let settings = match self.settings.current() {
            Ok(settings) => settings,
            Err(e) => {
                self.accumulator.restore(rows, Instant::now());
                tracing::warn!(rows = row_count, error = %e, "Settings unavailable, holding batch");
                self.ctx.stats.lock().unwrap().batches_deferred += 1;
                let outcome = self.ctx.publish(DeliveryOutcome::Deferred {
                    rows: row_count,
                    reason: e.to_string(),
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Some(outcome));
                }
                return;
            }
        };

        let sealed = settings
            .secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Signing("no secret configured".to_string()))
            .and_then(|secret| signer::seal(rows, &secret));

        let sealed = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!(rows = row_count, error = %e, "Dropping batch that cannot be signed");
                self.ctx.stats.lock().unwrap().batches_dropped += 1;
                let outcome = self.ctx.publish(DeliveryOutcome::Dropped {
                    rows: row_count,
                    reason: e.to_string(),
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Some(outcome));
                }
                return;
            }
        };
        let endpoint = settings.endpoint;

        if let Err(e) = self.ctx.queue.write_ahead(&sealed) {
            tracing::warn!(batch_id = %sealed.id, error = %e, "Could not write batch ahead");
        }
        tracing::debug!(batch_id = %sealed.id, rows = row_count, "Batch sealed");

        let ctx = self.ctx.clone();
        self.deliveries.spawn(async move {
            let outcome = ctx.deliver(sealed, endpoint).await;
            if let Some(reply) = reply {
                let _ = reply.send(Some(outcome));
            }
        });
    }

    /// Rows still buffered when the worker stops were never sealed. Release
    /// their capture keys so the pages are not suppressed forever.
    fn release_unsent(&mut self) {
        let Some(rows) = self.accumulator.begin_flush() else {
            return;
        };
        match self.dedup.release(&rows) {
            Ok(released) => tracing::warn!(
                rows = rows.len(),
                released,
                "Stopped with unsent captures, they will be accepted again"
            ),
            Err(e) => tracing::error!(rows = rows.len(), error = %e, "Could not release unsent captures"),
        }
    }

    async fn finish_deliveries(&mut self, grace: Duration) {
        if self.deliveries.is_empty() {
            return;
        }
        let pending = self.deliveries.len();
        let drained = tokio::time::timeout(grace, async {
            while self.deliveries.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                pending,
                "Deliveries still running at shutdown, leaving them for the next start"
            );
            self.deliveries.abort_all();
        }
    }
}
