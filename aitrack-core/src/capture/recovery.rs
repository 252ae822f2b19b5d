//! Connectivity signal and recovery triggers
//!
//! The failure queue is re-drained on exactly two events: the host reporting
//! an offline → online transition, and process startup. There is no polling.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::queue::{DrainReport, FailureQueue};
use crate::error::Result;

/// Why a drain was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    Startup,
    Online,
}

impl std::fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecoveryReason::Startup => "startup",
            RecoveryReason::Online => "online",
        })
    }
}

struct ConnectivityState {
    online: bool,
    edges: Vec<mpsc::UnboundedSender<()>>,
}

/// Host-provided online/offline indicator, cheap to clone
///
/// Every offline → online transition is delivered as one message to each
/// edge subscriber, so a quick offline/online toggle is never lost even if
/// the subscriber has not run in between.
#[derive(Clone)]
pub struct Connectivity {
    state: Arc<Mutex<ConnectivityState>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectivityState {
                online,
                edges: Vec::new(),
            })),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().unwrap().online
    }

    /// Update the indicator. Returns true on an offline → online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.online == online {
            return false;
        }
        state.online = online;
        if !online {
            tracing::info!("Connectivity lost");
            return false;
        }
        tracing::info!("Connectivity restored");
        state.edges.retain(|tx| tx.send(()).is_ok());
        true
    }

    /// Receive one message per offline → online transition from now on
    pub fn online_edges(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().edges.push(tx);
        rx
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Move batches left `in_flight` by a previous process back to `failed`.
///
/// Must run before this process writes any batch ahead.
pub fn reclaim_abandoned(queue: &FailureQueue) -> Result<usize> {
    let reclaimed = queue.reclaim_in_flight()?;
    if reclaimed > 0 {
        tracing::info!(reclaimed, "Reclaimed batches abandoned by a previous run");
    }
    Ok(reclaimed)
}

/// Run one drain pass and log its result. Never fails the caller.
pub async fn trigger(queue: &FailureQueue, reason: RecoveryReason) -> Option<DrainReport> {
    match run(queue, reason).await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(reason = %reason, error = %e, "Recovery drain failed");
            None
        }
    }
}

async fn run(queue: &FailureQueue, reason: RecoveryReason) -> Result<DrainReport> {
    let report = queue.drain_and_retry().await?;
    if report.attempted > 0 {
        tracing::info!(
            reason = %reason,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "Recovery drain finished"
        );
    }
    Ok(report)
}

/// Drain the failure queue once for every offline → online edge.
///
/// Edges that arrive while a drain is running are coalesced into a single
/// follow-up drain. The task runs until it is aborted.
pub fn spawn_online_watcher(queue: Arc<FailureQueue>, connectivity: &Connectivity) -> JoinHandle<()> {
    let mut edges = connectivity.online_edges();
    tokio::spawn(async move {
        while edges.recv().await.is_some() {
            while edges.try_recv().is_ok() {}
            trigger(&queue, RecoveryReason::Online).await;
        }
    })
}
