//! Webhook delivery client
//!
//! One delivery cycle walks this state machine:
//!
//! ```text
//! Pending → Attempting ─┬─▶ Delivered
//!              ▲        ├─▶ BackingOff ─┐
//!              └────────┼───────────────┘
//!                       └─▶ Exhausted
//! ```
//!
//! Every attempt re-sends the sealed body verbatim; nothing is re-signed.
//! The client never persists anything itself: an `Exhausted` (or offline)
//! result is handed back so the caller can enqueue the exact batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use super::recovery::Connectivity;
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, Error, Result};
use crate::types::SealedBatch;

/// Longest error body kept in logs and the failure queue
const MAX_ERROR_BODY: usize = 200;

/// Successful response from the endpoint (any 2xx)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
    /// Informational only
    pub body: String,
}

/// Performs a single POST of an already-encoded body
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, endpoint: &str, body: &str) -> Result<Ack>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    pub fn from_config(config: &DeliveryConfig) -> Result<Self> {
        Self::new(config.timeout())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, endpoint: &str, body: &str) -> Result<Ack> {
        let response = self
            .http_client
            .post(endpoint)
            .body(body.to_owned())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    Error::Config(format!("invalid endpoint {:?}: {}", endpoint, e))
                } else {
                    Error::Transport(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            Ok(Ack {
                status: status.as_u16(),
                body: text,
            })
        } else {
            Err(Error::Server {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            })
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.backoff_base(),
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-based): `base × 2^retry`, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Delivery cycle phases, recorded in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    Pending,
    Attempting,
    BackingOff,
    Delivered,
    Exhausted,
}

/// Sends sealed batches with retry and backoff
pub struct DeliveryClient {
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    policy: RetryPolicy,
}

impl DeliveryClient {
    pub fn new(transport: Arc<dyn Transport>, connectivity: Connectivity, policy: RetryPolicy) -> Self {
        Self {
            transport,
            connectivity,
            policy,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Full delivery cycle with the configured retry budget
    pub async fn deliver(
        &self,
        endpoint: &str,
        sealed: &SealedBatch,
    ) -> std::result::Result<Ack, DeliveryError> {
        self.deliver_with_retries(endpoint, sealed, self.policy.max_retries)
            .await
    }

    /// A single attempt, used by recovery drains
    pub async fn deliver_once(
        &self,
        endpoint: &str,
        sealed: &SealedBatch,
    ) -> std::result::Result<Ack, DeliveryError> {
        self.deliver_with_retries(endpoint, sealed, 0).await
    }

    async fn deliver_with_retries(
        &self,
        endpoint: &str,
        sealed: &SealedBatch,
        max_retries: u32,
    ) -> std::result::Result<Ack, DeliveryError> {
        let max_attempts = max_retries.saturating_add(1);
        let mut attempts = 0;
        let mut last_error = None;

        tracing::debug!(
            batch_id = %sealed.id,
            rows = sealed.row_count(),
            phase = ?DeliveryPhase::Pending,
            "Starting delivery"
        );

        while attempts < max_attempts {
            if attempts > 0 {
                let delay = self.policy.delay_for(attempts - 1);
                tracing::debug!(
                    batch_id = %sealed.id,
                    phase = ?DeliveryPhase::BackingOff,
                    "Retrying delivery (attempt {}/{}), waiting {:?}",
                    attempts + 1,
                    max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            if !self.connectivity.is_online() {
                tracing::debug!(batch_id = %sealed.id, "Offline, not attempting delivery");
                return Err(DeliveryError::Offline { attempts });
            }

            attempts += 1;
            tracing::trace!(batch_id = %sealed.id, attempt = attempts, phase = ?DeliveryPhase::Attempting);
            match self.transport.post(endpoint, &sealed.body).await {
                Ok(ack) => {
                    tracing::debug!(
                        batch_id = %sealed.id,
                        status = ack.status,
                        attempts,
                        phase = ?DeliveryPhase::Delivered,
                        "Batch delivered"
                    );
                    return Ok(ack);
                }
                Err(e) => {
                    tracing::warn!(
                        batch_id = %sealed.id,
                        attempt = attempts,
                        error = %e,
                        "Delivery attempt failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        tracing::warn!(
            batch_id = %sealed.id,
            attempts,
            phase = ?DeliveryPhase::Exhausted,
            "Delivery retries exhausted"
        );
        Err(DeliveryError::Exhausted {
            attempts,
            last_error: last_error
                .unwrap_or_else(|| Error::Transport("max retries exceeded".to_string())),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for pipeline tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays scripted status codes; once the script runs out it repeats `fallback`.
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<u16>>,
        fallback: u16,
        calls: Mutex<Vec<(Instant, String, String)>>,
    }

    impl ScriptedTransport {
        pub fn new(script: &[u16], fallback: u16) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn always(status: u16) -> Arc<Self> {
            Self::new(&[], status)
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|c| c.0).collect()
        }

        pub fn bodies(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.2.clone()).collect()
        }

        pub fn endpoints(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.1.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(&self, endpoint: &str, body: &str) -> Result<Ack> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), endpoint.to_string(), body.to_string()));
            let status = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            match status {
                0 => Err(Error::Transport("connection refused".to_string())),
                200..=299 => Ok(Ack {
                    status,
                    body: String::new(),
                }),
                _ => Err(Error::Server {
                    status,
                    body: "scripted failure".to_string(),
                }),
            }
        }
    }

    /// Records each request and then never answers
    #[derive(Default)]
    pub struct StalledTransport {
        bodies: Mutex<Vec<String>>,
    }

    impl StalledTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn bodies(&self) -> Vec<String> {
            self.bodies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for StalledTransport {
        async fn post(&self, _endpoint: &str, body: &str) -> Result<Ack> {
            self.bodies.lock().unwrap().push(body.to_string());
            std::future::pending().await
        }
    }
}
