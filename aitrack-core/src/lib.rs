//! # aitrack-core
//!
//! Core library for aitrack - captures AI chat pages and delivers them to a
//! signed webhook.
//!
//! This library provides:
//! - Page classification for ChatGPT, Claude, and Grok
//! - A durable dedup store and failure queue in SQLite
//! - Debounced batching, HMAC signing, and retrying delivery
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through one pipeline:
//! - **Classify:** URL + title → [`CaptureEvent`] (or nothing)
//! - **Dedup:** first sighting of `platform|type|id` wins; repeats are dropped
//! - **Batch:** events are coalesced until the debounce window is quiet
//! - **Deliver:** the signed batch is posted, retried with backoff, and
//!   queued on failure until the next startup or reconnect
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aitrack_core::capture::{CapturePipeline, Connectivity, HttpTransport, PipelineOptions};
//! use aitrack_core::config::ConfigFileSettings;
//! use aitrack_core::{classify, Config, Database};
//!
//! # async fn run() -> aitrack_core::Result<()> {
//! let config = Config::load()?;
//! let db = Database::open(&Config::database_path())?;
//! db.migrate()?;
//!
//! let pipeline = CapturePipeline::start(
//!     Arc::new(db),
//!     Arc::new(ConfigFileSettings::default_path()),
//!     Arc::new(HttpTransport::from_config(&config.delivery)?),
//!     Connectivity::new(true),
//!     PipelineOptions::from_config(&config.delivery),
//! )
//! .await?;
//!
//! pipeline.submit(classify::classify("https://claude.ai/chat/abc", "Notes"))?;
//! pipeline.flush().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use capture::{CapturePipeline, DeliveryOutcome, PipelineOptions, Submission};
pub use config::Config;
pub use db::{Database, QueueStats};
pub use error::{DeliveryError, Error, Result};
pub use types::*;

// Public modules
pub mod capture;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod types;
