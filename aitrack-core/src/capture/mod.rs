//! Capture and delivery
//!
//! Turns classified page visits into signed webhook batches.
//!
//! ## Architecture
//!
//! Delivery is "local-first":
//! - Every capture key is recorded in SQLite before anything is sent
//! - Each sealed batch is written ahead to the failure queue, then removed
//!   once the endpoint acknowledges it
//! - Network failures never surface to the host; batches stay queued until
//!   the next startup or offline → online transition
//!
//! ## Usage
//!
//! Configure the endpoint in `~/.config/aitrack/config.toml`:
//!
//! ```toml
//! [delivery]
//! endpoint = "https://script.google.com/macros/s/XXXX/exec"
//! secret = "shared-hmac-secret"
//! ```

mod accumulator;
pub mod client;
mod dedup;
mod pipeline;
mod queue;
pub mod recovery;
pub mod signer;

pub use accumulator::{AccumulatorState, BatchAccumulator};
pub use client::{Ack, DeliveryClient, HttpTransport, RetryPolicy, Transport};
pub use dedup::{Admission, DedupStore};
pub use pipeline::{
    CapturePipeline, DeliveryOutcome, Diagnostics, PipelineOptions, PublishStats, Submission,
};
pub use queue::{DrainReport, FailureQueue};
pub use recovery::Connectivity;
