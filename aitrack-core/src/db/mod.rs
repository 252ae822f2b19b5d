//! Database layer for aitrack
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - The dedup store (`captures`)
//! - The durable failure queue (`failed_batches`)

pub mod repo;
pub mod schema;

pub use repo::{Database, QueueStats};
