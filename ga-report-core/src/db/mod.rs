//! Storage layer for ga-report
//!
//! SQLite with:
//! - Embedded schema migrations
//! - Idempotent (entity, period) upserts
//! - One transaction per stored period

pub mod repo;
pub mod schema;

pub use repo::{StatStore, StatWriter, StoreCounts, DOWNLOADS_STAT};
