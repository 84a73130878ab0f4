//! # ga-report-core
//!
//! Core library for ga-report - web analytics ingestion and reporting for a
//! data catalog.
//!
//! This library provides:
//! - A paging, retrying client over an analytics provider
//! - Period planning for monthly loads
//! - SQLite storage of per-URL, keyed and referral statistics
//! - "All"-period rollups and their repair
//! - Dataset and referrer reports with CSV output
//! - Configuration and logging infrastructure
//!
//! ## Data flow
//!
//! ```text
//! PeriodPlanner ──► Downloader ──► MetricsClient ──► MetricsProvider
//!                       │
//!                       ▼
//!                   StatStore ◄── Aggregator
//!                       │
//!                       ▼
//!                 ReportBuilder ──► report::csv
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use ga_report_core::{Config, StatStore};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let store = StatStore::open(&Config::database_path()).expect("failed to open database");
//! store.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use catalog::{Catalog, DatasetUrlPattern, SqliteCatalog, StaticCatalog};
pub use config::Config;
pub use db::{StatStore, StatWriter};
pub use download::{DownloadOptions, DownloadSummary, Downloader, ProgressEvent, ProgressSink};
pub use error::{Error, Result};
pub use planner::{PeriodPlanner, PeriodRequest};
pub use provider::{GoogleAnalyticsProvider, MetricsClient, MetricsProvider, MetricsQuery};
pub use report::ReportBuilder;
pub use rollup::Aggregator;
pub use types::*;

// Public modules
pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod logging;
pub mod planner;
pub mod provider;
pub mod report;
pub mod rollup;
pub mod types;
