//! Download orchestration
//!
//! The [`Downloader`] walks the periods chosen by the [`PeriodPlanner`],
//! fetches everything the provider has for each one, and stores it.
//!
//! ## Flow per period
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────────────┐
//! │ MetricsClient│ ──► │ PeriodBatch  │ ──► │ StatStore::write_period  │
//! │ (paged, retry)│    │ (in memory)  │     │ replace? upsert, rollups │
//! └──────────────┘     └──────────────┘     └──────────────────────────┘
//! ```
//!
//! Fetching finishes before the write transaction opens, so a period that
//! fails mid-fetch leaves the store untouched. A failed period is logged and
//! skipped; fatal errors ([`Error::is_fatal`]) abort the remaining periods.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let downloader = Downloader::new(client, &store, &catalog, planner)
//!     .with_options(DownloadOptions::from_config(&config.download));
//! let summary = downloader.specific_month("2024-03")?;
//! println!("stored {} periods", summary.periods_stored.len());
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::Catalog;
use crate::config::DownloadConfig;
use crate::db::{StatStore, StatWriter, DOWNLOADS_STAT};
use crate::error::{Error, Result};
use crate::planner::{PeriodPlanner, PeriodRequest};
use crate::provider::{MetricsClient, MetricsProvider, MetricsQuery, Row};
use crate::rollup::recompute_all_in;
use crate::types::{KeyedStat, Period, PeriodName, ReferralStat, StatKind, UrlStat};

/// Keyed statistic holding the site-wide totals.
pub const TOTALS_STAT: &str = "Totals";

/// Site-wide breakdowns: (stat name, provider dimension).
pub const BREAKDOWNS: &[(&str, &str)] = &[
    ("Browsers", "ga:browser"),
    ("Operating Systems", "ga:operatingSystem"),
    ("Languages", "ga:language"),
    ("Country", "ga:country"),
];

/// Totals keys, in the order of the metrics requested for them.
const TOTALS_KEYS: [(&str, &str); 3] = [
    ("Total page views", "ga:pageviews"),
    ("Total visits", "ga:visits"),
    ("New visits", "ga:newVisits"),
];

const DOWNLOAD_EVENTS_FILTER: &str = "ga:eventCategory==Resource;ga:eventAction==Download";

/// Switches for one download run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Clear each period's stored rows before writing the fresh ones
    pub delete_first: bool,
    /// Only fetch site-wide statistics
    pub skip_url_stats: bool,
    /// Send [`ProgressEvent`]s to the configured sink
    pub print_progress: bool,
}

impl DownloadOptions {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            delete_first: config.delete_first,
            skip_url_stats: config.skip_url_stats,
            print_progress: config.print_progress,
        }
    }
}

/// Rows written for one period (or summed over a run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodCounts {
    pub url_stats: usize,
    pub keyed_stats: usize,
    pub referral_stats: usize,
    /// Rows removed by `delete_first`
    pub deleted: usize,
    /// "All" rows recomputed (or removed)
    pub rollups: usize,
    /// Fetched URLs with no catalog entity
    pub unresolved: usize,
}

impl PeriodCounts {
    fn add(&mut self, other: &PeriodCounts) {
        self.url_stats += other.url_stats;
        self.keyed_stats += other.keyed_stats;
        self.referral_stats += other.referral_stats;
        self.deleted += other.deleted;
        self.rollups += other.rollups;
        self.unresolved += other.unresolved;
    }
}

/// Outcome of a download run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Periods written, in order
    pub periods_stored: Vec<String>,
    /// Periods skipped after an error (period name → error message)
    pub periods_failed: Vec<(String, String)>,
    /// Row counts over every stored period
    pub counts: PeriodCounts,
}

/// Progress notifications emitted while downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Fetching started for period `index` (1-based) of `total`
    PeriodStarted {
        period: String,
        index: usize,
        total: usize,
    },
    /// A period was committed
    PeriodStored { period: String, counts: PeriodCounts },
    /// A period was skipped, or aborted the run
    PeriodFailed { period: String, error: String },
}

/// Receives [`ProgressEvent`]s.
pub trait ProgressSink {
    fn on_event(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Everything fetched for one period, waiting to be written.
#[derive(Debug, Default)]
struct PeriodBatch {
    url_stats: Vec<UrlStat>,
    keyed_stats: Vec<KeyedStat>,
    referrals: Vec<ReferralStat>,
    unresolved: usize,
}

/// Drives fetch → store → rollup for planned periods.
pub struct Downloader<'a, P> {
    client: MetricsClient<P>,
    store: &'a StatStore,
    catalog: &'a dyn Catalog,
    planner: PeriodPlanner,
    options: DownloadOptions,
    sink: Box<dyn ProgressSink + 'a>,
}

impl<'a, P: MetricsProvider> Downloader<'a, P> {
    pub fn new(
        client: MetricsClient<P>,
        store: &'a StatStore,
        catalog: &'a dyn Catalog,
        planner: PeriodPlanner,
    ) -> Self {
        Self {
            client,
            store,
            catalog,
            planner,
            options: DownloadOptions::default(),
            sink: Box::new(NoProgress),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, sink: Box<dyn ProgressSink + 'a>) -> Self {
        self.sink = sink;
        self
    }

    /// Every month from the earliest recorded activity through now.
    pub fn all_(&self) -> Result<DownloadSummary> {
        self.run(PeriodRequest::All)
    }

    /// The current, partial month.
    pub fn latest(&self) -> Result<DownloadSummary> {
        self.run(PeriodRequest::Latest)
    }

    /// One `YYYY-MM` month; a malformed or future month is rejected before
    /// anything is fetched.
    pub fn specific_month(&self, month: &str) -> Result<DownloadSummary> {
        match PeriodName::parse_month(month)? {
            PeriodName::Month { year, month } => self.run(PeriodRequest::Month { year, month }),
            _ => Err(Error::InvalidPeriod(month.to_string())),
        }
    }

    /// Plan `request` and load each period in order.
    pub fn run(&self, request: PeriodRequest) -> Result<DownloadSummary> {
        let periods = self.planner.plan(request)?;
        let total = periods.len();
        tracing::info!(
            ?request,
            periods = total,
            delete_first = self.options.delete_first,
            skip_url_stats = self.options.skip_url_stats,
            "Starting download"
        );

        let mut summary = DownloadSummary::default();
        for (i, period) in periods.iter().enumerate() {
            let name = period.name.to_string();
            self.emit(ProgressEvent::PeriodStarted {
                period: name.clone(),
                index: i + 1,
                total,
            });

            match self.load_period(period) {
                Ok(counts) => {
                    tracing::info!(
                        period = %name,
                        complete = period.is_complete(self.planner.today()),
                        url_stats = counts.url_stats,
                        keyed_stats = counts.keyed_stats,
                        referral_stats = counts.referral_stats,
                        rollups = counts.rollups,
                        "Stored period"
                    );
                    summary.counts.add(&counts);
                    summary.periods_stored.push(name.clone());
                    self.emit(ProgressEvent::PeriodStored {
                        period: name,
                        counts,
                    });
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(period = %name, error = %e, "Aborting download");
                    self.emit(ProgressEvent::PeriodFailed {
                        period: name,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(period = %name, error = %e, "Skipping period");
                    self.emit(ProgressEvent::PeriodFailed {
                        period: name.clone(),
                        error: e.to_string(),
                    });
                    summary.periods_failed.push((name, e.to_string()));
                }
            }
        }

        tracing::info!(
            stored = summary.periods_stored.len(),
            failed = summary.periods_failed.len(),
            "Download complete"
        );
        Ok(summary)
    }

    fn emit(&self, event: ProgressEvent) {
        if self.options.print_progress {
            self.sink.on_event(&event);
        }
    }

    fn load_period(&self, period: &Period) -> Result<PeriodCounts> {
        let batch = self.fetch_period(period)?;
        self.store_period(period, batch)
    }

    fn fetch_period(&self, period: &Period) -> Result<PeriodBatch> {
        let mut batch = PeriodBatch::default();
        let period_name = period.name.to_string();

        if !self.options.skip_url_stats {
            self.fetch_url_stats(period, &period_name, &mut batch)?;
        }
        self.fetch_totals(period, &period_name, &mut batch)?;
        for (stat_name, dimension) in BREAKDOWNS {
            self.fetch_breakdown(period, &period_name, stat_name, dimension, &mut batch)?;
        }
        self.fetch_downloads(period, &period_name, &mut batch)?;
        self.fetch_referrals(period, &period_name, &mut batch)?;

        tracing::debug!(
            period = %period_name,
            url_stats = batch.url_stats.len(),
            keyed_stats = batch.keyed_stats.len(),
            referrals = batch.referrals.len(),
            "Fetched period"
        );
        Ok(batch)
    }

    fn fetch_url_stats(&self, period: &Period, period_name: &str, batch: &mut PeriodBatch) -> Result<()> {
        let query = MetricsQuery::new(period.start, period.end, &["ga:pageviews", "ga:visits"])
            .dimensions(&["ga:pagePath"])
            .filters(self.catalog.url_pattern().provider_filter())
            .sort("-ga:pageviews");

        for row in self.client.fetch(&query) {
            let row = row?;
            let url = column(&row, 0, "ga:pagePath")?.to_string();
            let package_id = self.store.find_url_by_package(&url, self.catalog)?;
            if package_id.is_none() {
                tracing::debug!(url = %url, "No catalog entity for url");
                batch.unresolved += 1;
            }
            batch.url_stats.push(UrlStat {
                pageviews: count(&row, 1, "ga:pageviews")?,
                visits: count(&row, 2, "ga:visits")?,
                url,
                period_name: period_name.to_string(),
                package_id,
            });
        }
        Ok(())
    }

    fn fetch_totals(&self, period: &Period, period_name: &str, batch: &mut PeriodBatch) -> Result<()> {
        let metrics: Vec<&str> = TOTALS_KEYS.iter().map(|(_, metric)| *metric).collect();
        let query = MetricsQuery::new(period.start, period.end, &metrics);

        // One row when the period has data, none otherwise
        if let Some(row) = self.client.fetch(&query).next().transpose()? {
            for (i, (key, metric)) in TOTALS_KEYS.iter().enumerate() {
                batch.keyed_stats.push(KeyedStat {
                    stat_name: TOTALS_STAT.to_string(),
                    key: key.to_string(),
                    period_name: period_name.to_string(),
                    value: count(&row, i, metric)?,
                });
            }
        }
        Ok(())
    }

    fn fetch_breakdown(
        &self,
        period: &Period,
        period_name: &str,
        stat_name: &str,
        dimension: &str,
        batch: &mut PeriodBatch,
    ) -> Result<()> {
        let query = MetricsQuery::new(period.start, period.end, &["ga:pageviews"])
            .dimensions(&[dimension])
            .sort("-ga:pageviews");

        for row in self.client.fetch(&query) {
            let row = row?;
            batch.keyed_stats.push(KeyedStat {
                stat_name: stat_name.to_string(),
                key: column(&row, 0, dimension)?.to_string(),
                period_name: period_name.to_string(),
                value: count(&row, 1, "ga:pageviews")?,
            });
        }
        Ok(())
    }

    fn fetch_downloads(&self, period: &Period, period_name: &str, batch: &mut PeriodBatch) -> Result<()> {
        let query = MetricsQuery::new(period.start, period.end, &["ga:totalEvents"])
            .dimensions(&["ga:pagePath"])
            .filters(DOWNLOAD_EVENTS_FILTER)
            .sort("-ga:totalEvents");

        let mut per_dataset: BTreeMap<String, i64> = BTreeMap::new();
        for row in self.client.fetch(&query) {
            let row = row?;
            let url = column(&row, 0, "ga:pagePath")?;
            let events = count(&row, 1, "ga:totalEvents")?;
            match self.store.find_url_by_package(url, self.catalog)? {
                Some(name) => *per_dataset.entry(name).or_default() += events,
                None => {
                    tracing::debug!(url, events, "Download event outside any dataset");
                }
            }
        }

        batch
            .keyed_stats
            .extend(per_dataset.into_iter().map(|(name, value)| KeyedStat {
                stat_name: DOWNLOADS_STAT.to_string(),
                key: name,
                period_name: period_name.to_string(),
                value,
            }));
        Ok(())
    }

    fn fetch_referrals(&self, period: &Period, period_name: &str, batch: &mut PeriodBatch) -> Result<()> {
        let filters = format!(
            "ga:medium==referral;{}",
            self.catalog.url_pattern().provider_filter()
        );
        let query = MetricsQuery::new(period.start, period.end, &["ga:visits"])
            .dimensions(&["ga:pagePath"])
            .filters(filters)
            .sort("-ga:visits");

        for row in self.client.fetch(&query) {
            let row = row?;
            batch.referrals.push(ReferralStat {
                url: column(&row, 0, "ga:pagePath")?.to_string(),
                period_name: period_name.to_string(),
                count: count(&row, 1, "ga:visits")?,
            });
        }
        Ok(())
    }

    /// Write a fetched batch and refresh the touched rollups, all in one
    /// transaction.
    fn store_period(&self, period: &Period, batch: PeriodBatch) -> Result<PeriodCounts> {
        let options = self.options;
        let counts = self.store.write_period(|w| {
            let mut counts = PeriodCounts {
                unresolved: batch.unresolved,
                ..Default::default()
            };
            let period_name = period.name.to_string();
            let mut touched: BTreeSet<String> =
                batch.url_stats.iter().map(|s| s.url.clone()).collect();

            if options.delete_first {
                if !options.skip_url_stats {
                    // Rows about to disappear still feed their URL's rollup
                    touched.extend(w.urls_in_period(&period_name)?);
                    counts.deleted += w.replace_period(&period.name, StatKind::Url)?;
                }
                counts.deleted += w.replace_period(&period.name, StatKind::Keyed)?;
                counts.deleted += w.replace_period(&period.name, StatKind::Referral)?;
            }

            write_batch(w, &batch, &mut counts)?;

            for url in &touched {
                recompute_all_in(w, url)?;
                counts.rollups += 1;
            }
            Ok(counts)
        })?;

        if counts.deleted > 0 {
            tracing::debug!(period = %period.name, deleted = counts.deleted, "Cleared period before writing");
        }
        Ok(counts)
    }
}

fn write_batch(w: &StatWriter<'_>, batch: &PeriodBatch, counts: &mut PeriodCounts) -> Result<()> {
    for stat in &batch.url_stats {
        w.upsert_url_stat(stat)?;
        counts.url_stats += 1;
    }
    for stat in &batch.keyed_stats {
        w.upsert_keyed_stat(&stat.key, &stat.stat_name, &stat.period_name, stat.value)?;
        counts.keyed_stats += 1;
    }
    for stat in &batch.referrals {
        w.upsert_referral_stat(&stat.url, &stat.period_name, stat.count)?;
        counts.referral_stats += 1;
    }
    Ok(())
}

fn malformed(message: String) -> Error {
    Error::Provider {
        status: 200,
        message,
        transient: false,
    }
}

fn column<'r>(row: &'r Row, index: usize, name: &str) -> Result<&'r str> {
    row.get(index)
        .map(String::as_str)
        .ok_or_else(|| malformed(format!("row is missing {} (column {})", name, index)))
}

/// Parse a metric value; the provider sends integers as strings.
fn count(row: &Row, index: usize, name: &str) -> Result<i64> {
    let value = column(row, index, name)?;
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| malformed(format!("{} is not a count: {:?}", name, value)))
}
