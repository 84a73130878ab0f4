//! Metrics provider access
//!
//! Core code depends only on the [`MetricsProvider`] capability: run one
//! query for one page of rows. [`MetricsClient`] layers paging and the
//! bounded retry policy on top and hands back a lazy row sequence.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ga_report_core::provider::{MetricsClient, MetricsQuery, RetryPolicy};
//!
//! let client = MetricsClient::new(provider, RetryPolicy::default(), 1000, 100_000);
//! let query = MetricsQuery::new(start, end, &["ga:pageviews"]).dimensions(&["ga:pagePath"]);
//! for row in client.fetch(&query) {
//!     let row = row?;
//!     println!("{:?}", row);
//! }
//! ```

mod google;

pub use google::GoogleAnalyticsProvider;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::time::Duration;

/// One row of dimension values followed by metric values.
pub type Row = Vec<String>;

/// A metrics query, independent of paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub metrics: Vec<String>,
    pub dimensions: Vec<String>,
    /// Provider filter expression, e.g. `ga:pagePath=~^/dataset/`
    pub filters: Option<String>,
    /// Sort expression, e.g. `-ga:pageviews`
    pub sort: Option<String>,
}

impl MetricsQuery {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate, metrics: &[&str]) -> Self {
        Self {
            start_date,
            end_date,
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
            dimensions: Vec::new(),
            filters: None,
            sort: None,
        }
    }

    pub fn dimensions(mut self, dimensions: &[&str]) -> Self {
        self.dimensions = dimensions.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn filters(mut self, filters: impl Into<String>) -> Self {
        self.filters = Some(filters.into());
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }
}

/// One page of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPage {
    pub rows: Vec<Row>,
    /// Total rows matching the query across all pages
    pub total_results: usize,
}

/// Capability interface onto an analytics provider session.
pub trait MetricsProvider {
    /// Execute `query`, returning up to `max_results` rows starting at the
    /// 1-based `start_index`.
    ///
    /// Transient failures are reported as `Error::Provider { transient: true, .. }`.
    fn execute_query(
        &self,
        query: &MetricsQuery,
        start_index: usize,
        max_results: usize,
    ) -> Result<QueryPage>;
}

impl<P: MetricsProvider + ?Sized> MetricsProvider for &P {
    fn execute_query(
        &self,
        query: &MetricsQuery,
        start_index: usize,
        max_results: usize,
    ) -> Result<QueryPage> {
        (**self).execute_query(query, start_index, max_results)
    }
}

impl<P: MetricsProvider + ?Sized> MetricsProvider for Box<P> {
    fn execute_query(
        &self,
        query: &MetricsQuery,
        start_index: usize,
        max_results: usize,
    ) -> Result<QueryPage> {
        (**self).execute_query(query, start_index, max_results)
    }
}

/// Exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl((retry.saturating_sub(1)) as u32).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Paging, retrying client over a [`MetricsProvider`].
pub struct MetricsClient<P> {
    provider: P,
    retry: RetryPolicy,
    page_size: usize,
    max_offset: usize,
}

impl<P: MetricsProvider> MetricsClient<P> {
    pub fn new(provider: P, retry: RetryPolicy, page_size: usize, max_offset: usize) -> Self {
        Self {
            provider,
            retry,
            page_size: page_size.max(1),
            max_offset,
        }
    }

    pub fn from_config(provider: P, config: &ProviderConfig) -> Self {
        Self::new(
            provider,
            RetryPolicy::from_config(config),
            config.page_size,
            config.max_offset,
        )
    }

    /// Lazily page through every row matching `query`.
    ///
    /// The sequence is finite and cannot be restarted. After the first
    /// error it yields nothing more.
    pub fn fetch<'a>(&'a self, query: &'a MetricsQuery) -> Rows<'a, P> {
        Rows {
            client: self,
            query,
            buffer: VecDeque::new(),
            next_index: 1,
            done: false,
        }
    }

    /// One page, retried with backoff while failures are transient.
    fn page_with_retry(&self, query: &MetricsQuery, start_index: usize) -> Result<QueryPage> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .provider
                .execute_query(query, start_index, self.page_size)
            {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() => {
                    if attempt > self.retry.max_retries {
                        tracing::error!(attempts = attempt, error = %e, "Provider retry budget exhausted");
                        return Err(Error::ProviderUnavailable {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provider error, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Lazy row sequence returned by [`MetricsClient::fetch`].
pub struct Rows<'a, P> {
    client: &'a MetricsClient<P>,
    query: &'a MetricsQuery,
    buffer: VecDeque<Row>,
    next_index: usize,
    done: bool,
}

impl<P: MetricsProvider> Iterator for Rows<'_, P> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            if self.next_index > self.client.max_offset {
                tracing::warn!(
                    start_index = self.next_index,
                    max_offset = self.client.max_offset,
                    "Stopping at configured maximum offset"
                );
                self.done = true;
                return None;
            }

            let page = match self.client.page_with_retry(self.query, self.next_index) {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let fetched = page.rows.len();
            tracing::debug!(
                start_index = self.next_index,
                rows = fetched,
                total = page.total_results,
                "Fetched page"
            );
            self.next_index += fetched;
            if fetched < self.client.page_size || self.next_index > page.total_results {
                self.done = true;
            }
            self.buffer.extend(page.rows);
        }
    }
}
