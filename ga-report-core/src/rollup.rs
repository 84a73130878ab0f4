//! "All"-period rollups
//!
//! The "All" row for a URL is never fetched; it is the sum of every other
//! stored row for that URL. It is refreshed incrementally after each period
//! is stored, and in bulk by [`Aggregator::repair_all_missing`].

use crate::db::{StatStore, StatWriter};
use crate::error::Result;
use crate::types::{UrlStat, ALL_PERIOD};

/// Outcome of a repair pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairSummary {
    /// URLs that needed a fresh rollup
    pub candidates: usize,
    /// Rollups written
    pub recomputed: usize,
    /// Rollups removed because no constituent rows remain
    pub removed: usize,
}

/// Recompute the "All" row for `url` within an open write.
///
/// Returns the row written, or `None` when `url` has no constituent rows
/// (any stale "All" row is removed in that case).
pub fn recompute_all_in(writer: &StatWriter<'_>, url: &str) -> Result<Option<UrlStat>> {
    let rows = writer.period_rows(url)?;
    if rows.is_empty() {
        writer.delete_url_row(url, ALL_PERIOD)?;
        return Ok(None);
    }

    let mut rollup = UrlStat {
        url: url.to_string(),
        period_name: ALL_PERIOD.to_string(),
        pageviews: 0,
        visits: 0,
        package_id: None,
    };
    for row in &rows {
        rollup.pageviews += row.pageviews;
        rollup.visits += row.visits;
        // Latest period that knows the package wins
        if row.package_id.is_some() {
            rollup.package_id = row.package_id.clone();
        }
    }

    writer.write_url_row(&rollup, true)?;
    tracing::trace!(
        url,
        periods = rows.len(),
        pageviews = rollup.pageviews,
        visits = rollup.visits,
        "Recomputed rollup"
    );
    Ok(Some(rollup))
}

/// Maintains derived "All" rows.
pub struct Aggregator<'a> {
    store: &'a StatStore,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a StatStore) -> Self {
        Self { store }
    }

    /// Sum every non-"All" row for `url` into its "All" row.
    pub fn recompute_all(&self, url: &str) -> Result<Option<UrlStat>> {
        self.store.write_period(|w| recompute_all_in(w, url))
    }

    /// Recompute rollups for every URL whose "All" row is missing or older
    /// than its newest constituent row.
    ///
    /// Each URL is recomputed in its own transaction, so an interrupted pass
    /// can simply be run again. `progress` is called after each URL with
    /// `(done, total, url)`.
    pub fn repair_all_missing(
        &self,
        mut progress: Option<&mut dyn FnMut(usize, usize, &str)>,
    ) -> Result<RepairSummary> {
        let urls = self.store.stale_rollup_urls()?;
        let total = urls.len();
        tracing::info!(urls = total, "Repairing rollups");

        let mut summary = RepairSummary {
            candidates: total,
            ..Default::default()
        };

        for (i, url) in urls.iter().enumerate() {
            match self.recompute_all(url)? {
                Some(_) => summary.recomputed += 1,
                None => summary.removed += 1,
            }
            if let Some(callback) = progress.as_mut() {
                callback(i + 1, total, url);
            }
        }

        tracing::info!(
            recomputed = summary.recomputed,
            removed = summary.removed,
            "Rollup repair complete"
        );
        Ok(summary)
    }
}
