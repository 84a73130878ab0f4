//! Report assembly
//!
//! Joins stored statistics to catalog entities. Rows whose URL no longer
//! resolves to an entity are skipped with a warning.
//!
//! Store queries run when a report is requested; the per-row catalog and
//! download lookups run as the returned iterator is consumed.

pub mod csv;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::catalog::Catalog;
use crate::db::StatStore;
use crate::error::{Error, Result};
use crate::types::{CatalogEntity, ALL_PERIOD};

/// One line of the dataset report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetReportRow {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Views")]
    pub views: i64,
    #[serde(rename = "Visits")]
    pub visits: i64,
    #[serde(rename = "Downloads")]
    pub downloads: i64,
    #[serde(rename = "PeriodName")]
    pub period_name: String,
}

/// One line of the referrer report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferrerReportRow {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ReferredVisits")]
    pub referred_visits: i64,
    #[serde(rename = "PeriodName")]
    pub period_name: String,
}

pub struct ReportBuilder<'a> {
    store: &'a StatStore,
    catalog: &'a dyn Catalog,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(store: &'a StatStore, catalog: &'a dyn Catalog) -> Self {
        Self { store, catalog }
    }

    /// All-time views, visits and downloads per dataset, most viewed first.
    ///
    /// Rollups of every URL belonging to a dataset (its landing page and its
    /// resource pages) are summed into the dataset's row.
    pub fn dataset_summary(
        &self,
    ) -> Result<impl Iterator<Item = Result<DatasetReportRow>> + 'a> {
        let rollups = self
            .store
            .rollups_with_prefix(self.catalog.url_pattern().prefix())?;

        let mut per_entity: BTreeMap<String, (CatalogEntity, i64, i64)> = BTreeMap::new();
        for stat in &rollups {
            let entity = match self.entity_for(&stat.url, stat.package_id.as_deref()) {
                Ok(entity) => entity,
                Err(e @ Error::EntityNotFound(_)) => {
                    tracing::warn!(error = %e, views = stat.pageviews, "Skipping dataset row");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let entry = per_entity
                .entry(entity.name.clone())
                .or_insert((entity, 0, 0));
            entry.1 += stat.pageviews;
            entry.2 += stat.visits;
        }

        let mut ranked: Vec<_> = per_entity.into_values().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name.cmp(&b.0.name)));
        tracing::debug!(datasets = ranked.len(), urls = rollups.len(), "Built dataset summary");

        let store = self.store;
        Ok(ranked.into_iter().map(move |(entity, views, visits)| {
            Ok(DatasetReportRow {
                downloads: store.downloads_total(&entity.name)?,
                title: entity.title,
                name: entity.name,
                views,
                visits,
                period_name: ALL_PERIOD.to_string(),
            })
        }))
    }

    /// The `n` dataset URLs with the most referred visits in `period`.
    ///
    /// A `period` of "All" sums over every stored period.
    pub fn top_referred(
        &self,
        n: usize,
        period: &str,
    ) -> Result<impl Iterator<Item = Result<ReferrerReportRow>> + 'a> {
        let filter = (period != ALL_PERIOD).then_some(period);
        let totals = self
            .store
            .referral_totals(self.catalog.url_pattern().prefix(), filter)?;

        let (store, catalog) = (self.store, self.catalog);
        let period = period.to_string();
        Ok(totals
            .into_iter()
            .filter_map(move |(url, count)| {
                let resolved = store
                    .find_url_by_package(&url, catalog)
                    .and_then(|name| resolve(catalog, &url, name.as_deref()));
                match resolved {
                    Ok(entity) => Some(Ok(ReferrerReportRow {
                        title: entity.title,
                        name: entity.name,
                        referred_visits: count,
                        period_name: period.clone(),
                    })),
                    Err(e @ Error::EntityNotFound(_)) => {
                        tracing::warn!(error = %e, count, "Skipping referrer row");
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            })
            .take(n))
    }

    /// [`top_referred`](Self::top_referred) for "All" followed by every
    /// stored period, oldest first.
    pub fn top_referred_all_periods(
        &self,
        n: usize,
    ) -> Result<impl Iterator<Item = Result<ReferrerReportRow>> + 'a> {
        let mut periods = vec![ALL_PERIOD.to_string()];
        periods.extend(
            self.store
                .referral_periods()?
                .into_iter()
                .filter(|p| p != ALL_PERIOD),
        );

        let mut blocks = Vec::with_capacity(periods.len());
        for period in &periods {
            blocks.push(self.top_referred(n, period)?);
        }
        Ok(blocks.into_iter().flatten())
    }

    fn entity_for(&self, url: &str, package_id: Option<&str>) -> Result<CatalogEntity> {
        resolve(self.catalog, url, package_id)
    }
}

/// Entity for `url`, trying a known package name before the URL itself.
fn resolve(catalog: &dyn Catalog, url: &str, package_id: Option<&str>) -> Result<CatalogEntity> {
    if let Some(name) = package_id {
        if let Some(entity) = catalog.find_by_name(name)? {
            return Ok(entity);
        }
    }
    catalog
        .find_by_url(url)?
        .ok_or_else(|| Error::EntityNotFound(url.to_string()))
}
