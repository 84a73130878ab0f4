//! End-to-end tests for the download → rollup → report pipeline
//!
//! A fake provider serves canned monthly analytics so the whole flow runs
//! against a real on-disk SQLite store.

use chrono::{Datelike, NaiveDate};
use ga_report_core::download::{DownloadOptions, Downloader, TOTALS_STAT};
use ga_report_core::provider::{MetricsClient, MetricsProvider, MetricsQuery, QueryPage, RetryPolicy, Row};
use ga_report_core::report::csv::write_dataset_report;
use ga_report_core::{
    Aggregator, Catalog, DatasetUrlPattern, Error, PeriodPlanner, ReportBuilder, Result,
    SqliteCatalog, StatStore, ALL_PERIOD,
};
use std::cell::Cell;
use std::time::Duration;
use tempfile::TempDir;

/// Serves each month's page views scaled by the month number, so every
/// month stores different counts.
struct MonthlyAnalytics {
    calls: Cell<usize>,
}

impl MonthlyAnalytics {
    fn new() -> Self {
        Self {
            calls: Cell::new(0),
        }
    }
}

fn row(values: &[String]) -> Row {
    values.to_vec()
}

impl MetricsProvider for MonthlyAnalytics {
    fn execute_query(
        &self,
        query: &MetricsQuery,
        start_index: usize,
        max_results: usize,
    ) -> Result<QueryPage> {
        self.calls.set(self.calls.get() + 1);
        let m = query.start_date.month() as i64;
        let s = |v: i64| v.to_string();
        let filters = query.filters.as_deref().unwrap_or("");

        let rows: Vec<Row> = if query.metrics == ["ga:totalEvents"] {
            vec![row(&["/dataset/spend/resource/1".into(), s(m)])]
        } else if filters.starts_with("ga:medium==referral") {
            vec![
                row(&["/dataset/spend".into(), s(2 * m)]),
                row(&["/dataset/crime".into(), s(3)]),
            ]
        } else if query.dimensions.is_empty() {
            vec![row(&[s(100 * m), s(50 * m), s(10 * m)])]
        } else if query.dimensions == ["ga:pagePath"] {
            vec![
                row(&["/dataset/spend".into(), s(10 * m), s(5 * m)]),
                row(&["/dataset/crime".into(), s(4), s(2)]),
                row(&["/dataset/retired".into(), s(1), s(1)]),
            ]
        } else {
            vec![row(&["(not set)".into(), s(m)])]
        };

        Ok(QueryPage {
            total_results: rows.len(),
            rows: rows
                .into_iter()
                .skip(start_index - 1)
                .take(max_results)
                .collect(),
        })
    }
}

fn open_store(dir: &TempDir) -> StatStore {
    let store = StatStore::open(&dir.path().join("ga-report.db")).unwrap();
    store.migrate().unwrap();
    store
}

fn seed_catalog(store: &StatStore) -> SqliteCatalog<'_> {
    let catalog = SqliteCatalog::new(store, DatasetUrlPattern::default());
    catalog
        .import_csv("name,title\nspend,Spend over 25k\ncrime,Recorded crime\n".as_bytes())
        .unwrap();
    catalog
}

fn client(provider: &MonthlyAnalytics) -> MetricsClient<&MonthlyAnalytics> {
    let retry = RetryPolicy {
        max_retries: 0,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };
    MetricsClient::new(provider, retry, 2, 100)
}

fn planner() -> PeriodPlanner {
    PeriodPlanner::new("2024-01", NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()).unwrap()
}

#[test]
fn test_full_history_load_and_reports() {
    ga_report_core::logging::init_test();
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let catalog = seed_catalog(&store);
    let provider = MonthlyAnalytics::new();

    let summary = Downloader::new(client(&provider), &store, &catalog, planner())
        .all_()
        .unwrap();
    assert_eq!(summary.periods_stored, vec!["2024-01", "2024-02", "2024-03"]);
    assert!(summary.periods_failed.is_empty());
    assert_eq!(summary.counts.unresolved, 3);

    // Months 1..=3 scaled: 10+20+30 views, 5+10+15 visits
    let spend = store.url_stat("/dataset/spend", ALL_PERIOD).unwrap().unwrap();
    assert_eq!((spend.pageviews, spend.visits), (60, 30));
    assert_eq!(spend.package_id.as_deref(), Some("spend"));
    assert_eq!(store.downloads_total("spend").unwrap(), 6);
    assert_eq!(
        store.keyed_stat("Total page views", TOTALS_STAT, "2024-03").unwrap(),
        Some(300)
    );

    let report = ReportBuilder::new(&store, &catalog);
    let mut csv = Vec::new();
    write_dataset_report(&mut csv, report.dataset_summary().unwrap()).unwrap();
    assert_eq!(
        String::from_utf8(csv).unwrap(),
        "Title,Name,Views,Visits,Downloads,PeriodName\n\
         Spend over 25k,spend,60,30,6,All\n\
         Recorded crime,crime,12,6,0,All\n"
    );

    let referrers: Vec<_> = report
        .top_referred_all_periods(1)
        .unwrap()
        .map(|r| r.unwrap())
        .map(|r| (r.period_name, r.name, r.referred_visits))
        .collect();
    assert_eq!(
        referrers,
        vec![
            ("All".to_string(), "spend".to_string(), 12),
            ("2024-01".to_string(), "crime".to_string(), 3),
            ("2024-02".to_string(), "spend".to_string(), 4),
            ("2024-03".to_string(), "spend".to_string(), 6),
        ]
    );
}

#[test]
fn test_reloading_history_converges() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let catalog = seed_catalog(&store);
    let provider = MonthlyAnalytics::new();
    let downloader = Downloader::new(client(&provider), &store, &catalog, planner());

    downloader.all_().unwrap();
    let first = (
        store.counts().unwrap(),
        store.url_stats_for("/dataset/spend").unwrap(),
    );

    let rerun = Downloader::new(client(&provider), &store, &catalog, planner()).with_options(
        DownloadOptions {
            delete_first: true,
            ..Default::default()
        },
    );
    rerun.all_().unwrap();
    let second = (
        store.counts().unwrap(),
        store.url_stats_for("/dataset/spend").unwrap(),
    );

    assert_eq!(first, second);
    assert_eq!(Aggregator::new(&store).repair_all_missing(None).unwrap().candidates, 0);
}

#[test]
fn test_site_wide_only_load_then_repair() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let catalog = seed_catalog(&store);
    let provider = MonthlyAnalytics::new();

    Downloader::new(client(&provider), &store, &catalog, planner())
        .with_options(DownloadOptions {
            skip_url_stats: true,
            ..Default::default()
        })
        .latest()
        .unwrap();

    let counts = store.counts().unwrap();
    assert_eq!(counts.url_stats, 0);
    assert!(counts.keyed_stats > 0);
    assert_eq!(counts.referral_stats, 2);

    let repair = Aggregator::new(&store).repair_all_missing(None).unwrap();
    assert_eq!(repair.candidates, 0);
    assert_eq!(
        ReportBuilder::new(&store, &catalog)
            .dataset_summary()
            .unwrap()
            .count(),
        0
    );
}

#[test]
fn test_future_month_is_rejected_without_fetching() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let catalog = seed_catalog(&store);
    let provider = MonthlyAnalytics::new();
    let downloader = Downloader::new(client(&provider), &store, &catalog, planner());

    assert!(matches!(
        downloader.specific_month("2024-04"),
        Err(Error::InvalidPeriod(_))
    ));
    assert_eq!(provider.calls.get(), 0);
    assert!(catalog.find_by_url("/dataset/spend").unwrap().is_some());
}
