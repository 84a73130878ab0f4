//! ga-report - load web analytics for catalog datasets and build reports
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/ga-report/ga-report.db (~/.local/share/ga-report/ga-report.db)
//! - Logs: $XDG_STATE_HOME/ga-report/ga-report.log (~/.local/state/ga-report/ga-report.log)
//! - Config: $XDG_CONFIG_HOME/ga-report/config.toml (~/.config/ga-report/config.toml)

mod process_lock;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ga_report_core::auth;
use ga_report_core::db::schema::get_schema_version;
use ga_report_core::download::NoProgress;
use ga_report_core::report::csv::{write_dataset_report, write_referrer_report};
use ga_report_core::{
    Aggregator, Config, DatasetUrlPattern, DownloadOptions, Downloader, GoogleAnalyticsProvider,
    MetricsClient, PeriodPlanner, PeriodRequest, ProgressEvent, ProgressSink, ReportBuilder,
    SqliteCatalog, StatStore,
};
use indicatif::{ProgressBar, ProgressStyle};
use process_lock::acquire_writer_guard;

#[derive(Parser)]
#[command(name = "ga-report")]
#[command(about = "Load web analytics for catalog datasets and build reports")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the statistics database
    InitDb,

    /// Verify OAuth credentials and write the token file
    GetAuthToken {
        /// Credentials JSON holding client_id, client_secret and refresh_token
        #[arg(default_value = "credentials.json")]
        credentials_file: PathBuf,
    },

    /// Recompute "All" rows that are missing or older than their periods
    FixTimePeriods,

    /// Fetch analytics for all months, the latest month, or one YYYY-MM month
    LoadAnalytics {
        #[arg(default_value = "latest")]
        period: String,

        /// Clear each period's stored rows before writing
        #[arg(long)]
        delete_first: bool,

        /// Only fetch site-wide statistics
        #[arg(long)]
        skip_url_stats: bool,

        /// Do not print per-period progress
        #[arg(long)]
        quiet: bool,
    },

    /// Write the all-time dataset report as CSV
    GenerateDatasetsCsv { path: PathBuf },

    /// Write the top referred datasets per period as CSV
    GenerateReferrersCsv { path: PathBuf },

    /// Mirror catalog datasets from a CSV export (name,title[,id])
    LoadCatalog { csv_file: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        ga_report_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "ga-report starting");

    match args.command {
        Command::InitDb => init_db(&db_path),
        Command::GetAuthToken { credentials_file } => get_auth_token(&config, &credentials_file),
        Command::FixTimePeriods => fix_time_periods(&db_path),
        Command::LoadAnalytics {
            period,
            delete_first,
            skip_url_stats,
            quiet,
        } => {
            let mut options = DownloadOptions::from_config(&config.download);
            options.delete_first |= delete_first;
            options.skip_url_stats |= skip_url_stats;
            options.print_progress &= !quiet;
            load_analytics(&config, &db_path, &period, options)
        }
        Command::GenerateDatasetsCsv { path } => generate_datasets_csv(&config, &db_path, &path),
        Command::GenerateReferrersCsv { path } => generate_referrers_csv(&config, &db_path, &path),
        Command::LoadCatalog { csv_file } => load_catalog(&config, &db_path, &csv_file),
    }
}

fn open_store(db_path: &Path) -> Result<StatStore> {
    let store = StatStore::open(db_path).context("failed to open database")?;
    store.migrate().context("failed to run database migrations")?;
    Ok(store)
}

fn catalog_for<'a>(config: &Config, store: &'a StatStore) -> Result<SqliteCatalog<'a>> {
    let pattern =
        DatasetUrlPattern::from_config(&config.catalog).context("invalid catalog configuration")?;
    Ok(SqliteCatalog::new(store, pattern))
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .context("invalid progress template")?
        .progress_chars("#>-"))
}

fn init_db(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let version = get_schema_version(&*store.connection()?)?;
    println!("Database: {}", db_path.display());
    println!("Schema version: {}", version);
    Ok(())
}

fn get_auth_token(config: &Config, credentials_file: &Path) -> Result<()> {
    let token_path = match config.provider.token_file() {
        Some(path) => path,
        None => {
            let path = Config::data_dir().join("token.json");
            println!(
                "provider.token_path is not set; writing {} (add it to {})",
                path.display(),
                Config::config_path().display()
            );
            path
        }
    };

    let token = auth::exchange_credentials(
        credentials_file,
        &token_path,
        &config.provider.token_uri,
        Duration::from_secs(config.provider.timeout_secs),
    )
    .context("failed to obtain an access token")?;

    println!("Token file: {}", token_path.display());
    if let Some(expires_at) = token.expires_at {
        println!("Access token expires at {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

fn fix_time_periods(db_path: &Path) -> Result<()> {
    let _writer = acquire_writer_guard(db_path).context("failed to acquire process lock")?;
    let store = open_store(db_path)?;

    let pb = ProgressBar::new(0);
    pb.set_style(bar_style()?);
    let mut on_progress = |done: usize, total: usize, url: &str| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        pb.set_message(url.to_string());
    };

    let summary = Aggregator::new(&store)
        .repair_all_missing(Some(&mut on_progress))
        .context("failed to repair rollups")?;
    pb.finish_and_clear();

    println!(
        "Repaired {} url(s): {} recomputed, {} removed",
        summary.candidates, summary.recomputed, summary.removed
    );
    Ok(())
}

/// Renders download progress on an indicatif bar.
struct BarProgress {
    bar: ProgressBar,
}

impl ProgressSink for BarProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PeriodStarted {
                period,
                index,
                total,
            } => {
                self.bar.set_length(*total as u64);
                self.bar.set_position(index.saturating_sub(1) as u64);
                self.bar.set_message(format!("fetching {}", period));
            }
            ProgressEvent::PeriodStored { period, counts } => {
                self.bar.inc(1);
                self.bar.println(format!(
                    "  {}: {} url, {} keyed, {} referral row(s)",
                    period, counts.url_stats, counts.keyed_stats, counts.referral_stats
                ));
            }
            ProgressEvent::PeriodFailed { period, error } => {
                self.bar.inc(1);
                self.bar.println(format!("  {}: skipped ({})", period, error));
            }
        }
    }
}

fn load_analytics(
    config: &Config,
    db_path: &Path,
    period: &str,
    options: DownloadOptions,
) -> Result<()> {
    // Reject bad periods before touching the store or the network
    let request: PeriodRequest = period.parse().context("invalid period argument")?;
    let planner = PeriodPlanner::new(&config.download.earliest_month, chrono::Local::now().date_naive())
        .context("invalid download.earliest_month")?;
    planner.plan(request).context("invalid period argument")?;

    let _writer = acquire_writer_guard(db_path).context("failed to acquire process lock")?;
    let store = open_store(db_path)?;
    let catalog = catalog_for(config, &store)?;
    if catalog.count()? == 0 {
        println!("Catalog mirror is empty; run load-catalog so URLs resolve to datasets.");
    }

    let provider = GoogleAnalyticsProvider::connect(&config.provider)
        .context("analytics provider is not configured")?;
    tracing::info!(profile_id = provider.profile_id(), "Connected to analytics provider");
    let client = MetricsClient::from_config(provider, &config.provider);

    let pb = ProgressBar::new(0);
    pb.set_style(bar_style()?);
    let sink: Box<dyn ProgressSink> = if options.print_progress {
        Box::new(BarProgress { bar: pb.clone() })
    } else {
        Box::new(NoProgress)
    };

    let downloader = Downloader::new(client, &store, &catalog, planner)
        .with_options(options)
        .with_progress(sink);
    let result = match request {
        PeriodRequest::All => downloader.all_(),
        PeriodRequest::Latest => downloader.latest(),
        PeriodRequest::Month { .. } => downloader.specific_month(period),
    };
    pb.finish_and_clear();
    let summary = result.context("download aborted")?;

    println!(
        "Stored {} period(s): {} url, {} keyed, {} referral row(s)",
        summary.periods_stored.len(),
        summary.counts.url_stats,
        summary.counts.keyed_stats,
        summary.counts.referral_stats
    );
    if summary.counts.unresolved > 0 {
        println!(
            "{} url row(s) did not match a catalog dataset",
            summary.counts.unresolved
        );
    }
    for (period, error) in &summary.periods_failed {
        println!("Skipped {}: {}", period, error);
    }
    Ok(())
}

fn generate_datasets_csv(config: &Config, db_path: &Path, path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let catalog = catalog_for(config, &store)?;
    let rows = ReportBuilder::new(&store, &catalog)
        .dataset_summary()
        .context("failed to build dataset report")?;

    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let written = write_dataset_report(BufWriter::new(file), rows)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {} dataset row(s) to {}", written, path.display());
    Ok(())
}

fn generate_referrers_csv(config: &Config, db_path: &Path, path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let catalog = catalog_for(config, &store)?;
    let rows = ReportBuilder::new(&store, &catalog)
        .top_referred_all_periods(config.report.top_n)
        .context("failed to build referrer report")?;

    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let written = write_referrer_report(BufWriter::new(file), rows)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {} referrer row(s) to {}", written, path.display());
    Ok(())
}

fn load_catalog(config: &Config, db_path: &Path, csv_file: &Path) -> Result<()> {
    let _writer = acquire_writer_guard(db_path).context("failed to acquire process lock")?;
    let store = open_store(db_path)?;
    let catalog = catalog_for(config, &store)?;

    let file =
        File::open(csv_file).with_context(|| format!("failed to open {}", csv_file.display()))?;
    let imported = catalog
        .import_csv(file)
        .with_context(|| format!("failed to import {}", csv_file.display()))?;
    println!(
        "Imported {} dataset(s); catalog now holds {}",
        imported,
        catalog.count()?
    );
    Ok(())
}
