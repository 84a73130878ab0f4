//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/ga-report/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/ga-report/` (~/.config/ga-report/)
//! - Data: `$XDG_DATA_HOME/ga-report/` (~/.local/share/ga-report/)
//! - State/Logs: `$XDG_STATE_HOME/ga-report/` (~/.local/state/ga-report/)

use crate::error::{Error, Result};
use crate::types::PeriodName;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound the reporting API accepts for `max-results`
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Analytics provider access
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Download defaults
    #[serde(default)]
    pub download: DownloadConfig,

    /// Catalog URL matching
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Report generation
    #[serde(default)]
    pub report: ReportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Analytics provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Token file written by `get-auth-token`
    pub token_path: Option<PathBuf>,

    /// Analytics view (profile) id, e.g. "12345678"
    pub profile_id: Option<String>,

    /// Reporting API base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// OAuth token endpoint used for refresh-token grants
    #[serde(default = "default_token_uri")]
    pub token_uri: String,

    /// Rows requested per call
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Paging stops once the next start offset would exceed this
    #[serde(default = "default_max_offset")]
    pub max_offset: usize,

    /// Retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First backoff delay in milliseconds (doubles per retry)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            token_path: None,
            profile_id: None,
            endpoint: default_endpoint(),
            token_uri: default_token_uri(),
            page_size: default_page_size(),
            max_offset: default_max_offset(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    /// Token file path with `~` expanded, if configured.
    pub fn token_file(&self) -> Option<PathBuf> {
        self.token_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(expand_home)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_endpoint() -> String {
    "https://www.googleapis.com/analytics/v3".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_page_size() -> usize {
    1000
}

fn default_max_offset() -> usize {
    100_000
}

fn default_max_retries() -> usize {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    32_000
}

fn default_timeout_secs() -> u64 {
    60
}

/// Defaults for `load-analytics`
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    /// Delete a period's rows before storing a fresh fetch
    #[serde(default)]
    pub delete_first: bool,

    /// Only fetch site-wide stats
    #[serde(default)]
    pub skip_url_stats: bool,

    /// Emit progress notifications
    #[serde(default = "default_true")]
    pub print_progress: bool,

    /// Earliest month with recorded catalog activity ("YYYY-MM")
    #[serde(default = "default_earliest_month")]
    pub earliest_month: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            delete_first: false,
            skip_url_stats: false,
            print_progress: default_true(),
            earliest_month: default_earliest_month(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_earliest_month() -> String {
    "2012-01".to_string()
}

/// How catalog dataset URLs look
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    /// Regex with one capture group yielding the dataset name
    #[serde(default = "default_dataset_url_pattern")]
    pub dataset_url_pattern: String,

    /// Path prefix shared by every dataset URL
    #[serde(default = "default_dataset_url_prefix")]
    pub dataset_url_prefix: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dataset_url_pattern: default_dataset_url_pattern(),
            dataset_url_prefix: default_dataset_url_prefix(),
        }
    }
}

fn default_dataset_url_pattern() -> String {
    r"^/dataset/([a-z0-9_-]+)/?".to_string()
}

fn default_dataset_url_prefix() -> String {
    "/dataset/".to_string()
}

/// Report generation settings
#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    /// Rows per period in the referrer report
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

fn default_top_n() -> usize {
    5
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning an error describing the first problem
    pub fn validate(&self) -> Result<()> {
        if self.provider.page_size == 0 || self.provider.page_size > MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "provider.page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        PeriodName::parse_month(&self.download.earliest_month).map_err(|_| {
            Error::Config(format!(
                "download.earliest_month must be YYYY-MM, got {:?}",
                self.download.earliest_month
            ))
        })?;
        regex::Regex::new(&self.catalog.dataset_url_pattern)
            .map_err(|e| Error::Config(format!("catalog.dataset_url_pattern: {}", e)))?;
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/ga-report/config.toml` (~/.config/ga-report/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("ga-report").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/ga-report/` (~/.local/share/ga-report/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("ga-report")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/ga-report/` (~/.local/state/ga-report/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("ga-report")
    }

    /// Returns the database file path
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("ga-report.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("ga-report.log")
    }
}
