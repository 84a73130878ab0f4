//! Core domain types for ga-report
//!
//! These types represent the canonical data model:
//! - Periods (named time windows) and the entity kinds stored per period
//! - Stored statistics rows (url, keyed, referral)
//! - Catalog entities referenced by the stats

use crate::error::{Error, Result};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Name of the rollup period spanning the full history.
pub const ALL_PERIOD: &str = "All";

// ============================================
// Periods
// ============================================

/// The name a stats row is stored under.
///
/// Months are written as `YYYY-MM`, days as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodName {
    /// Sentinel spanning the full history
    All,
    /// A calendar month
    Month { year: i32, month: u32 },
    /// A single day
    Day(NaiveDate),
}

impl PeriodName {
    /// Build a month name, rejecting months outside 1..=12.
    pub fn month(year: i32, month: u32) -> Result<Self> {
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(Error::InvalidPeriod(format!("{year:04}-{month:02}")));
        }
        Ok(PeriodName::Month { year, month })
    }

    /// Parse a strict `YYYY-MM` month string.
    pub fn parse_month(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 7 || bytes[4] != b'-' {
            return Err(Error::InvalidPeriod(s.to_string()));
        }
        let date = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d")
            .map_err(|_| Error::InvalidPeriod(s.to_string()))?;
        Ok(PeriodName::Month {
            year: date.year(),
            month: date.month(),
        })
    }

    /// Month containing the given date.
    pub fn month_of(date: NaiveDate) -> Self {
        PeriodName::Month {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, PeriodName::All)
    }
}

impl fmt::Display for PeriodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodName::All => f.write_str(ALL_PERIOD),
            PeriodName::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            PeriodName::Day(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

impl FromStr for PeriodName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == ALL_PERIOD {
            return Ok(PeriodName::All);
        }
        if s.len() == 10 {
            return NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(PeriodName::Day)
                .map_err(|_| Error::InvalidPeriod(s.to_string()));
        }
        PeriodName::parse_month(s)
    }
}

/// A named, typed interval to fetch from the provider.
///
/// `start` and `end` are inclusive. For the current month `end` is clamped
/// to today, so the period covers a partial month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub name: PeriodName,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    /// A calendar month, clamped so it never extends past `today`.
    pub fn month(year: i32, month: u32, today: NaiveDate) -> Result<Self> {
        let name = PeriodName::month(year, month)?;
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| Error::InvalidPeriod(name.to_string()))?;
        let end = last_day_of_month(start).min(today);
        Ok(Self { name, start, end })
    }

    /// Whether the period's window has closed as of `today`.
    pub fn is_complete(&self, today: NaiveDate) -> bool {
        match self.name {
            PeriodName::Month { .. } => last_day_of_month(self.start) < today,
            _ => self.end < today,
        }
    }
}

/// Last calendar day of the month containing `date`.
pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(date)
}

// ============================================
// Stored rows
// ============================================

/// The kinds of rows stored per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// Per-URL pageviews/visits (`ga_url`)
    Url,
    /// Named statistics keyed by an arbitrary string (`ga_stat`)
    Keyed,
    /// Referred visits per URL (`ga_referrer`)
    Referral,
}

impl StatKind {
    pub fn table(&self) -> &'static str {
        match self {
            StatKind::Url => "ga_url",
            StatKind::Keyed => "ga_stat",
            StatKind::Referral => "ga_referrer",
        }
    }
}

/// Pageviews and visits for one URL in one period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlStat {
    pub url: String,
    pub period_name: String,
    pub pageviews: i64,
    pub visits: i64,
    /// Owning catalog entity, when the URL could be resolved
    pub package_id: Option<String>,
}

/// A named statistic for a key in one period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedStat {
    pub stat_name: String,
    pub key: String,
    pub period_name: String,
    pub value: i64,
}

/// Visits attributed to referrals for one URL in one period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralStat {
    pub url: String,
    pub period_name: String,
    pub count: i64,
}

/// A dataset record in the host catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntity {
    pub id: String,
    pub name: String,
    pub title: String,
}
