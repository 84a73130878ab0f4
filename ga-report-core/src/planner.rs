//! Turns a load request into the concrete periods to fetch.
//!
//! Policy for `latest`: the current calendar month, from its first day
//! through today. The month stays partial until it ends, and every later
//! fetch of it overwrites the earlier counts.

use crate::error::{Error, Result};
use crate::types::{Period, PeriodName};
use chrono::{Datelike, NaiveDate};
use std::str::FromStr;

/// What a load was asked to cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodRequest {
    /// Every month from the earliest recorded activity through now
    All,
    /// The current (partial) month
    Latest,
    /// One specific month
    Month { year: i32, month: u32 },
}

impl FromStr for PeriodRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(PeriodRequest::All),
            "latest" => Ok(PeriodRequest::Latest),
            other => match PeriodName::parse_month(other)? {
                PeriodName::Month { year, month } => Ok(PeriodRequest::Month { year, month }),
                _ => Err(Error::InvalidPeriod(other.to_string())),
            },
        }
    }
}

/// Computes period lists relative to a fixed "today".
#[derive(Debug, Clone, Copy)]
pub struct PeriodPlanner {
    earliest: NaiveDate,
    today: NaiveDate,
}

impl PeriodPlanner {
    /// `earliest_month` is the catalog's first month with recorded activity.
    pub fn new(earliest_month: &str, today: NaiveDate) -> Result<Self> {
        let earliest = match PeriodName::parse_month(earliest_month)? {
            PeriodName::Month { year, month } => NaiveDate::from_ymd_opt(year, month, 1)
                .ok_or_else(|| Error::InvalidPeriod(earliest_month.to_string()))?,
            _ => return Err(Error::InvalidPeriod(earliest_month.to_string())),
        };
        Ok(Self { earliest, today })
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    /// Periods to fetch for `request`, oldest first.
    pub fn plan(&self, request: PeriodRequest) -> Result<Vec<Period>> {
        match request {
            PeriodRequest::All => self.all_months(),
            PeriodRequest::Latest => {
                Ok(vec![Period::month(self.today.year(), self.today.month(), self.today)?])
            }
            PeriodRequest::Month { year, month } => Ok(vec![self.month(year, month)?]),
        }
    }

    /// A single month, rejected if it starts after the current month.
    pub fn month(&self, year: i32, month: u32) -> Result<Period> {
        let name = PeriodName::month(year, month)?;
        if name > PeriodName::month_of(self.today) {
            return Err(Error::InvalidPeriod(format!("{name} is in the future")));
        }
        Period::month(year, month, self.today)
    }

    fn all_months(&self) -> Result<Vec<Period>> {
        let mut periods = Vec::new();
        let (mut year, mut month) = (self.earliest.year(), self.earliest.month());
        let last = (self.today.year(), self.today.month());

        while (year, month) <= last {
            periods.push(Period::month(year, month, self.today)?);
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        Ok(periods)
    }
}
