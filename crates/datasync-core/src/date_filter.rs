//! Date filters for date-scoped reads and deletes
//!
//! A filter resolves to the half-open interval `[start, next)` on a date
//! column. Both bounds are bound parameters; date-only bounds compare
//! correctly against columns holding either dates or timestamps.

use crate::error::{Error, Result};
use crate::query::Predicate;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Date filter for read and delete operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DateFilter {
    /// A single calendar day
    ExactDate {
        /// The day
        date: NaiveDate,
    },
    /// A whole calendar year
    YearRange {
        /// The year
        year: i32,
    },
}

impl DateFilter {
    /// Filter matching one day
    pub fn exact(year: i32, month: u32, day: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(|date| Self::ExactDate { date })
            .ok_or_else(|| Error::config(format!("invalid date {}-{}-{}", year, month, day)))
    }

    /// Filter matching one year
    pub fn year(year: i32) -> Result<Self> {
        // Both bounds must be representable
        if NaiveDate::from_ymd_opt(year, 1, 1).is_none()
            || NaiveDate::from_ymd_opt(year + 1, 1, 1).is_none()
        {
            return Err(Error::config(format!("year {} is out of range", year)));
        }
        Ok(Self::YearRange { year })
    }

    /// Parse operator input: `MM/DD/YYYY` or `YYYY`
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.len() == 4 && input.chars().all(|c| c.is_ascii_digit()) {
            let year = input
                .parse::<i32>()
                .map_err(|e| Error::config(format!("invalid year {:?}: {}", input, e)))?;
            return Self::year(year);
        }
        NaiveDate::parse_from_str(input, "%m/%d/%Y")
            .map(|date| Self::ExactDate { date })
            .map_err(|_| {
                Error::config(format!(
                    "invalid date {:?}: expected MM/DD/YYYY or YYYY",
                    input
                ))
            })
    }

    /// Inclusive lower bound
    pub fn start(&self) -> NaiveDate {
        match self {
            Self::ExactDate { date } => *date,
            Self::YearRange { year } => NaiveDate::from_ymd_opt(*year, 1, 1).unwrap_or(NaiveDate::MIN),
        }
    }

    /// Exclusive upper bound
    pub fn next(&self) -> NaiveDate {
        match self {
            Self::ExactDate { date } => date.succ_opt().unwrap_or(NaiveDate::MAX),
            Self::YearRange { year } => {
                NaiveDate::from_ymd_opt(*year + 1, 1, 1).unwrap_or(NaiveDate::MAX)
            }
        }
    }

    /// Whether a date falls inside the filter
    pub fn contains(&self, date: NaiveDate) -> bool {
        match self {
            Self::ExactDate { date: d } => *d == date,
            Self::YearRange { year } => date.year() == *year,
        }
    }

    /// Bound predicate `column >= start AND column < next`
    pub fn predicate(&self, column: &str) -> Predicate {
        Predicate::And(vec![
            Predicate::gte(column, self.start()),
            Predicate::lt(column, self.next()),
        ])
    }
}

impl FromStr for DateFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactDate { date } => write!(f, "{}", date.format("%m/%d/%Y")),
            Self::YearRange { year } => write!(f, "{}", year),
        }
    }
}
