// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Calendar months and the rolling window of full months ending before today.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A calendar month, displayed as `YYYY-MM`.
///
/// Ordering is calendar order (year first, then month).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    /// Create a month, returning `None` if `month` is not in `1..=12`.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// The month containing the given date.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }

    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("month is always in 1..=12")
    }

    pub fn last_day(self) -> NaiveDate {
        self.succ()
            .first_day()
            .pred_opt()
            .expect("first day of a month always has a predecessor")
    }

    /// The following month.
    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// The preceding month.
    pub fn pred(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid month label '{0}', expected YYYY-MM")]
pub struct ParseMonthError(String);

impl FromStr for Month {
    type Err = ParseMonthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMonthError(s.to_string());
        let (year, month) = s.split_once('-').ok_or_else(err)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(err());
        }
        let year = year.parse().map_err(|_| err())?;
        let month = month.parse().map_err(|_| err())?;
        Month::new(year, month).ok_or_else(err)
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An ordered run of consecutive complete months, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    months: Vec<Month>,
}

impl Window {
    /// The last `count` full months before the month containing `today`.
    ///
    /// The month containing `today` is never part of the window.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero; the CLI rejects that before getting here.
    pub fn last_full_months(count: u32, today: NaiveDate) -> Self {
        assert!(count > 0, "window must contain at least one month");

        let newest = Month::containing(today).pred();
        let mut oldest = newest;
        for _ in 1..count {
            oldest = oldest.pred();
        }

        let mut months = Vec::with_capacity(count as usize);
        let mut cur = oldest;
        while cur <= newest {
            months.push(cur);
            cur = cur.succ();
        }

        Self { months }
    }

    pub fn months(&self) -> &[Month] {
        &self.months
    }

    pub fn len(&self) -> usize {
        self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }

    /// Position of `month` in the window, if present.
    pub fn position(&self, month: Month) -> Option<usize> {
        self.months.binary_search(&month).ok()
    }

    /// First day of the oldest month.
    pub fn start_date(&self) -> NaiveDate {
        self.months[0].first_day()
    }

    /// Last day of the newest month.
    pub fn end_date(&self) -> NaiveDate {
        self.months[self.months.len() - 1].last_day()
    }

    /// Month labels in window order.
    pub fn labels(&self) -> Vec<String> {
        self.months.iter().map(Month::to_string).collect()
    }
}
