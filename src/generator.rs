// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Month-by-month download statistics, served from the cache when possible.
//!
//! For each month in order:
//!
//! 1. The current calendar month is always re-queried, since it is still
//!    accumulating downloads.
//! 2. Any other month is served from the cache if a record exists.
//! 3. Otherwise the month is queried and the result written to the cache
//!    before it is yielded.
//!
//! A failed query yields an empty record with [`MonthStatus::Failed`] and is
//! not cached, so the next run retries it. In dry-run mode misses only
//! estimate query cost and nothing is written.

use crate::{
    bigquery::{FetchError, FetchMode, MonthFetch, QueryBackend, fetch_month},
    cache::{CacheError, CacheStore, MonthRecord},
    window::Month,
};
use std::{collections::BTreeSet, slice};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum MonthError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to cache results for {month}")]
    Persist {
        month: Month,
        #[source]
        source: CacheError,
    },
}

/// How a month's record was obtained.
#[derive(Debug)]
pub enum MonthStatus {
    /// Served from the cache without a backend call.
    Cached,
    /// Queried and written to the cache.
    Fetched,
    /// Dry run: the query was only costed.
    Estimated { bytes: u64 },
    /// The query (or caching its result) failed; the record is empty.
    Failed(MonthError),
}

/// Download counts for one month, plus where they came from.
#[derive(Debug)]
pub struct MonthStats {
    pub month: Month,
    pub record: MonthRecord,
    pub status: MonthStatus,
}

impl MonthStats {
    fn empty(month: Month, status: MonthStatus) -> Self {
        Self {
            month,
            record: MonthRecord::new(),
            status,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, MonthStatus::Failed(_))
    }
}

/// Tally of how each month in a run was resolved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cached: usize,
    pub fetched: usize,
    pub failed: Vec<Month>,
    pub estimates: Vec<(Month, u64)>,
}

impl RunSummary {
    pub fn record(&mut self, stats: &MonthStats) {
        match &stats.status {
            MonthStatus::Cached => self.cached += 1,
            MonthStatus::Fetched => self.fetched += 1,
            MonthStatus::Estimated { bytes } => self.estimates.push((stats.month, *bytes)),
            MonthStatus::Failed(_) => self.failed.push(stats.month),
        }
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.estimates.iter().map(|(_, bytes)| bytes).sum()
    }
}

/// Forward-only producer of [`MonthStats`], one per month in order.
///
/// Each call to [`next_month`](Self::next_month) does at most one backend
/// call. Creating a new generator over the same months repeats the same
/// cache decisions.
pub struct MonthlyStats<'a, B> {
    backend: &'a B,
    cache: &'a CacheStore,
    subject: &'a str,
    packages: &'a BTreeSet<String>,
    months: slice::Iter<'a, Month>,
    current: Month,
    mode: FetchMode,
}

impl<'a, B: QueryBackend> MonthlyStats<'a, B> {
    pub fn new(
        backend: &'a B,
        cache: &'a CacheStore,
        subject: &'a str,
        packages: &'a BTreeSet<String>,
        months: &'a [Month],
        current: Month,
    ) -> Self {
        Self {
            backend,
            cache,
            subject,
            packages,
            months: months.iter(),
            current,
            mode: FetchMode::Execute,
        }
    }

    /// Only estimate query cost on cache misses, and never write the cache.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.mode = if dry_run {
            FetchMode::DryRun
        } else {
            FetchMode::Execute
        };
        self
    }

    /// Produce the next month, or `None` once every month has been yielded.
    pub async fn next_month(&mut self) -> Option<MonthStats> {
        let month = *self.months.next()?;

        if month != self.current {
            match self.cache.load(self.subject, month) {
                Ok(Some(record)) => {
                    info!(%month, "using cached data");
                    return Some(MonthStats {
                        month,
                        record,
                        status: MonthStatus::Cached,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%month, error = %display_chain(&e), "ignoring unreadable cache entry");
                }
            }
        }

        info!(%month, "querying BigQuery");
        let stats = match fetch_month(self.backend, self.packages, month, self.mode).await {
            Ok(MonthFetch::Counts(record)) => self.commit(month, record),
            Ok(MonthFetch::Estimate { bytes }) => {
                MonthStats::empty(month, MonthStatus::Estimated { bytes })
            }
            Err(e) => {
                error!(%month, error = %display_chain(&e), "query failed");
                if self.mode == FetchMode::Execute {
                    warn!(%month, "skipping month; run again later when quota resets");
                }
                MonthStats::empty(month, MonthStatus::Failed(e.into()))
            }
        };

        Some(stats)
    }

    /// Drive the generator to completion.
    pub async fn collect_all(mut self) -> Vec<MonthStats> {
        let mut all = Vec::with_capacity(self.months.len());
        while let Some(stats) = self.next_month().await {
            all.push(stats);
        }
        all
    }

    fn commit(&self, month: Month, record: MonthRecord) -> MonthStats {
        match self.cache.save(self.subject, month, &record) {
            Ok(()) => MonthStats {
                month,
                record,
                status: MonthStatus::Fetched,
            },
            Err(source) => {
                error!(%month, error = %display_chain(&source), "failed to cache results");
                let err = MonthError::Persist { month, source };
                MonthStats::empty(month, MonthStatus::Failed(err))
            }
        }
    }
}

/// Render an error and its sources as `outer: inner: ...`.
pub fn display_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
