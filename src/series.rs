// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Assembly of monthly records into a per-package download matrix.

use crate::{
    bigquery::QueryBackend,
    generator::{MonthStats, MonthlyStats, RunSummary},
    window::Window,
};
use std::collections::{BTreeMap, BTreeSet};

/// Per-package download counts, one column per window month.
///
/// Every row has the same length as the window. Months a package has no
/// record for stay at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    window: Window,
    rows: BTreeMap<String, Vec<u64>>,
}

impl Series {
    /// Create an all-zero matrix for the given packages.
    pub fn new(window: Window, packages: &BTreeSet<String>) -> Self {
        let rows = packages
            .iter()
            .map(|p| (p.clone(), vec![0; window.len()]))
            .collect();
        Self { window, rows }
    }

    /// Drive `stats` to completion, filling one column per yielded month.
    pub async fn assemble<B: QueryBackend>(
        window: Window,
        packages: &BTreeSet<String>,
        mut stats: MonthlyStats<'_, B>,
    ) -> (Self, RunSummary) {
        let mut series = Self::new(window, packages);
        let mut summary = RunSummary::default();
        while let Some(month) = stats.next_month().await {
            summary.record(&month);
            series.fill(&month);
        }
        (series, summary)
    }

    /// Fill the column for one month.
    ///
    /// Packages not in the matrix, and months outside the window, are
    /// ignored.
    pub fn fill(&mut self, stats: &MonthStats) {
        let Some(column) = self.window.position(stats.month) else {
            return;
        };
        for (package, downloads) in &stats.record {
            if let Some(row) = self.rows.get_mut(package) {
                row[column] = *downloads;
            }
        }
    }

    /// Drop packages whose total over the window is below `min_total`.
    pub fn filter_min_total(&mut self, min_total: u64) {
        if min_total > 0 {
            self.rows.retain(|_, row| row.iter().sum::<u64>() >= min_total);
        }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn rows(&self) -> &BTreeMap<String, Vec<u64>> {
        &self.rows
    }

    pub fn row(&self, package: &str) -> Option<&[u64]> {
        self.rows.get(package).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total downloads per package.
    pub fn totals(&self) -> BTreeMap<&str, u64> {
        self.rows
            .iter()
            .map(|(p, row)| (p.as_str(), row.iter().sum()))
            .collect()
    }

    /// Total downloads per month across all packages.
    pub fn column_totals(&self) -> Vec<u64> {
        let mut totals = vec![0; self.window.len()];
        for row in self.rows.values() {
            for (total, downloads) in totals.iter_mut().zip(row) {
                *total += downloads;
            }
        }
        totals
    }

    /// Rows ordered by total downloads, most popular first. Ties are broken
    /// by package name.
    pub fn sorted_by_total(&self) -> Vec<(&str, &[u64])> {
        let mut rows: Vec<(&str, &[u64], u64)> = self
            .rows
            .iter()
            .map(|(p, row)| (p.as_str(), row.as_slice(), row.iter().sum()))
            .collect();
        rows.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(b.0)));
        rows.into_iter().map(|(p, row, _)| (p, row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MonthRecord, generator::MonthStatus, window::Month};
    use chrono::NaiveDate;

    fn window() -> Window {
        Window::last_full_months(3, NaiveDate::from_ymd_opt(2024, 4, 10).unwrap())
    }

    fn packages(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn stats(month: &str, entries: &[(&str, u64)]) -> MonthStats {
        MonthStats {
            month: month.parse().unwrap(),
            record: entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<MonthRecord>(),
            status: MonthStatus::Cached,
        }
    }

    #[test]
    fn test_new_is_all_zero() {
        let series = Series::new(window(), &packages(&["a", "b"]));
        assert_eq!(series.row("a"), Some(&[0, 0, 0][..]));
        assert_eq!(series.row("b"), Some(&[0, 0, 0][..]));
    }

    #[test]
    fn test_fill_columns() {
        let mut series = Series::new(window(), &packages(&["a", "b"]));
        series.fill(&stats("2024-01", &[("a", 10)]));
        series.fill(&stats("2024-03", &[("a", 2), ("b", 7), ("unknown", 99)]));
        series.fill(&stats("2023-01", &[("a", 1000)]));

        assert_eq!(series.row("a"), Some(&[10, 0, 2][..]));
        assert_eq!(series.row("b"), Some(&[0, 0, 7][..]));
        assert!(series.row("unknown").is_none());
        assert_eq!(series.column_totals(), vec![10, 0, 9]);
    }

    #[test]
    fn test_empty_record_reads_as_zero() {
        let mut series = Series::new(window(), &packages(&["a"]));
        series.fill(&MonthStats {
            month: Month::new(2024, 2).unwrap(),
            record: MonthRecord::new(),
            status: MonthStatus::Estimated { bytes: 0 },
        });
        assert_eq!(series.row("a"), Some(&[0, 0, 0][..]));
    }

    #[test]
    fn test_filter_min_total() {
        let mut series = Series::new(window(), &packages(&["a", "b", "never"]));
        series.fill(&stats("2024-01", &[("a", 10), ("b", 1)]));
        series.fill(&stats("2024-02", &[("a", 5), ("b", 3)]));

        let mut unfiltered = series.clone();
        unfiltered.filter_min_total(0);
        assert_eq!(unfiltered.row("never"), Some(&[0, 0, 0][..]));

        series.filter_min_total(4);
        assert_eq!(
            series.rows().keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        series.filter_min_total(5);
        assert_eq!(series.rows().keys().collect::<Vec<_>>(), vec!["a"]);

        series.filter_min_total(1000);
        assert!(series.is_empty());
    }

    #[test]
    fn test_sorted_by_total() {
        let mut series = Series::new(window(), &packages(&["a", "b", "c"]));
        series.fill(&stats("2024-01", &[("a", 1), ("b", 5), ("c", 1)]));

        let order: Vec<&str> = series.sorted_by_total().into_iter().map(|(p, _)| p).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(series.totals()["b"], 5);
    }

    /// Counts every package as `base + month`, recording which months were
    /// queried.
    struct CountingBackend {
        calls: std::cell::RefCell<Vec<Month>>,
    }

    impl QueryBackend for CountingBackend {
        async fn count_downloads(
            &self,
            query: &crate::bigquery::DownloadQuery<'_>,
        ) -> Result<MonthRecord, crate::bigquery::BackendError> {
            let month = Month::containing(query.start);
            self.calls.borrow_mut().push(month);
            Ok(MonthRecord::from([("A".to_string(), 20 + u64::from(month.month()))]))
        }

        async fn estimate_bytes(
            &self,
            _query: &crate::bigquery::DownloadQuery<'_>,
        ) -> Result<u64, crate::bigquery::BackendError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_assemble_mixes_cache_and_fresh_months() {
        let dir = tempfile::tempdir().unwrap();
        let cache = crate::cache::CacheStore::new(
            camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        );
        let jan = Month::new(2024, 1).unwrap();
        let mar = Month::new(2024, 3).unwrap();
        cache
            .save("alice", jan, &MonthRecord::from([("A".to_string(), 10)]))
            .unwrap();
        cache
            .save("alice", mar, &MonthRecord::from([("A".to_string(), 1)]))
            .unwrap();

        let backend = CountingBackend {
            calls: Default::default(),
        };
        let pkgs = packages(&["A", "B"]);
        let window = window();
        let generator = MonthlyStats::new(&backend, &cache, "alice", &pkgs, window.months(), mar);

        let (series, summary) = Series::assemble(window.clone(), &pkgs, generator).await;

        // 2024-02 is missing from the cache and 2024-03 is the current month.
        assert_eq!(
            *backend.calls.borrow(),
            vec![Month::new(2024, 2).unwrap(), mar]
        );
        assert_eq!(series.row("A"), Some(&[10, 22, 23][..]));
        assert_eq!(series.row("B"), Some(&[0, 0, 0][..]));
        assert_eq!(summary.cached, 1);
        assert_eq!(summary.fetched, 2);
        assert!(summary.failed.is_empty());

        let mut filtered = series.clone();
        filtered.filter_min_total(1);
        assert!(filtered.row("B").is_none());
    }
}
