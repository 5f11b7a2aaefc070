// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command implementations.

use crate::{
    bigquery::BigQueryClient,
    cache::{CacheStore, MonthRecord},
    charts,
    config::Config,
    generator::{MonthlyStats, RunSummary, display_chain},
    pypi,
    report::{self, ExportKind},
    series::Series,
    window::{Month, Window},
};
use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::Local;
use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct ReportOptions<'a> {
    pub subject: &'a str,
    pub months: u32,
    pub min_total: u64,
    pub dry_run: bool,
    pub project: Option<&'a str>,
    pub chart: Option<&'a Utf8Path>,
    pub export: Option<ExportKind<'a>>,
}

/// Run the report command.
pub async fn run_report(config: &Config, options: ReportOptions<'_>) -> Result<()> {
    let project = config.resolve_project(options.project)?;

    let today = Local::now().date_naive();
    let window = Window::last_full_months(options.months, today);
    println!(
        "Reporting {} full months ({} to {}) for {}",
        window.len(),
        window.start_date(),
        window.end_date(),
        options.subject
    );

    let packages = pypi::user_packages(&config.registry_url, options.subject)
        .await
        .context("failed to look up packages on PyPI")?;
    if packages.is_empty() {
        anyhow::bail!("no packages found for user '{}'", options.subject);
    }
    println!("  Found {} packages", packages.len());

    let cache = CacheStore::new(config.cache_dir.clone());
    let backend = BigQueryClient::new(project, config);
    let stats = MonthlyStats::new(
        &backend,
        &cache,
        options.subject,
        &packages,
        window.months(),
        Month::containing(today),
    )
    .dry_run(options.dry_run);

    let (mut series, summary) = Series::assemble(window.clone(), &packages, stats).await;

    if options.dry_run {
        print!("{}", format_estimates(&summary));
        return Ok(());
    }

    println!(
        "  {} months from cache, {} fetched, {} failed",
        summary.cached,
        summary.fetched,
        summary.failed.len()
    );
    if !summary.failed.is_empty() {
        println!(
            "  Shown as zero, retried on the next run: {}",
            join_months(&summary.failed)
        );
    }

    series.filter_min_total(options.min_total);
    if series.is_empty() {
        println!("All packages filtered out by --min-total.");
        return Ok(());
    }

    report::print_series(&series);

    if let Some(chart) = options.chart {
        charts::render_stacked_bars(&series, options.subject, chart)?;
        println!("\nChart saved to {}", chart);
    }

    if let Some(export) = options.export {
        report::run_export(&series, options.subject, export)?;
    }

    Ok(())
}

/// Run the cached command: list cached months without touching the network.
pub fn run_cached(config: &Config, subject: &str) -> Result<()> {
    let cache = CacheStore::new(config.cache_dir.clone());
    let cached = load_cached(&cache, subject)?;
    report::print_cached(subject, &cached);
    Ok(())
}

/// Every readable cached month for `subject`. Unreadable entries are logged
/// and skipped.
fn load_cached(cache: &CacheStore, subject: &str) -> Result<Vec<(Month, MonthRecord)>> {
    let months = cache
        .cached_months(subject)
        .with_context(|| format!("failed to list cache for '{}'", subject))?;

    let mut cached = Vec::with_capacity(months.len());
    for month in months {
        match cache.load(subject, month) {
            Ok(Some(record)) => cached.push((month, record)),
            Ok(None) => {}
            Err(e) => {
                warn!(%month, error = %display_chain(&e), "skipping unreadable cache entry");
            }
        }
    }
    Ok(cached)
}

fn join_months(months: &[Month]) -> String {
    months
        .iter()
        .map(Month::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Dry-run report: per-month cost estimates and any months that could not
/// be estimated.
fn format_estimates(summary: &RunSummary) -> String {
    if summary.estimates.is_empty() && summary.failed.is_empty() {
        return "\nDry run: every month is cached, no queries needed.\n".to_string();
    }

    let mut out = String::from("\nDry run estimates:\n");

    for (month, bytes) in &summary.estimates {
        out.push_str(&format!(
            "  Query for {} will process {:.2} GB\n",
            month,
            *bytes as f64 / BYTES_PER_GB
        ));
    }
    if !summary.estimates.is_empty() {
        out.push_str(&format!(
            "  Total: {:.2} GB across {} queries\n",
            summary.estimated_bytes() as f64 / BYTES_PER_GB,
            summary.estimates.len()
        ));
    }
    if !summary.failed.is_empty() {
        out.push_str(&format!(
            "  Estimate failed for {} months: {}\n",
            summary.failed.len(),
            join_months(&summary.failed)
        ));
    }
    out
}
