// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Terminal tables and file export for download series.

use crate::{cache::MonthRecord, series::Series, window::Month};
use anyhow::{Context, Result};
use camino::Utf8Path;
use std::{fs::File, io::Write};

pub enum ExportKind<'a> {
    Csv { output: &'a Utf8Path },
    Json { output: &'a Utf8Path },
}

/// Print per-month and per-package totals.
pub fn print_series(series: &Series) {
    println!("\n{:<12} {:>15}", "Month", "Downloads");
    println!("{}", "=".repeat(30));
    for (label, total) in series.window().labels().iter().zip(series.column_totals()) {
        println!("{:<12} {:>15}", label, format_number(total));
    }

    let rows = series.sorted_by_total();
    let width = rows
        .iter()
        .map(|(package, _)| package.len())
        .max()
        .unwrap_or(0)
        .max("Package".len());

    println!("\n{:<width$} {:>15}", "Package", "Total", width = width);
    println!("{}", "=".repeat(width + 16));
    for (package, row) in rows {
        println!(
            "{:<width$} {:>15}",
            package,
            format_number(row.iter().sum()),
            width = width
        );
    }
}

/// Print the months cached for a subject with their totals.
pub fn print_cached(subject: &str, cached: &[(Month, MonthRecord)]) {
    if cached.is_empty() {
        println!("No cached months for {}.", subject);
        return;
    }

    println!("\nCached months for {}\n", subject);
    println!("{:<12} {:>10} {:>15}", "Month", "Packages", "Downloads");
    println!("{}", "=".repeat(39));
    for (month, record) in cached {
        println!(
            "{:<12} {:>10} {:>15}",
            month.to_string(),
            record.len(),
            format_number(record.values().sum())
        );
    }
}

pub fn run_export(series: &Series, subject: &str, export: ExportKind<'_>) -> Result<()> {
    let (output, content) = match export {
        ExportKind::Csv { output } => (output, to_csv(series)),
        ExportKind::Json { output } => (output, to_json(series, subject)?),
    };

    let mut file = File::create(output.as_std_path())
        .with_context(|| format!("failed to create file at {}", output))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write to {}", output))?;

    println!("Exported to {}.", output);
    Ok(())
}

fn to_csv(series: &Series) -> String {
    let mut header = vec!["package".to_string()];
    header.extend(series.window().labels());
    header.push("total".to_string());

    let mut out = header.join(",");
    out.push('\n');

    for (package, row) in series.rows() {
        let mut values = vec![package.clone()];
        values.extend(row.iter().map(u64::to_string));
        values.push(row.iter().sum::<u64>().to_string());
        out.push_str(&values.join(","));
        out.push('\n');
    }
    out
}

fn to_json(series: &Series, subject: &str) -> Result<String> {
    let value = serde_json::json!({
        "subject": subject,
        "months": series.window().labels(),
        "series": series.rows(),
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Format a number with thousands separators.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        generator::{MonthStats, MonthStatus},
        window::Window,
    };
    use camino::Utf8PathBuf;
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    fn sample_series() -> Series {
        let window = Window::last_full_months(2, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        let packages: BTreeSet<String> = ["alpha", "beta"].iter().map(|s| s.to_string()).collect();
        let mut series = Series::new(window, &packages);
        series.fill(&MonthStats {
            month: "2024-02".parse().unwrap(),
            record: MonthRecord::from([("alpha".to_string(), 1500), ("beta".to_string(), 2)]),
            status: MonthStatus::Fetched,
        });
        series
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_to_csv() {
        let csv = to_csv(&sample_series());
        assert_eq!(
            csv,
            "package,2024-01,2024-02,total\nalpha,0,1500,1500\nbeta,0,2,2\n"
        );
    }

    #[test]
    fn test_export_json() {
        let dir = tempfile::tempdir().unwrap();
        let output = Utf8PathBuf::from_path_buf(dir.path().join("series.json")).unwrap();

        run_export(&sample_series(), "alice", ExportKind::Json { output: &output }).unwrap();

        let content = std::fs::read_to_string(&output).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["subject"], "alice");
        assert_eq!(value["months"], serde_json::json!(["2024-01", "2024-02"]));
        assert_eq!(value["series"]["alpha"], serde_json::json!([0, 1500]));
    }
}
