// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stacked bar chart of monthly downloads per package.

use crate::{report::format_number, series::Series};
use anyhow::{Context, Result};
use camino::Utf8Path;
use plotters::prelude::*;

const CHART_WIDTH: u32 = 1600;
const CHART_HEIGHT: u32 = 900;

const FONT_FAMILY: &str = "sans-serif";
const TITLE_SIZE: i32 = 24;
const LABEL_SIZE: i32 = 16;
const AXIS_SIZE: i32 = 14;

const BACKGROUND: RGBColor = RGBColor(250, 250, 252); // Off-white
const TEXT_PRIMARY: RGBColor = RGBColor(15, 23, 42); // Slate 900
const TEXT_SECONDARY: RGBColor = RGBColor(100, 116, 139); // Slate 500
const GRID_COLOR: RGBColor = RGBColor(226, 232, 240); // Slate 200

const PALETTE: [RGBColor; 10] = [
    RGBColor(59, 130, 246),  // Blue
    RGBColor(34, 197, 94),   // Green
    RGBColor(251, 146, 60),  // Orange
    RGBColor(236, 72, 153),  // Pink
    RGBColor(99, 102, 241),  // Indigo
    RGBColor(234, 179, 8),   // Yellow
    RGBColor(20, 184, 166),  // Teal
    RGBColor(239, 68, 68),   // Red
    RGBColor(168, 85, 247),  // Purple
    RGBColor(156, 163, 175), // Gray
];

/// Chart title for a subject's window.
pub fn chart_title(series: &Series, subject: &str) -> String {
    format!(
        "PyPI downloads (last {} full months) - {}",
        series.window().len(),
        subject
    )
}

/// Right edge of the bar in column `index` of `count`.
fn segment_end(index: usize, count: usize) -> SegmentValue<u32> {
    if index + 1 >= count {
        SegmentValue::Last
    } else {
        SegmentValue::Exact(index as u32 + 1)
    }
}

/// Render the series as a stacked bar chart, most popular package at the
/// bottom of each stack.
pub fn render_stacked_bars(series: &Series, subject: &str, output_path: &Utf8Path) -> Result<()> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent.as_std_path())
            .with_context(|| format!("failed to create output directory at {}", parent))?;
    }

    let labels = series.window().labels();
    let month_count = labels.len() as u32;
    let max_downloads = series.column_totals().into_iter().max().unwrap_or(0).max(1);

    let root = BitMapBackend::new(output_path.as_std_path(), (CHART_WIDTH, CHART_HEIGHT))
        .into_drawing_area();
    root.fill(&BACKGROUND)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            chart_title(series, subject),
            (FONT_FAMILY, TITLE_SIZE).into_font().color(&TEXT_PRIMARY),
        )
        .margin(60)
        .x_label_area_size(70)
        .y_label_area_size(100)
        .build_cartesian_2d(
            (0u32..month_count - 1).into_segmented(),
            0u64..max_downloads + max_downloads / 10,
        )?;

    let x_label = |value: &SegmentValue<u32>| match value {
        SegmentValue::CenterOf(i) => labels.get(*i as usize).cloned().unwrap_or_default(),
        _ => String::new(),
    };

    chart
        .configure_mesh()
        .bold_line_style(&GRID_COLOR.mix(0.3))
        .light_line_style(&TRANSPARENT)
        .x_labels(labels.len())
        .y_labels(6)
        .x_desc("Month")
        .y_desc("Downloads")
        .axis_desc_style((FONT_FAMILY, LABEL_SIZE).into_font().color(&TEXT_SECONDARY))
        .x_label_style((FONT_FAMILY, AXIS_SIZE).into_font().color(&TEXT_SECONDARY))
        .y_label_style((FONT_FAMILY, AXIS_SIZE).into_font().color(&TEXT_SECONDARY))
        .x_label_formatter(&x_label)
        .y_label_formatter(&|y| format_number(*y))
        .disable_x_mesh()
        .draw()?;

    let mut bottoms = vec![0u64; labels.len()];
    for (idx, (package, row)) in series.sorted_by_total().into_iter().enumerate() {
        let color = PALETTE[idx % PALETTE.len()];

        let bars: Vec<_> = row
            .iter()
            .enumerate()
            .filter(|(_, downloads)| **downloads > 0)
            .map(|(i, downloads)| {
                let low = bottoms[i];
                let mut bar = Rectangle::new(
                    [
                        (SegmentValue::Exact(i as u32), low),
                        (segment_end(i, labels.len()), low + downloads),
                    ],
                    color.filled(),
                );
                bar.set_margin(0, 0, 8, 8);
                bar
            })
            .collect();

        for (bottom, downloads) in bottoms.iter_mut().zip(row) {
            *bottom += downloads;
        }

        chart
            .draw_series(bars)?
            .label(package)
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled()));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .label_font((FONT_FAMILY, LABEL_SIZE).into_font().color(&TEXT_PRIMARY))
        .background_style(&BACKGROUND)
        .border_style(&GRID_COLOR)
        .margin(15)
        .draw()?;

    root.present()
        .with_context(|| format!("failed to write chart to {}", output_path))?;
    Ok(())
}
