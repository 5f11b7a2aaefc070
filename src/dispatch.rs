// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI argument parsing and command dispatch.

use crate::{
    commands::{self, ReportOptions},
    config::{Config, DEFAULT_CONFIG_PATH},
    report::ExportKind,
};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Directory for cached monthly results (overrides the config file)
    #[arg(long, global = true)]
    cache_dir: Option<Utf8PathBuf>,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Report monthly downloads for every package a PyPI user maintains
    Report {
        /// PyPI username
        username: String,

        /// Number of full months to show
        #[arg(short = 'n', long, default_value = "12", value_parser = clap::value_parser!(u32).range(1..))]
        months: u32,

        /// Hide packages with fewer total downloads than this
        #[arg(long, default_value = "0")]
        min_total: u64,

        /// Show query cost without running queries or writing the cache
        #[arg(long)]
        dry_run: bool,

        /// GCP project id (defaults to the config file, then GCP_PROJECT)
        #[arg(short, long)]
        project: Option<String>,

        /// Output path for the stacked bar chart
        #[arg(long, default_value = "downloads.png")]
        chart: Utf8PathBuf,

        /// Skip rendering the chart
        #[arg(long)]
        no_chart: bool,

        /// Export the download matrix to this file
        #[arg(long)]
        export: Option<Utf8PathBuf>,

        /// Format for --export (defaults to the file extension, else CSV)
        #[arg(long, value_enum, requires = "export")]
        format: Option<ExportFormat>,
    },

    /// List months cached for a PyPI user
    Cached {
        /// PyPI username
        username: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
}

/// Parse arguments and dispatch to the appropriate command.
pub async fn dispatch() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(Utf8Path::new(DEFAULT_CONFIG_PATH)),
    }
    .context("failed to load configuration")?;
    if let Some(cache_dir) = args.cache_dir {
        config.cache_dir = cache_dir;
    }

    match args.command {
        Command::Report {
            username,
            months,
            min_total,
            dry_run,
            project,
            chart,
            no_chart,
            export,
            format,
        } => {
            let export = export.as_deref().map(|output| {
                let format = format.unwrap_or_else(|| match output.extension() {
                    Some("json") => ExportFormat::Json,
                    _ => ExportFormat::Csv,
                });
                match format {
                    ExportFormat::Csv => ExportKind::Csv { output },
                    ExportFormat::Json => ExportKind::Json { output },
                }
            });
            let options = ReportOptions {
                subject: &username,
                months,
                min_total,
                dry_run,
                project: project.as_deref(),
                chart: (!no_chart).then_some(chart.as_path()),
                export,
            };
            commands::run_report(&config, options).await?;
        }
        Command::Cached { username } => {
            commands::run_cached(&config, &username)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pypi_download_stats={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
