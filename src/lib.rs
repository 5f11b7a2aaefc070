// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Monthly PyPI download statistics for a user's packages, backed by
//! BigQuery and an incremental per-month cache.

pub mod bigquery;
pub mod cache;
pub mod charts;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod generator;
pub mod pypi;
pub mod report;
pub mod series;
pub mod window;
