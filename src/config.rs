// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for download statistics collection.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fs;

/// Environment variable consulted when no project is configured.
pub const PROJECT_ENV_VAR: &str = "GCP_PROJECT";

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "pypi-stats.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Google Cloud project that is billed for queries.
    pub project: Option<String>,
    /// Directory holding per-user monthly caches.
    pub cache_dir: Utf8PathBuf,
    /// BigQuery location queries run in.
    pub location: String,
    /// Fully qualified table of PyPI download events.
    pub table: String,
    /// PyPI XML-RPC endpoint.
    pub registry_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "no GCP project specified; use --project, set `project` in the config file, \
         or set the GCP_PROJECT environment variable"
    )]
    MissingProject,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = fs::read_to_string(path.as_std_path())
            .with_context(|| format!("failed to read config file at {}", path))?;

        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file at {}", path))
    }

    /// Load configuration from `path`, or fall back to defaults if the file
    /// doesn't exist.
    pub fn load_or_default(path: &Utf8Path) -> Result<Self> {
        if path.as_std_path().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the project id: explicit override, then config file, then
    /// the environment.
    pub fn resolve_project(&self, explicit: Option<&str>) -> Result<String, ConfigError> {
        self.resolve_project_with(explicit, std::env::var(PROJECT_ENV_VAR).ok())
    }

    fn resolve_project_with(
        &self,
        explicit: Option<&str>,
        env: Option<String>,
    ) -> Result<String, ConfigError> {
        explicit
            .map(str::to_owned)
            .or_else(|| self.project.clone())
            .or(env)
            .filter(|p| !p.trim().is_empty())
            .ok_or(ConfigError::MissingProject)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: None,
            cache_dir: Utf8PathBuf::from("cache"),
            location: "US".to_string(),
            table: "bigquery-public-data.pypi.file_downloads".to_string(),
            registry_url: "https://pypi.org/pypi".to_string(),
        }
    }
}
