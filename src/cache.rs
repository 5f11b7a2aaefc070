// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk cache of monthly download counts.
//!
//! Each (subject, month) pair is stored as one JSON object mapping package
//! name to download count, at `<root>/<subject>/<YYYY-MM>.json`. A missing
//! file means the month has never been fetched.

use crate::window::Month;
use camino::{Utf8Path, Utf8PathBuf};
use std::{collections::BTreeMap, fs, io};

/// Download counts for one month, keyed by package name.
///
/// Packages without downloads are absent rather than zero.
pub type MonthRecord = BTreeMap<String, u64>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to access cache file at {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse cache file at {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Cache of month records, namespaced per subject.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn subject_dir(&self, subject: &str) -> Utf8PathBuf {
        self.root.join(sanitize_subject(subject))
    }

    fn month_path(&self, subject: &str, month: Month) -> Utf8PathBuf {
        self.subject_dir(subject).join(format!("{}.json", month))
    }

    /// Load the cached record for a month, or `None` if it was never saved.
    pub fn load(&self, subject: &str, month: Month) -> Result<Option<MonthRecord>, CacheError> {
        let path = self.month_path(subject, month);
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| CacheError::Parse { path, source })
    }

    /// Save (or overwrite) the record for a month.
    ///
    /// The file is written to a temporary sibling and renamed into place, so
    /// readers never observe a half-written record.
    pub fn save(&self, subject: &str, month: Month, record: &MonthRecord) -> Result<(), CacheError> {
        let dir = self.subject_dir(subject);
        fs::create_dir_all(dir.as_std_path()).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = self.month_path(subject, month);
        let tmp_path = dir.join(format!("{}.json.tmp", month));

        let json = serde_json::to_string_pretty(record).map_err(|source| CacheError::Parse {
            path: path.clone(),
            source,
        })?;

        fs::write(tmp_path.as_std_path(), json).map_err(|source| CacheError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|source| CacheError::Io { path, source })?;

        Ok(())
    }

    /// List the months cached for a subject, oldest first.
    pub fn cached_months(&self, subject: &str) -> Result<Vec<Month>, CacheError> {
        let dir = self.subject_dir(subject);
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(CacheError::Io { path: dir, source }),
        };

        let mut months = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::Io {
                path: dir.clone(),
                source,
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(month) = name.strip_suffix(".json").and_then(|s| s.parse::<Month>().ok()) {
                months.push(month);
            }
        }

        months.sort();
        Ok(months)
    }
}

/// Turn a subject name into a single safe path component.
fn sanitize_subject(subject: &str) -> String {
    let sanitized: String = subject
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '<' | '>' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match sanitized.as_str() {
        "" | "." | ".." => format!("_{}", sanitized),
        _ => sanitized,
    }
}
