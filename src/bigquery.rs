// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! BigQuery client for per-month PyPI download counts.

use crate::{cache::MonthRecord, config::Config, window::Month};
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::OnceCell;
use tracing::debug;

const BIGQUERY_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const TOKEN_ENV_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
const QUERY_TIMEOUT_MS: u64 = 60_000;

/// An aggregation over one date range and a fixed set of packages.
#[derive(Debug, Clone, Copy)]
pub struct DownloadQuery<'a> {
    pub packages: &'a BTreeSet<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl<'a> DownloadQuery<'a> {
    /// The query covering every day of `month`.
    pub fn for_month(packages: &'a BTreeSet<String>, month: Month) -> Self {
        Self {
            packages,
            start: month.first_day(),
            end: month.last_day(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request to BigQuery failed")]
    Http(#[from] reqwest::Error),

    #[error("BigQuery returned status {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("malformed BigQuery response: {0}")]
    Malformed(String),

    #[error("failed to obtain a Google Cloud access token: {0}")]
    Auth(String),
}

/// A backend able to count downloads for a [`DownloadQuery`].
#[allow(async_fn_in_trait)]
pub trait QueryBackend {
    /// Run the query and return per-package counts. Packages with no
    /// downloads are absent from the result.
    async fn count_downloads(&self, query: &DownloadQuery<'_>) -> Result<MonthRecord, BackendError>;

    /// Report how many bytes the query would scan, without running it.
    async fn estimate_bytes(&self, query: &DownloadQuery<'_>) -> Result<u64, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Execute,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonthFetch {
    Counts(MonthRecord),
    Estimate { bytes: u64 },
}

#[derive(Debug, thiserror::Error)]
#[error("failed to query {month}")]
pub struct FetchError {
    pub month: Month,
    #[source]
    pub source: BackendError,
}

/// Fetch download counts for a single month.
///
/// Backend errors are not retried; they are returned tagged with the month.
pub async fn fetch_month<B: QueryBackend>(
    backend: &B,
    packages: &BTreeSet<String>,
    month: Month,
    mode: FetchMode,
) -> Result<MonthFetch, FetchError> {
    let query = DownloadQuery::for_month(packages, month);
    let tag = |source| FetchError { month, source };

    match mode {
        FetchMode::Execute => backend
            .count_downloads(&query)
            .await
            .map(MonthFetch::Counts)
            .map_err(tag),
        FetchMode::DryRun => backend
            .estimate_bytes(&query)
            .await
            .map(|bytes| MonthFetch::Estimate { bytes })
            .map_err(tag),
    }
}

/// BigQuery REST client scoped to one billing project.
pub struct BigQueryClient {
    http: reqwest::Client,
    project: String,
    location: String,
    table: String,
    token: OnceCell<String>,
}

impl BigQueryClient {
    pub fn new(project: String, config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            project,
            location: config.location.clone(),
            table: config.table.clone(),
            token: OnceCell::new(),
        }
    }

    async fn access_token(&self) -> Result<&str, BackendError> {
        self.token
            .get_or_try_init(fetch_access_token)
            .await
            .map(String::as_str)
    }

    async fn run_query(
        &self,
        query: &DownloadQuery<'_>,
        dry_run: bool,
    ) -> Result<QueryResponse, BackendError> {
        let url = format!("{}/projects/{}/queries", BIGQUERY_API_BASE, self.project);
        let request = build_request(&self.table, &self.location, query, dry_run);
        debug!(
            start = %query.start,
            end = %query.end,
            packages = query.packages.len(),
            dry_run,
            "submitting BigQuery job"
        );

        let token = self.access_token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("User-Agent", "pypi-download-stats")
            .json(&request)
            .send()
            .await?;

        parse_response(response).await
    }

    async fn query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, BackendError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            BIGQUERY_API_BASE, self.project, job.job_id
        );
        let location = job.location.as_deref().unwrap_or(&self.location);
        let timeout = QUERY_TIMEOUT_MS.to_string();

        let mut params = vec![("location", location), ("timeoutMs", timeout.as_str())];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token));
        }

        let token = self.access_token().await?;
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("User-Agent", "pypi-download-stats")
            .query(&params)
            .send()
            .await?;

        parse_response(response).await
    }
}

impl QueryBackend for BigQueryClient {
    async fn count_downloads(&self, query: &DownloadQuery<'_>) -> Result<MonthRecord, BackendError> {
        let mut response = self.run_query(query, false).await?;
        let mut record = MonthRecord::new();

        loop {
            if !response.job_complete {
                let job = response.job_reference.as_ref().ok_or_else(|| {
                    BackendError::Malformed("incomplete job without a job reference".to_string())
                })?;
                debug!(job_id = %job.job_id, "waiting for BigQuery job to complete");
                response = self.query_results(job, None).await?;
                continue;
            }

            collect_rows(&response.rows, &mut record)?;

            let Some(page_token) = response.page_token.as_deref() else {
                break;
            };
            let job = response.job_reference.as_ref().ok_or_else(|| {
                BackendError::Malformed("paged result without a job reference".to_string())
            })?;
            response = self.query_results(job, Some(page_token)).await?;
        }

        Ok(record)
    }

    async fn estimate_bytes(&self, query: &DownloadQuery<'_>) -> Result<u64, BackendError> {
        let response = self.run_query(query, true).await?;
        let bytes = response.total_bytes_processed.ok_or_else(|| {
            BackendError::Malformed("dry run did not report totalBytesProcessed".to_string())
        })?;
        bytes
            .parse()
            .map_err(|_| BackendError::Malformed(format!("invalid byte count '{}'", bytes)))
    }
}

async fn fetch_access_token() -> Result<String, BackendError> {
    if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }

    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| {
            BackendError::Auth(format!(
                "{} is not set and running gcloud failed: {}",
                TOKEN_ENV_VAR, e
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::Auth(format!(
            "gcloud auth print-access-token failed: {}",
            stderr.trim()
        )));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(BackendError::Auth(
            "gcloud auth print-access-token printed nothing".to_string(),
        ));
    }
    Ok(token)
}

async fn parse_response(response: reqwest::Response) -> Result<QueryResponse, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Api {
            status,
            message: error_message(&body),
        });
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))
}

/// Extract the human-readable message from a BigQuery error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

fn build_request<'a>(
    table: &str,
    location: &'a str,
    query: &DownloadQuery<'_>,
    dry_run: bool,
) -> QueryRequest<'a> {
    let sql = format!(
        "SELECT project, COUNT(1) AS downloads \
         FROM `{}` \
         WHERE project IN UNNEST(@projects) \
           AND DATE(timestamp) BETWEEN @start AND @end \
         GROUP BY project",
        table
    );

    QueryRequest {
        query: sql,
        use_legacy_sql: false,
        parameter_mode: "NAMED",
        query_parameters: vec![
            QueryParameter::string_array("projects", query.packages.iter().cloned().collect()),
            QueryParameter::date("start", query.start),
            QueryParameter::date("end", query.end),
        ],
        dry_run,
        use_query_cache: true,
        location,
        timeout_ms: QUERY_TIMEOUT_MS,
    }
}

fn collect_rows(rows: &[Row], record: &mut MonthRecord) -> Result<(), BackendError> {
    for row in rows {
        let [project, downloads] = row.f.as_slice() else {
            return Err(BackendError::Malformed(format!(
                "expected 2 columns, got {}",
                row.f.len()
            )));
        };

        let project = project
            .v
            .as_str()
            .ok_or_else(|| BackendError::Malformed("project column is not a string".to_string()))?;
        let downloads = downloads
            .v
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                BackendError::Malformed(format!("invalid download count for '{}'", project))
            })?;

        *record.entry(project.to_string()).or_insert(0) += downloads;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: String,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter>,
    dry_run: bool,
    use_query_cache: bool,
    location: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter {
    name: &'static str,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

impl QueryParameter {
    fn date(name: &'static str, date: NaiveDate) -> Self {
        Self {
            name,
            parameter_type: ParameterType::scalar("DATE"),
            parameter_value: ParameterValue::scalar(date.to_string()),
        }
    }

    fn string_array(name: &'static str, values: Vec<String>) -> Self {
        Self {
            name,
            parameter_type: ParameterType {
                kind: "ARRAY",
                array_type: Some(Box::new(ParameterType::scalar("STRING"))),
            },
            parameter_value: ParameterValue {
                value: None,
                array_values: Some(values.into_iter().map(ParameterValue::scalar).collect()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParameterType {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    array_type: Option<Box<ParameterType>>,
}

impl ParameterType {
    fn scalar(kind: &'static str) -> Self {
        Self {
            kind,
            array_type: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParameterValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    array_values: Option<Vec<ParameterValue>>,
}

impl ParameterValue {
    fn scalar(value: String) -> Self {
        Self {
            value: Some(value),
            array_values: None,
        }
    }
}

/// Shared shape of `jobs.query` and `jobs.getQueryResults` responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<Row>,
    page_token: Option<String>,
    total_bytes_processed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Row {
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn month(s: &str) -> Month {
        s.parse().unwrap()
    }

    #[derive(Default)]
    struct RecordingBackend {
        ranges: RefCell<Vec<(NaiveDate, NaiveDate, bool)>>,
        fail: bool,
    }

    impl QueryBackend for RecordingBackend {
        async fn count_downloads(
            &self,
            query: &DownloadQuery<'_>,
        ) -> Result<MonthRecord, BackendError> {
            self.ranges.borrow_mut().push((query.start, query.end, false));
            if self.fail {
                return Err(BackendError::Malformed("boom".to_string()));
            }
            Ok(query.packages.iter().map(|p| (p.clone(), 7)).collect())
        }

        async fn estimate_bytes(&self, query: &DownloadQuery<'_>) -> Result<u64, BackendError> {
            self.ranges.borrow_mut().push((query.start, query.end, true));
            Ok(1024)
        }
    }

    #[tokio::test]
    async fn test_fetch_month_uses_calendar_range() {
        let backend = RecordingBackend::default();
        let packages = BTreeSet::from(["a".to_string()]);

        let fetched = fetch_month(&backend, &packages, month("2024-02"), FetchMode::Execute)
            .await
            .unwrap();

        assert_eq!(
            fetched,
            MonthFetch::Counts(MonthRecord::from([("a".to_string(), 7)]))
        );
        assert_eq!(
            *backend.ranges.borrow(),
            vec![(
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
                false
            )]
        );
    }

    #[tokio::test]
    async fn test_fetch_month_dry_run_estimates_only() {
        let backend = RecordingBackend::default();
        let packages = BTreeSet::from(["a".to_string()]);

        let fetched = fetch_month(&backend, &packages, month("2024-02"), FetchMode::DryRun)
            .await
            .unwrap();

        assert_eq!(fetched, MonthFetch::Estimate { bytes: 1024 });
        assert!(backend.ranges.borrow().iter().all(|(_, _, dry)| *dry));
    }

    #[tokio::test]
    async fn test_fetch_month_error_is_tagged() {
        let backend = RecordingBackend {
            fail: true,
            ..Default::default()
        };
        let packages = BTreeSet::from(["a".to_string()]);

        let err = fetch_month(&backend, &packages, month("2023-11"), FetchMode::Execute)
            .await
            .unwrap_err();

        assert_eq!(err.month, month("2023-11"));
        assert!(matches!(err.source, BackendError::Malformed(_)));
        assert_eq!(err.to_string(), "failed to query 2023-11");
    }

    #[test]
    fn test_build_request_parameters() {
        let packages = BTreeSet::from(["alpha".to_string(), "beta".to_string()]);
        let query = DownloadQuery::for_month(&packages, month("2024-01"));
        let request = build_request("t.pypi.downloads", "US", &query, true);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["dryRun"], json!(true));
        assert_eq!(value["useLegacySql"], json!(false));
        assert_eq!(value["parameterMode"], json!("NAMED"));
        assert!(value["query"].as_str().unwrap().contains("`t.pypi.downloads`"));

        let params = value["queryParameters"].as_array().unwrap();
        assert_eq!(
            params[0],
            json!({
                "name": "projects",
                "parameterType": { "type": "ARRAY", "arrayType": { "type": "STRING" } },
                "parameterValue": { "arrayValues": [{ "value": "alpha" }, { "value": "beta" }] }
            })
        );
        assert_eq!(params[1]["parameterValue"]["value"], json!("2024-01-01"));
        assert_eq!(params[2]["parameterValue"]["value"], json!("2024-01-31"));
    }

    #[test]
    fn test_collect_rows() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "rows": [
                { "f": [{ "v": "alpha" }, { "v": "120" }] },
                { "f": [{ "v": "beta" }, { "v": "3" }] }
            ],
            "totalBytesProcessed": "5000"
        }))
        .unwrap();

        let mut record = MonthRecord::new();
        collect_rows(&response.rows, &mut record).unwrap();
        assert_eq!(
            record,
            MonthRecord::from([("alpha".to_string(), 120), ("beta".to_string(), 3)])
        );
    }

    #[test]
    fn test_collect_rows_rejects_bad_count() {
        let rows: Vec<Row> =
            serde_json::from_value(json!([{ "f": [{ "v": "alpha" }, { "v": null }] }])).unwrap();

        let err = collect_rows(&rows, &mut MonthRecord::new()).unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[test]
    fn test_incomplete_response_defaults() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobReference": { "projectId": "p", "jobId": "job_1", "location": "US" }
        }))
        .unwrap();

        assert!(!response.job_complete);
        assert!(response.rows.is_empty());
        assert_eq!(response.job_reference.unwrap().job_id, "job_1");
    }

    #[test]
    fn test_error_message() {
        let body = r#"{"error":{"code":403,"message":"Quota exceeded","status":"PERMISSION_DENIED"}}"#;
        assert_eq!(error_message(body), "Quota exceeded");
        assert_eq!(error_message("  gateway timeout \n"), "gateway timeout");
    }
}
