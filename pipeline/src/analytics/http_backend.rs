use super::{classify_http_error, AnalyticsBackend, ExecutionStatus};
use crate::model::{AnalyticsRow, QueryResult, QueryResultMeta};
use async_trait::async_trait;
use pipeline_core::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;

/// Production `AnalyticsBackend`: submits a query, polls its status, and
/// fetches results over a REST execute/status/results protocol, the same
/// async-execution shape the Redshift/Athena-style backends this pipeline
/// targets expose. The backend's own query engine is out of scope here; this
/// is just the HTTP edge of the submit/poll/fetch execution state machine.
pub struct HttpAnalyticsBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAnalyticsBackend {
    pub fn new(base_url: String, api_key: String, fetch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { client, base_url, api_key })
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "execution_id", alias = "executionId")]
    execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
enum StatusResponse {
    #[serde(rename = "RUNNING", alias = "running", alias = "SUBMITTED", alias = "submitted")]
    Running,
    #[serde(rename = "COMPLETED", alias = "completed", alias = "SUCCEEDED", alias = "succeeded")]
    Completed,
    #[serde(rename = "FAILED", alias = "failed")]
    Failed {
        #[serde(default)]
        message: String,
        #[serde(default)]
        line: Option<u32>,
        #[serde(default)]
        column: Option<u32>,
    },
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    rows: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    execution_time_ms: u64,
    #[serde(default)]
    total_rows: Option<usize>,
}

#[async_trait]
impl AnalyticsBackend for HttpAnalyticsBackend {
    #[instrument(skip(self, params), fields(query_id))]
    async fn submit(&self, query_id: &str, params: &HashMap<String, String>) -> Result<String> {
        let url = format!("{}/queries/{}/execute", self.base_url, query_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(params)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }

        let body: SubmitResponse = resp.json().await.map_err(Error::Http)?;
        Ok(body.execution_id)
    }

    #[instrument(skip(self))]
    async fn poll_status(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let url = format!("{}/executions/{}/status", self.base_url, execution_id);
        let resp = self.client.get(&url).bearer_auth(&self.api_key).send().await.map_err(classify_transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }

        let body: StatusResponse = resp.json().await.map_err(Error::Http)?;
        Ok(match body {
            StatusResponse::Running => ExecutionStatus::Running,
            StatusResponse::Completed => ExecutionStatus::Completed,
            StatusResponse::Failed { message, line, column } => ExecutionStatus::Failed { message, line, column },
        })
    }

    #[instrument(skip(self))]
    async fn fetch_results(&self, execution_id: &str) -> Result<QueryResult> {
        let url = format!("{}/executions/{}/results", self.base_url, execution_id);
        let resp = self.client.get(&url).bearer_auth(&self.api_key).send().await.map_err(classify_transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }

        let body: ResultsResponse = resp.json().await.map_err(Error::Http)?;
        let total_rows = body.total_rows.unwrap_or(body.rows.len());
        let rows: Vec<AnalyticsRow> = body
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k, scalar_to_string(v))).collect())
            .collect();

        Ok(QueryResult { rows, meta: QueryResultMeta { execution_time_ms: body.execution_time_ms, total_rows } })
    }
}

fn scalar_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Connection resets, DNS failures, and client-side timeouts are all
/// transient from the caller's point of view.
fn classify_transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() {
        Error::UpstreamTransient(err.to_string())
    } else {
        Error::Http(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_scalar_becomes_empty_string() {
        assert_eq!(scalar_to_string(serde_json::Value::Null), "");
    }

    #[test]
    fn numeric_scalar_round_trips_as_string() {
        assert_eq!(scalar_to_string(serde_json::json!(3.2e5)), "320000.0");
    }
}
