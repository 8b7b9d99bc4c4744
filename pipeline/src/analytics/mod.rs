mod http_backend;
mod normalize;

pub use http_backend::HttpAnalyticsBackend;
pub use normalize::normalize_scalar;

use crate::model::{AnalyticsRow, QueryResult, QueryResultMeta};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use pipeline_core::backoff::{jittered_poll_delay, retry_if_retryable};
use pipeline_core::{Config, Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// External collaborator: submits a parameterised analytical query and
/// reports on its execution. Only the interface is modelled here; query
/// execution itself happens upstream.
#[async_trait]
pub trait AnalyticsBackend: Send + Sync {
    async fn submit(&self, query_id: &str, params: &HashMap<String, String>) -> Result<String>;
    async fn poll_status(&self, execution_id: &str) -> Result<ExecutionStatus>;
    async fn fetch_results(&self, execution_id: &str) -> Result<QueryResult>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed { message: String, line: Option<u32>, column: Option<u32> },
}

struct CacheEntry {
    result: QueryResult,
    expires_at: Instant,
}

/// Typed wrapper over `AnalyticsBackend`: submits, polls to a terminal state
/// with jittered delay, and normalises every scalar in the response. Caches
/// identical `(query_id, params)` executions for `cache_ttl` to avoid
/// duplicate runs inside a single refresh cycle.
pub struct AnalyticsClient {
    backend: Box<dyn AnalyticsBackend>,
    max_poll_wait: Duration,
    poll_interval_min_secs: u64,
    poll_interval_max_secs: u64,
    cache_ttl: Duration,
    max_retries: u32,
    retry_base_delay_ms: u64,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

static EMPTY_PARAMS: Lazy<HashMap<String, String>> = Lazy::new(HashMap::new);

impl AnalyticsClient {
    pub fn new(backend: Box<dyn AnalyticsBackend>, config: &Config) -> Self {
        Self {
            backend,
            max_poll_wait: Duration::from_secs(config.analytics.max_poll_wait_secs),
            poll_interval_min_secs: config.analytics.poll_interval_min_secs,
            poll_interval_max_secs: config.analytics.poll_interval_max_secs,
            cache_ttl: Duration::from_secs(config.analytics.cache_ttl_secs),
            max_retries: config.analytics.max_retries,
            retry_base_delay_ms: config.analytics.retry_base_delay_ms,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// `idle -> submitted -> polling -> completed/failed/timed-out`, per
    /// execution. Polling sleeps a randomised interval between checks.
    #[instrument(skip(self, params), fields(query_id))]
    pub async fn run(&self, query_id: &str, params: &HashMap<String, String>) -> Result<QueryResult> {
        let cache_key = Self::cache_key(query_id, params);
        if let Some(cached) = self.cached(&cache_key) {
            debug!(query_id, "analytics cache hit");
            return Ok(cached);
        }

        let execution_id =
            retry_if_retryable(|| self.backend.submit(query_id, params), self.max_retries, self.retry_base_delay_ms, "analytics_submit")
                .await?;
        let deadline = Instant::now() + self.max_poll_wait;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::QueryTimeout {
                    elapsed_secs: self.max_poll_wait.as_secs(),
                });
            }

            let status = retry_if_retryable(
                || self.backend.poll_status(&execution_id),
                self.max_retries,
                self.retry_base_delay_ms,
                "analytics_poll",
            )
            .await?;

            match status {
                ExecutionStatus::Completed => {
                    let result = retry_if_retryable(
                        || self.backend.fetch_results(&execution_id),
                        self.max_retries,
                        self.retry_base_delay_ms,
                        "analytics_fetch_results",
                    )
                    .await?;
                    let normalised = Self::normalize_result(result);
                    self.insert_cache(cache_key, normalised.clone());
                    return Ok(normalised);
                }
                ExecutionStatus::Failed { message, line, column } => {
                    return Err(Error::UpstreamQueryFailed { message, line, column });
                }
                ExecutionStatus::Running => {
                    jittered_poll_delay(self.poll_interval_min_secs, self.poll_interval_max_secs).await;
                }
            }
        }
    }

    /// Same shape as `run`, used for historical-window queries driven by a
    /// backfill pass; kept distinct so callers can be explicit about intent.
    pub async fn run_named_backfill(&self, query_id: &str, params: &HashMap<String, String>) -> Result<QueryResult> {
        self.run(query_id, params).await
    }

    fn normalize_result(result: QueryResult) -> QueryResult {
        let rows: Vec<AnalyticsRow> = result
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k, normalize_scalar(&v))).collect())
            .collect();
        QueryResult { rows, meta: result.meta }
    }

    fn cache_key(query_id: &str, params: &HashMap<String, String>) -> String {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        let mut out = String::from(query_id);
        for k in keys {
            out.push('|');
            out.push_str(k);
            out.push('=');
            out.push_str(&params[k]);
        }
        out
    }

    fn cached(&self, key: &str) -> Option<QueryResult> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.result.clone())
        } else {
            None
        }
    }

    fn insert_cache(&self, key: String, result: QueryResult) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            key,
            CacheEntry {
                result,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }

    pub fn empty_params() -> &'static HashMap<String, String> {
        &EMPTY_PARAMS
    }
}

impl Clone for QueryResult {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows.clone(),
            meta: QueryResultMeta {
                execution_time_ms: self.meta.execution_time_ms,
                total_rows: self.meta.total_rows,
            },
        }
    }
}

/// Classifies an HTTP-level failure from the upstream backend into the error
/// taxonomy used throughout the pipeline.
pub fn classify_http_error(status: u16, body: &str) -> Error {
    match status {
        401 => Error::UpstreamAuth(body.to_string()),
        402 => Error::UpstreamQuota { retry_after_secs: None },
        429 => Error::UpstreamTransient(format!("status {status}: {body}")),
        500..=599 => Error::UpstreamTransient(format!("status {status}: {body}")),
        _ => {
            warn!(status, "unclassified upstream error, treating as transient");
            Error::UpstreamTransient(format!("status {status}: {body}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackend {
        polls_until_complete: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnalyticsBackend for StubBackend {
        async fn submit(&self, _query_id: &str, _params: &HashMap<String, String>) -> Result<String> {
            Ok("exec-1".to_string())
        }

        async fn poll_status(&self, _execution_id: &str) -> Result<ExecutionStatus> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.polls_until_complete {
                Ok(ExecutionStatus::Completed)
            } else {
                Ok(ExecutionStatus::Running)
            }
        }

        async fn fetch_results(&self, _execution_id: &str) -> Result<QueryResult> {
            let mut row = HashMap::new();
            row.insert("volume".to_string(), "3.2E2".to_string());
            Ok(QueryResult {
                rows: vec![row],
                meta: QueryResultMeta { execution_time_ms: 10, total_rows: 1 },
            })
        }
    }

    fn test_config() -> Config {
        let mut c = Config::default();
        c.analytics.poll_interval_min_secs = 0;
        c.analytics.poll_interval_max_secs = 0;
        c.analytics.max_poll_wait_secs = 5;
        c
    }

    #[tokio::test]
    async fn normalises_scientific_notation_rows() {
        let backend = StubBackend { polls_until_complete: 0, calls: AtomicUsize::new(0) };
        let client = AnalyticsClient::new(Box::new(backend), &test_config());

        let result = client.run("q1", &HashMap::new()).await.unwrap();
        assert_eq!(result.rows[0]["volume"], "320");
    }

    #[tokio::test]
    async fn caches_identical_params() {
        let backend = StubBackend { polls_until_complete: 0, calls: AtomicUsize::new(0) };
        let client = AnalyticsClient::new(Box::new(backend), &test_config());

        client.run("q1", &HashMap::new()).await.unwrap();
        let second = client.run("q1", &HashMap::new()).await.unwrap();
        assert_eq!(second.rows[0]["volume"], "320");
    }

    #[test]
    fn classifies_auth_and_quota_errors() {
        assert!(matches!(classify_http_error(401, ""), Error::UpstreamAuth(_)));
        assert!(matches!(classify_http_error(402, ""), Error::UpstreamQuota { .. }));
        assert!(matches!(classify_http_error(503, ""), Error::UpstreamTransient(_)));
    }
}
