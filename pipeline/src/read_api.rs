use crate::model::{BucketAggregate, Grid};
use crate::refreshers::DegradationRing;
use crate::status::StatusReporter;
use crate::store::BucketStore;
use pipeline_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

struct Snapshot {
    data: HashMap<String, BucketAggregate>,
    taken_at: Instant,
}

/// Serves rolling-24h metrics, tiered: live 10-minute grid first, then
/// hourly, then the in-memory degradation ring, then a cached
/// snapshot, then empty. Each output row is keyed by `pool_id` via the
/// caller-supplied `token -> pool_id` index.
pub struct MetricsReadAPI {
    store: Arc<BucketStore>,
    ring: Arc<DegradationRing>,
    status: StatusReporter,
    cache: Mutex<Option<Snapshot>>,
}

impl MetricsReadAPI {
    pub fn new(store: Arc<BucketStore>, ring: Arc<DegradationRing>, status: StatusReporter) -> Self {
        Self { store, ring, status, cache: Mutex::new(None) }
    }

    #[instrument(skip(self, tokens, token_to_pool))]
    pub async fn rolling_24h(
        &self,
        tokens: &[String],
        token_to_pool: &HashMap<String, String>,
    ) -> Result<HashMap<String, BucketAggregate>> {
        match self.store.rolling_24h(Grid::TenMinute, tokens).await {
            Ok(ten_min) if !ten_min.is_empty() => {
                self.status.mark_degraded("bucket_store", false);
                self.remember(&ten_min);
                return Ok(key_by_pool(ten_min, token_to_pool));
            }
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "ten-minute grid unreachable, falling back");
                self.status.mark_degraded("bucket_store", true);
            }
            Err(e) => return Err(e),
        }

        match self.store.rolling_24h(Grid::Hourly, tokens).await {
            Ok(hourly) if !hourly.is_empty() => {
                self.status.mark_degraded("bucket_store", false);
                self.remember(&hourly);
                return Ok(key_by_pool(hourly, token_to_pool));
            }
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "hourly grid unreachable, falling back");
                self.status.mark_degraded("bucket_store", true);
            }
            Err(e) => return Err(e),
        }

        let from_ring = self.ring.rolling_24h(tokens);
        if !from_ring.is_empty() {
            debug!("serving rolling-24h metrics from in-memory degradation ring");
            return Ok(key_by_pool(from_ring, token_to_pool));
        }

        if let Some(snapshot) = self.cached_snapshot() {
            debug!("serving rolling-24h metrics from cached snapshot");
            return Ok(key_by_pool(snapshot, token_to_pool));
        }

        warn!("no 10-minute, hourly, ring, or cached data available; returning empty metrics");
        Ok(HashMap::new())
    }

    fn remember(&self, data: &HashMap<String, BucketAggregate>) {
        let mut cache = self.cache.lock().unwrap();
        *cache = Some(Snapshot { data: data.clone(), taken_at: Instant::now() });
    }

    fn cached_snapshot(&self) -> Option<HashMap<String, BucketAggregate>> {
        let cache = self.cache.lock().unwrap();
        cache.as_ref().map(|s| s.data.clone())
    }

    /// Age of the in-memory fallback snapshot, for status reporting.
    pub fn snapshot_age(&self) -> Option<Duration> {
        let cache = self.cache.lock().unwrap();
        cache.as_ref().map(|s| s.taken_at.elapsed())
    }
}

fn key_by_pool(
    by_token: HashMap<String, BucketAggregate>,
    token_to_pool: &HashMap<String, String>,
) -> HashMap<String, BucketAggregate> {
    by_token
        .into_iter()
        .filter_map(|(token, agg)| token_to_pool.get(&token).map(|pool_id| (pool_id.clone(), agg)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_by_pool_drops_unmapped_tokens() {
        let mut by_token = HashMap::new();
        by_token.insert("TOK".to_string(), BucketAggregate::default());
        by_token.insert("UNMAPPED".to_string(), BucketAggregate::default());

        let mut map = HashMap::new();
        map.insert("TOK".to_string(), "pool-1".to_string());

        let result = key_by_pool(by_token, &map);
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("pool-1"));
    }
}
