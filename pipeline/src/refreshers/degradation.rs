use crate::model::{BucketAggregate, BucketRecord};
use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// In-memory bounded history a refresher falls back to when `BucketStore` is
/// unreachable. Every fetched row is ingested here regardless of
/// whether the durable write succeeded, so the ring stays warm through an
/// outage instead of only capturing rows written *during* one.
///
/// This is a correctness-preserving fallback, not a steady-state mode: once
/// the store recovers, reads resume from it and the ring simply ages out.
pub struct DegradationRing {
    window: Duration,
    entries: Mutex<HashMap<String, VecDeque<BucketRecord>>>,
}

impl DegradationRing {
    pub fn new(window: Duration) -> Self {
        Self { window, entries: Mutex::new(HashMap::new()) }
    }

    /// 48-hour ring, wide enough to cover a day's worth of rolling reads.
    pub fn with_default_window() -> Self {
        Self::new(Duration::hours(48))
    }

    pub fn ingest(&self, rows: &[BucketRecord]) {
        if rows.is_empty() {
            return;
        }
        let cutoff = Utc::now() - self.window;
        let mut entries = self.entries.lock().unwrap();
        for row in rows {
            let bucket = entries.entry(row.token.clone()).or_default();
            match bucket.iter_mut().find(|r| r.bucket_start == row.bucket_start) {
                Some(existing) => *existing = row.clone(),
                None => bucket.push_back(row.clone()),
            }
        }
        for bucket in entries.values_mut() {
            bucket.make_contiguous().sort_by_key(|r| r.bucket_start);
            while bucket.front().is_some_and(|r| r.bucket_start < cutoff) {
                bucket.pop_front();
            }
        }
    }

    /// Rolling 24h fold over whatever the ring currently holds for each
    /// requested token. Empty `tokens` returns every token the ring knows
    /// about.
    pub fn rolling_24h(&self, tokens: &[String]) -> HashMap<String, BucketAggregate> {
        let day_ago = Utc::now() - Duration::hours(24);
        let entries = self.entries.lock().unwrap();
        let mut out = HashMap::new();

        let wanted: Box<dyn Fn(&String) -> bool> = if tokens.is_empty() {
            Box::new(|_: &String| true)
        } else {
            let set: std::collections::HashSet<&String> = tokens.iter().collect();
            Box::new(move |t: &String| set.contains(t))
        };

        for (token, bucket) in entries.iter() {
            if !wanted(token) {
                continue;
            }
            let recent: Vec<BucketRecord> = bucket.iter().filter(|r| r.bucket_start >= day_ago).cloned().collect();
            if recent.is_empty() {
                continue;
            }
            out.insert(token.clone(), BucketAggregate::from_rows(&recent));
        }

        if !out.is_empty() {
            debug!(tokens = out.len(), "served rolling-24h metrics from in-memory degradation ring");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn record(token: &str, minutes_ago: i64) -> BucketRecord {
        BucketRecord::new(
            token.to_string(),
            Utc::now() - Duration::minutes(minutes_ago),
            Decimal::from(10),
            Decimal::from(100),
            Decimal::from(2),
            Decimal::from(1),
            5,
        )
    }

    #[test]
    fn ingests_and_folds_within_window() {
        let ring = DegradationRing::with_default_window();
        ring.ingest(&[record("TOK", 10), record("TOK", 20)]);

        let agg = ring.rolling_24h(&["TOK".to_string()]);
        assert_eq!(agg["TOK"].trade_count, 10);
    }

    #[test]
    fn prunes_entries_older_than_window() {
        let ring = DegradationRing::new(Duration::hours(1));
        ring.ingest(&[record("TOK", 30)]);
        ring.ingest(&[record("TOK", 90)]);

        let agg = ring.rolling_24h(&["TOK".to_string()]);
        assert_eq!(agg["TOK"].trade_count, 5);
    }

    #[test]
    fn reingesting_same_bucket_replaces_rather_than_duplicates() {
        let ring = DegradationRing::with_default_window();
        let first = record("TOK", 10);
        let mut second = first.clone();
        second.trade_count = 9;

        ring.ingest(&[first]);
        ring.ingest(&[second]);

        let agg = ring.rolling_24h(&["TOK".to_string()]);
        assert_eq!(agg["TOK"].trade_count, 9);
    }

    #[test]
    fn unfiltered_query_returns_every_token() {
        let ring = DegradationRing::with_default_window();
        ring.ingest(&[record("AAA", 5), record("BBB", 5)]);

        let agg = ring.rolling_24h(&[]);
        assert_eq!(agg.len(), 2);
    }
}
