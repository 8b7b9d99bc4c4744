use crate::analytics::AnalyticsClient;
use crate::catalogue::FilteredCatalogue;
use crate::model::{AnalyticsRow, BucketRecord, Grid};
use crate::refreshers::{parse_bucket_timestamp, DegradationRing};
use crate::store::BucketStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pipeline_core::{Config, Error, Result};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::Refresher;

/// Owns the authoritative 10-minute grid: bootstraps it from a cold store,
/// then refreshes it every 10-minute wall-clock boundary.
pub struct TenMinuteRefresher {
    store: Arc<BucketStore>,
    analytics: Arc<AnalyticsClient>,
    catalogue: Arc<FilteredCatalogue>,
    query_id: Option<String>,
    protocol_fee_rate: Decimal,
    ring: Arc<DegradationRing>,
}

impl TenMinuteRefresher {
    pub fn new(
        store: Arc<BucketStore>,
        analytics: Arc<AnalyticsClient>,
        catalogue: Arc<FilteredCatalogue>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            analytics,
            catalogue,
            query_id: config.analytics.ten_minute_query_id.clone(),
            protocol_fee_rate: Decimal::from_str(&config.analytics.protocol_fee_rate.to_string())
                .unwrap_or(Decimal::ZERO),
            ring: Arc::new(DegradationRing::with_default_window()),
        }
    }

    /// Shared handle onto the in-memory fallback ring, consulted by
    /// `MetricsReadAPI` when the durable store is unreachable.
    pub fn degradation_ring(&self) -> Arc<DegradationRing> {
        Arc::clone(&self.ring)
    }

    /// Reads `latest_bucket(10m)`. If absent or older than 24h, backfills
    /// from `max(latest, now - 24h)` to now via one analytics run. Service
    /// readiness tolerates a partial failure as long as the store already
    /// holds history.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let latest = self.store.latest_bucket(Grid::TenMinute).await?;
        let day_ago = Utc::now() - Duration::hours(24);
        let needs_backfill = match latest {
            Some(ts) => ts < day_ago,
            None => true,
        };

        if needs_backfill {
            let start = latest.unwrap_or(day_ago).max(day_ago);
            if let Err(e) = self.backfill_range(start, None).await {
                if matches!(self.store.latest_bucket(Grid::TenMinute).await, Ok(Some(_))) {
                    warn!(error = %e, "initial backfill failed but store already has history, continuing");
                } else {
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Fetches `[now - 20min, now)` to absorb upstream lateness, splits rows
    /// into complete/incomplete by the current bucket boundary, and upserts
    /// each half with the matching `mark_complete` flag.
    #[instrument(skip(self))]
    async fn refresh_internal(&self) -> Result<()> {
        let Some(query_id) = &self.query_id else {
            debug!("ten-minute analytics query id not configured, skipping refresh");
            return Ok(());
        };

        let now = Utc::now();
        let current_bucket = Grid::TenMinute.align(now);
        let window_start = now - Duration::minutes(20);

        let mut params = std::collections::HashMap::new();
        params.insert("start_time".to_string(), window_start.to_rfc3339());
        params.insert("end_time".to_string(), now.to_rfc3339());

        let result = self.analytics.run(query_id, &params).await?;
        let rows = rows_to_records(&result.rows, &self.catalogue, self.protocol_fee_rate);

        // Kept warm regardless of whether the durable write below succeeds,
        // so a store outage doesn't also starve the in-memory fallback.
        self.ring.ingest(&rows);

        let (complete, incomplete): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|r| r.bucket_start < current_bucket);

        self.store.upsert(Grid::TenMinute, &complete, true).await?;
        self.store.upsert(Grid::TenMinute, &incomplete, false).await?;
        self.store.mark_complete(Grid::TenMinute, current_bucket).await?;

        Ok(())
    }

    /// Backfills `[start, end)` (default end = now) in one analytics run.
    /// `QuotaExceeded` is propagated unchanged so a driving backfill script
    /// can halt the whole pass.
    #[instrument(skip(self))]
    pub async fn backfill_range(&self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Result<usize> {
        let Some(query_id) = &self.query_id else {
            return Ok(0);
        };

        let end = end.unwrap_or_else(Utc::now);
        let current_bucket = Grid::TenMinute.align(Utc::now());

        let mut params = std::collections::HashMap::new();
        params.insert("start_time".to_string(), start.to_rfc3339());
        params.insert("end_time".to_string(), end.to_rfc3339());

        let result = self.analytics.run_named_backfill(query_id, &params).await?;
        let rows = rows_to_records(&result.rows, &self.catalogue, self.protocol_fee_rate);

        let (complete, incomplete): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|r| r.bucket_start < current_bucket);

        let mut inserted = self.store.upsert(Grid::TenMinute, &complete, true).await?;
        inserted += self.store.upsert(Grid::TenMinute, &incomplete, false).await?;
        Ok(inserted)
    }
}

#[async_trait]
impl Refresher for TenMinuteRefresher {
    fn name(&self) -> &str {
        "ten_minute_refresher"
    }

    async fn refresh(&self) -> Result<()> {
        self.refresh_internal().await
    }
}

fn rows_to_records(rows: &[AnalyticsRow], catalogue: &FilteredCatalogue, protocol_fee_rate: Decimal) -> Vec<BucketRecord> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match row_to_record(row, protocol_fee_rate) {
            Ok(record) if !record.is_valid() => warn!("dropping row with missing required fields"),
            Ok(record) if catalogue.is_excluded(&record.token) => {
                debug!(token = %record.token, "dropping excluded token at per-row ingest");
            }
            Ok(record) => out.push(record),
            Err(e) => warn!(error = %e, "dropping unparsable analytics row"),
        }
    }
    out
}

/// Parses one raw analytics row. `target_volume` follows the canonical rule
/// from upstream (a); when upstream reports zero, it falls back to (b)
/// `base_volume * average_price`, and failing that to fees-implied volume
/// (`usdc_fees / protocol_fee_rate`) when a fee rate is configured.
fn row_to_record(row: &AnalyticsRow, protocol_fee_rate: Decimal) -> Result<BucketRecord> {
    let token = row
        .get("token")
        .ok_or_else(|| Error::Validation("missing token".into()))?
        .clone();
    let bucket_start = parse_bucket_timestamp(
        row.get("bucket_start").ok_or_else(|| Error::Validation("missing bucket_start".into()))?,
    )?;

    let decimal = |key: &str| -> Decimal {
        row.get(key)
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::ZERO)
    };
    let optional_decimal = |key: &str| -> Option<Decimal> { row.get(key).and_then(|v| Decimal::from_str(v).ok()) };

    let trade_count = row.get("trade_count").and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    let base_volume = decimal("base_volume");
    let average_price = optional_decimal("average_price");
    let usdc_fees = optional_decimal("usdc_fees");

    let mut target_volume = decimal("target_volume");
    if target_volume.is_zero() {
        if let Some(avg_price) = average_price {
            target_volume = base_volume * avg_price;
        } else if let Some(fees) = usdc_fees {
            if protocol_fee_rate > Decimal::ZERO {
                target_volume = fees / protocol_fee_rate;
            }
        }
    }

    let mut record = BucketRecord::new(token, bucket_start, base_volume, target_volume, decimal("high"), decimal("low"), trade_count);
    record.buy_volume = optional_decimal("buy_volume");
    record.sell_volume = optional_decimal("sell_volume");
    record.average_price = average_price;
    record.usdc_fees = usdc_fees;
    record.token_fees = optional_decimal("token_fees");
    record.sell_volume_usdc = optional_decimal("sell_volume_usdc");

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::StaticCatalogue;

    fn sample_row(bucket: &str, base: &str) -> AnalyticsRow {
        let mut row = AnalyticsRow::new();
        row.insert("token".to_string(), "TOK".to_string());
        row.insert("bucket_start".to_string(), bucket.to_string());
        row.insert("base_volume".to_string(), base.to_string());
        row.insert("target_volume".to_string(), "100".to_string());
        row.insert("high".to_string(), "1.5".to_string());
        row.insert("low".to_string(), "1.1".to_string());
        row.insert("trade_count".to_string(), "4".to_string());
        row
    }

    fn no_exclusions() -> FilteredCatalogue {
        FilteredCatalogue::new(Box::new(StaticCatalogue::new(Vec::new())), &[])
    }

    #[test]
    fn converts_valid_row() {
        let rows = vec![sample_row("2026-01-07T12:30:00Z", "10")];
        let records = rows_to_records(&rows, &no_exclusions(), Decimal::ZERO);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].token, "TOK");
        assert_eq!(records[0].trade_count, 4);
    }

    #[test]
    fn drops_unparsable_row() {
        let mut row = sample_row("garbage", "10");
        row.insert("bucket_start".to_string(), "garbage".to_string());
        let records = rows_to_records(&[row], &no_exclusions(), Decimal::ZERO);
        assert!(records.is_empty());
    }

    #[test]
    fn drops_excluded_token_at_row_ingest() {
        let rows = vec![sample_row("2026-01-07T12:30:00Z", "10")];
        let catalogue = FilteredCatalogue::new(Box::new(StaticCatalogue::new(Vec::new())), &["TOK".to_string()]);
        let records = rows_to_records(&rows, &catalogue, Decimal::ZERO);
        assert!(records.is_empty());
    }

    #[test]
    fn zero_target_volume_falls_back_to_base_times_average_price() {
        let mut row = sample_row("2026-01-07T12:30:00Z", "10");
        row.insert("target_volume".to_string(), "0".to_string());
        row.insert("average_price".to_string(), "2.5".to_string());
        let records = rows_to_records(&[row], &no_exclusions(), Decimal::ZERO);
        assert_eq!(records[0].target_volume, Decimal::from(25));
    }

    #[test]
    fn zero_target_volume_falls_back_to_fees_over_fee_rate() {
        let mut row = sample_row("2026-01-07T12:30:00Z", "10");
        row.insert("target_volume".to_string(), "0".to_string());
        row.insert("usdc_fees".to_string(), "3".to_string());
        let records = rows_to_records(&[row], &no_exclusions(), Decimal::new(3, 3));
        assert_eq!(records[0].target_volume, Decimal::from(1000));
    }
}
