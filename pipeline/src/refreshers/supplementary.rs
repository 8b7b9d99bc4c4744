use crate::analytics::AnalyticsClient;
use crate::model::{AnalyticsRow, SupplementaryRecord, SupplementaryTable};
use crate::store::BucketStore;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use pipeline_core::{Config, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::Refresher;

/// Daily upstream pull into one of the two supplementary tables. Each
/// instance is independent of the main 10-minute/hourly/daily pipeline and
/// keyed by `(token, date)`.
pub struct SupplementaryFetcher {
    store: Arc<BucketStore>,
    analytics: Arc<AnalyticsClient>,
    table: SupplementaryTable,
    query_id: Option<String>,
    genesis_date: NaiveDate,
    /// Resolves an owner address to a base token; only used by the
    /// external-pool source, whose rows arrive keyed by owner rather than
    /// token. Unknown owners are dropped with a warning.
    owner_to_token: HashMap<String, String>,
}

impl SupplementaryFetcher {
    pub fn new(
        store: Arc<BucketStore>,
        analytics: Arc<AnalyticsClient>,
        table: SupplementaryTable,
        query_id: Option<String>,
        config: &Config,
        owner_to_token: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            analytics,
            table,
            query_id,
            genesis_date: config.default_backfill_start().date_naive(),
            owner_to_token,
        }
    }

    /// On an empty table, backfills from the genesis date; otherwise only
    /// fetches incremental days. Today's row is always re-fetched and left
    /// incomplete until the day boundary passes.
    #[instrument(skip(self), fields(table = ?self.table))]
    pub async fn initialize(&self) -> Result<()> {
        let latest = self.store.latest_supplementary_date(self.table).await?;
        let start = match latest {
            Some(d) => d,
            None => self.genesis_date,
        };
        self.fetch_range(start, Utc::now().date_naive()).await
    }

    #[instrument(skip(self), fields(table = ?self.table))]
    async fn refresh_internal(&self) -> Result<()> {
        let latest = self.store.latest_supplementary_date(self.table).await?;
        let today = Utc::now().date_naive();
        let start = latest.unwrap_or(today);
        self.fetch_range(start, today).await
    }

    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        let Some(query_id) = &self.query_id else {
            debug!(table = ?self.table, "supplementary query id not configured, skipping");
            return Ok(());
        };

        let mut params = HashMap::new();
        params.insert("start_date".to_string(), start.to_string());
        params.insert("end_date".to_string(), end.to_string());

        let result = self.analytics.run(query_id, &params).await?;
        let today = Utc::now().date_naive();
        let records = rows_to_records(&result.rows, self.table, &self.owner_to_token, today);

        let (complete, incomplete): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| r.is_complete);

        self.store.upsert_supplementary(self.table, &complete, true).await?;
        self.store.upsert_supplementary(self.table, &incomplete, false).await?;
        Ok(())
    }
}

fn rows_to_records(
    rows: &[AnalyticsRow],
    table: SupplementaryTable,
    owner_to_token: &HashMap<String, String>,
    today: NaiveDate,
) -> Vec<SupplementaryRecord> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(date_raw) = row.get("date") else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d") else {
            warn!(raw = date_raw, "dropping supplementary row with unparsable date");
            continue;
        };

        let token = if matches!(table, SupplementaryTable::ExternalPool) {
            match row.get("owner").and_then(|owner| owner_to_token.get(owner)) {
                Some(token) => token.clone(),
                None => {
                    warn!(
                        owner = row.get("owner").map(String::as_str).unwrap_or(""),
                        "unknown owner address, dropping row"
                    );
                    continue;
                }
            }
        } else {
            match row.get("token") {
                Some(t) => t.clone(),
                None => continue,
            }
        };

        let buy = row.get("buy_volume").and_then(|v| Decimal::from_str(v).ok()).unwrap_or(Decimal::ZERO);
        let sell = row.get("sell_volume").and_then(|v| Decimal::from_str(v).ok()).unwrap_or(Decimal::ZERO);

        let mut record = SupplementaryRecord::new(token, date, buy, sell);
        record.is_complete = date < today;
        out.push(record);
    }
    out
}

#[async_trait]
impl Refresher for SupplementaryFetcher {
    fn name(&self) -> &str {
        match self.table {
            SupplementaryTable::BuySell => "buy_sell_fetcher",
            SupplementaryTable::ExternalPool => "external_pool_fetcher",
        }
    }

    async fn refresh(&self) -> Result<()> {
        self.refresh_internal().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: &str, token_field: &str, token_value: &str) -> AnalyticsRow {
        let mut row = AnalyticsRow::new();
        row.insert("date".to_string(), date.to_string());
        row.insert(token_field.to_string(), token_value.to_string());
        row.insert("buy_volume".to_string(), "10".to_string());
        row.insert("sell_volume".to_string(), "5".to_string());
        row
    }

    #[test]
    fn drops_unknown_owner_for_external_pool() {
        let mut map = HashMap::new();
        map.insert("owner-1".to_string(), "TOK".to_string());

        let rows = vec![
            row("2026-01-01", "owner", "owner-1"),
            row("2026-01-01", "owner", "owner-unknown"),
        ];
        let records = rows_to_records(
            &rows,
            SupplementaryTable::ExternalPool,
            &map,
            NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].token, "TOK");
    }
}
